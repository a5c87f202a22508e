//! Windows-specific path and privilege support.
//!
//! The engine talks to the filesystem through verbatim (`\\?\`) paths so
//! trees deeper than the legacy 260-character limit migrate cleanly. Child
//! processes never see the verbatim form.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf, Prefix};

use walkdir::WalkDir;
use windows::{
    core::PCWSTR,
    Win32::{
        Foundation::{CloseHandle, BOOL, HANDLE, LUID},
        Security::{
            LookupPrivilegeValueW, PrivilegeCheck, LUID_AND_ATTRIBUTES, PRIVILEGE_SET,
            SE_PRIVILEGE_ENABLED, TOKEN_QUERY,
        },
        System::Threading::{GetCurrentProcess, OpenProcessToken},
    },
};

use crate::errors::EngineError;

/// Rewrite an absolute path into its `\\?\` long-path form.
///
/// Dispatches on the parsed path prefix: already-verbatim paths pass through,
/// UNC paths become `\\?\UNC\server\share\...`, and drive paths get the plain
/// sentinel. Relative, drive-relative, and device paths are returned as
/// given; callers absolutize before asking for the long form.
pub fn ensure_long_path(path: &Path) -> PathBuf {
    let Some(Component::Prefix(prefix)) = path.components().next() else {
        return path.to_path_buf();
    };
    match prefix.kind() {
        Prefix::Verbatim(_) | Prefix::VerbatimUNC(..) | Prefix::VerbatimDisk(_) => {
            path.to_path_buf()
        }
        Prefix::UNC(server, share) => {
            // The verbatim layer takes every component literally, so any
            // `.`/`..` must be resolved before the prefix goes on.
            let tail: PathBuf = resolve_dots(path).components().skip(2).collect();
            let mut verbatim = PathBuf::from(r"\\?\UNC");
            verbatim.push(server);
            verbatim.push(share);
            if !tail.as_os_str().is_empty() {
                verbatim.push(tail);
            }
            verbatim
        }
        Prefix::Disk(_) if path.is_absolute() => {
            let resolved = resolve_dots(path);
            if let Some(Component::Prefix(p)) = resolved.components().next() {
                if p.kind().is_verbatim() {
                    return resolved;
                }
            }
            let mut raw = OsString::from(r"\\?\");
            raw.push(resolved.as_os_str());
            PathBuf::from(raw)
        }
        _ => path.to_path_buf(),
    }
}

/// Lexically resolve `.` and `..` without requiring the path to exist.
fn resolve_dots(path: &Path) -> PathBuf {
    use normpath::PathExt;
    match path.normalize() {
        Ok(resolved) => resolved.into_path_buf(),
        Err(_) => path.to_path_buf(),
    }
}

/// Strip the read-only attribute from everything under `root`, best effort.
///
/// Runs ahead of recursive deletes, where a single read-only entry would
/// otherwise stop the removal. Unreadable entries are skipped.
#[allow(clippy::permissions_set_readonly_false)]
pub fn clear_readonly_recursive(root: &Path) {
    for entry in WalkDir::new(root).follow_links(false).into_iter().flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let mut perms = metadata.permissions();
        if perms.readonly() {
            perms.set_readonly(false);
            let _ = fs::set_permissions(entry.path(), perms);
        }
    }
}

fn wide_nul(path: &Path) -> Vec<u16> {
    use std::os::windows::ffi::OsStrExt;
    let mut wide: Vec<u16> = path.as_os_str().encode_wide().collect();
    wide.push(0);
    wide
}

/// Create a directory symbolic link at `link` pointing to `target`.
pub fn create_dir_symlink(link: &Path, target: &Path) -> io::Result<()> {
    use windows::Win32::Storage::FileSystem::{
        CreateSymbolicLinkW, SYMBOLIC_LINK_FLAG_DIRECTORY,
    };

    let link_wide = wide_nul(link);
    let target_wide = wide_nul(target);
    // SAFETY: both buffers are NUL-terminated and live across the call.
    let created = unsafe {
        CreateSymbolicLinkW(
            PCWSTR(link_wide.as_ptr()),
            PCWSTR(target_wide.as_ptr()),
            SYMBOLIC_LINK_FLAG_DIRECTORY,
        )
    };
    if created.as_bool() {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Process token opened for privilege queries; closed on drop.
struct ProcessToken(HANDLE);

impl ProcessToken {
    fn open_for_query() -> windows::core::Result<Self> {
        let mut raw = HANDLE::default();
        // SAFETY: `raw` outlives the call and becomes owned by the wrapper.
        unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut raw) }?;
        Ok(Self(raw))
    }
}

impl Drop for ProcessToken {
    fn drop(&mut self) {
        // SAFETY: the handle came from OpenProcessToken and is closed once.
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// Check that the process may create directory symlinks.
///
/// Symlink creation needs `SeCreateSymbolicLinkPrivilege` (held by elevated
/// processes, or everyone under Developer Mode). Every failure mode maps to
/// `PrivilegeDenied` so the caller reports one error kind.
pub fn require_symlink_privilege() -> Result<(), EngineError> {
    let privilege = windows::core::w!("SeCreateSymbolicLinkPrivilege");

    let token = ProcessToken::open_for_query()
        .map_err(|err| EngineError::PrivilegeDenied(format!("query process token: {err}")))?;

    let mut luid = LUID::default();
    // SAFETY: `luid` outlives the call; the privilege name is a static wide
    // string.
    unsafe { LookupPrivilegeValueW(None, privilege, &mut luid) }
        .map_err(|err| EngineError::PrivilegeDenied(format!("resolve privilege: {err}")))?;

    let mut wanted = PRIVILEGE_SET {
        PrivilegeCount: 1,
        Control: 0,
        Privilege: [LUID_AND_ATTRIBUTES {
            Luid: luid,
            Attributes: SE_PRIVILEGE_ENABLED,
        }],
    };
    let mut held = BOOL(0);
    // SAFETY: every pointer references a stack slot that outlives the call.
    unsafe { PrivilegeCheck(token.0, &mut wanted, &mut held) }
        .map_err(|err| EngineError::PrivilegeDenied(format!("privilege check: {err}")))?;

    if held.as_bool() {
        Ok(())
    } else {
        Err(EngineError::PrivilegeDenied(
            "SeCreateSymbolicLinkPrivilege is not held by this process".into(),
        ))
    }
}
