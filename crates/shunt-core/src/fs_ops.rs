//! Retry-hardened filesystem primitives.
//!
//! Every syscall the engine makes goes through `normalize`, which absolutizes
//! and (on Windows) applies the `\\?\` long-path prefix so deep trees survive
//! the legacy 260-character limit. External child processes get raw paths
//! instead; see the archiver module.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use filetime::FileTime;

use crate::errors::{categorize_io_error, EngineError, ErrorCategory};

pub const REMOVE_ATTEMPTS: u32 = 5;
pub const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(200);
pub const COPY_ATTEMPTS: u32 = 3;
pub const COPY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Absolutize and long-path-prefix a path for engine-internal syscalls.
#[cfg(windows)]
pub fn normalize(path: &Path) -> PathBuf {
    let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    crate::win_fs::ensure_long_path(&abs)
}

/// Absolutize a path for engine-internal syscalls.
#[cfg(not(windows))]
pub fn normalize(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Drop the read-only bit on a single path, best effort.
#[allow(clippy::permissions_set_readonly_false)]
fn clear_readonly(path: &Path) {
    if let Ok(metadata) = fs::metadata(path) {
        if metadata.permissions().readonly() {
            let mut perms = metadata.permissions();
            perms.set_readonly(false);
            let _ = fs::set_permissions(path, perms);
        }
    }
}

/// Delete a file, clearing the read-only attribute and retrying on failure.
///
/// Returns `true` on success. A missing file counts as success so concurrent
/// deleters stay idempotent. Exhaustion reports `false` rather than raising;
/// callers decide whether a leftover source file fails the task.
pub fn remove_file_retrying(path: &Path, attempts: u32, delay: Duration) -> bool {
    let target = normalize(path);
    for attempt in 1..=attempts.max(1) {
        clear_readonly(&target);
        match fs::remove_file(&target) {
            Ok(()) => return true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return true,
            Err(err) => {
                log::debug!(
                    "remove {} failed (attempt {attempt}/{attempts}): {err}",
                    path.display()
                );
                if attempt < attempts {
                    std::thread::sleep(delay);
                }
            }
        }
    }
    false
}

/// Metadata-preserving copy with retry on transient IO errors.
///
/// Returns the byte count. The source mtime is carried over so copies are
/// distinguishable from edits. Fatal errors propagate immediately; transient
/// ones are retried up to `attempts` and the last error propagates.
pub fn copy_large_retrying(src: &Path, dst: &Path, attempts: u32, delay: Duration) -> Result<u64> {
    let nsrc = normalize(src);
    let ndst = normalize(dst);
    let mut last_err: Option<io::Error> = None;
    for attempt in 1..=attempts.max(1) {
        match fs::copy(&nsrc, &ndst) {
            Ok(bytes) => {
                preserve_mtime(&nsrc, &ndst);
                return Ok(bytes);
            }
            Err(err) => {
                let transient = categorize_io_error(&err) == ErrorCategory::Transient;
                log::debug!(
                    "copy {} failed (attempt {attempt}/{attempts}): {err}",
                    src.display()
                );
                if !transient {
                    return Err(EngineError::IoFatal {
                        path: src.to_path_buf(),
                        source: err,
                    }
                    .into());
                }
                last_err = Some(err);
                if attempt < attempts {
                    std::thread::sleep(delay);
                }
            }
        }
    }
    Err(EngineError::IoFatal {
        path: src.to_path_buf(),
        source: last_err.unwrap_or_else(|| io::Error::other("copy retries exhausted")),
    }
    .into())
}

fn preserve_mtime(src: &Path, dst: &Path) {
    if let Ok(metadata) = fs::metadata(src) {
        if let Ok(modified) = metadata.modified() {
            let _ = filetime::set_file_mtime(dst, FileTime::from_system_time(modified));
        }
    }
}

/// Move one file across volumes: rename first, copy-then-delete fallback.
///
/// Returns the byte count moved.
pub fn move_file(src: &Path, dst: &Path) -> Result<u64> {
    let nsrc = normalize(src);
    let ndst = normalize(dst);
    let size = fs::metadata(&nsrc)
        .with_context(|| format!("stat {}", src.display()))?
        .len();

    if fs::rename(&nsrc, &ndst).is_ok() {
        return Ok(size);
    }

    // Cross-device renames fail; fall back to a copy plus retried delete.
    copy_large_retrying(src, dst, COPY_ATTEMPTS, COPY_RETRY_DELAY)?;
    if !remove_file_retrying(src, REMOVE_ATTEMPTS, REMOVE_RETRY_DELAY) {
        anyhow::bail!("moved {} but could not remove the source copy", src.display());
    }
    Ok(size)
}

/// Remove directories that became empty after their files were deleted.
///
/// For each unique parent of `seeds`, walk upward deleting while the
/// directory is empty, stopping at the first non-empty ancestor or at
/// `stop_at`. `stop_at` itself is never deleted.
pub fn reclaim_empty_dirs<'a, I>(seeds: I, stop_at: &Path)
where
    I: IntoIterator<Item = &'a Path>,
{
    let stop = normalize(stop_at);
    let mut starts: Vec<PathBuf> = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    for seed in seeds {
        if let Some(parent) = normalize(seed).parent() {
            if seen.insert(parent.to_path_buf()) {
                starts.push(parent.to_path_buf());
            }
        }
    }

    let mut visited: HashSet<PathBuf> = HashSet::new();
    for start in starts {
        let mut current = Some(start);
        while let Some(dir) = current {
            if dir == stop || !dir.starts_with(&stop) {
                break;
            }
            if !visited.insert(dir.clone()) {
                break;
            }
            // remove_dir refuses non-empty directories, which is exactly the
            // emptiness check we want.
            match fs::remove_dir(&dir) {
                Ok(()) => current = dir.parent().map(Path::to_path_buf),
                Err(_) => break,
            }
        }
    }
}

/// Remove a whole tree.
///
/// On Windows a single `rd /s /q` shell invocation is preferred: one child
/// process instead of one syscall per file, and far fewer on-access scans.
/// Falls back to the language-native recursive delete.
pub fn remove_tree(path: &Path) -> bool {
    if !path.exists() {
        return true;
    }

    #[cfg(windows)]
    {
        // rd wants the raw path, not the verbatim form.
        let status = std::process::Command::new("cmd")
            .args(["/d", "/c", "rd", "/s", "/q"])
            .arg(path)
            .status();
        if matches!(status, Ok(s) if s.success()) && !path.exists() {
            return true;
        }
        crate::win_fs::clear_readonly_recursive(path);
    }

    match fs::remove_dir_all(normalize(path)) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            log::debug!("remove tree {} failed: {err}", path.display());
            !path.exists()
        }
    }
}

/// Write `bytes` to a sibling temp file, then atomically replace `path`.
pub fn replace_file_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let target = normalize(path);
    let mut tmp_name = target.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    fs::write(&tmp, bytes)?;

    #[cfg(windows)]
    if target.exists() {
        // MoveFileEx without the replace flag refuses existing targets.
        let _ = fs::remove_file(&target);
    }
    fs::rename(&tmp, &target)
}
