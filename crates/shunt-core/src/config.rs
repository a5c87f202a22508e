//! Migration configuration record.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Name of the on-source cache directory holding session state, pack
/// archives, and filelists. Keeping it under the source root is an
/// invariant: intermediate archive writes stay on the read disk.
pub const CACHE_DIR_NAME: &str = "_fast_transfer_cache_";

/// Session document inside the cache directory.
pub const SESSION_FILE_NAME: &str = "transfer_session.json";

fn default_archiver_program() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("7z.exe")
    } else {
        PathBuf::from("7z")
    }
}

/// Options consumed at engine construction. Hosts build this record from
/// whatever configuration surface they own; the engine only validates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    /// Root of the data to migrate. Must be an existing directory.
    pub source_root: PathBuf,
    /// Directory under which `basename(source_root)` is created and filled.
    pub target_root: PathBuf,
    /// Size of each of the two worker pools.
    pub worker_count: usize,
    /// Byte safety valve for pack size, in MiB.
    pub chunk_size_limit_mb: u64,
    /// Upper bound on files per pack in the degenerate zero-worker fallback.
    pub chunk_file_limit: usize,
    /// Per-invocation archiver timeout, in seconds.
    pub subprocess_timeout_s: u64,
    /// Attempts per archiver call; only timeouts are retried.
    pub subprocess_retries: u32,
    /// Never delete source files, the source root, or create a symlink.
    pub copy_only: bool,
    /// Replace the source root with a directory symlink after teardown.
    pub create_symlink: bool,
    /// Resume from an existing session file when one is present.
    pub resume_session: bool,
    /// External archiver binary (7-Zip compatible argument shape).
    pub archiver_program: PathBuf,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::new(),
            target_root: PathBuf::new(),
            worker_count: 4,
            chunk_size_limit_mb: 64,
            chunk_file_limit: 4096,
            subprocess_timeout_s: 10,
            subprocess_retries: 3,
            copy_only: false,
            create_symlink: false,
            resume_session: false,
            archiver_program: default_archiver_program(),
        }
    }
}

impl MigrateConfig {
    /// Validate the record. Every failure is `ConfigInvalid`; nothing here
    /// touches the target volume.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.source_root.as_os_str().is_empty() {
            return Err(EngineError::ConfigInvalid("source_root is empty".into()));
        }
        if !self.source_root.is_absolute() {
            return Err(EngineError::ConfigInvalid(format!(
                "source_root must be absolute: {}",
                self.source_root.display()
            )));
        }
        if !self.source_root.is_dir() {
            return Err(EngineError::ConfigInvalid(format!(
                "source_root is not an existing directory: {}",
                self.source_root.display()
            )));
        }
        if self.source_root.file_name().is_none() {
            return Err(EngineError::ConfigInvalid(format!(
                "source_root has no final component: {}",
                self.source_root.display()
            )));
        }
        if self.target_root.as_os_str().is_empty() {
            return Err(EngineError::ConfigInvalid("target_root is empty".into()));
        }
        if !self.target_root.is_absolute() {
            return Err(EngineError::ConfigInvalid(format!(
                "target_root must be absolute: {}",
                self.target_root.display()
            )));
        }
        if self.target_root.starts_with(&self.source_root) {
            return Err(EngineError::ConfigInvalid(
                "target_root must not live inside source_root".into(),
            ));
        }
        if self.worker_count == 0 {
            return Err(EngineError::ConfigInvalid("worker_count must be positive".into()));
        }
        if self.chunk_size_limit_mb == 0 {
            return Err(EngineError::ConfigInvalid(
                "chunk_size_limit_mb must be positive".into(),
            ));
        }
        if self.chunk_file_limit == 0 {
            return Err(EngineError::ConfigInvalid(
                "chunk_file_limit must be positive".into(),
            ));
        }
        if self.subprocess_timeout_s == 0 {
            return Err(EngineError::ConfigInvalid(
                "subprocess_timeout_s must be positive".into(),
            ));
        }
        if self.subprocess_retries == 0 {
            return Err(EngineError::ConfigInvalid(
                "subprocess_retries must be positive".into(),
            ));
        }
        if self.archiver_program.as_os_str().is_empty() {
            return Err(EngineError::ConfigInvalid("archiver_program is empty".into()));
        }
        Ok(())
    }

    /// `<source_root>/_fast_transfer_cache_/`
    pub fn cache_dir(&self) -> PathBuf {
        self.source_root.join(CACHE_DIR_NAME)
    }

    /// `<cache>/transfer_session.json`
    pub fn session_file(&self) -> PathBuf {
        self.cache_dir().join(SESSION_FILE_NAME)
    }

    /// Final component of the source root, preserved under the target root.
    pub fn source_basename(&self) -> &std::ffi::OsStr {
        self.source_root
            .file_name()
            .unwrap_or(self.source_root.as_os_str())
    }

    /// `<target_root>/<basename(source_root)>`, where files land.
    pub fn target_subdir(&self) -> PathBuf {
        self.target_root.join(self.source_basename())
    }

    pub fn chunk_size_limit_bytes(&self) -> u64 {
        self.chunk_size_limit_mb.saturating_mul(1024 * 1024)
    }

    pub fn subprocess_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.subprocess_timeout_s)
    }
}

/// True when `path` is inside the cache directory for `source_root`.
pub fn in_cache_dir(source_root: &Path, path: &Path) -> bool {
    path.starts_with(source_root.join(CACHE_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config(dir: &Path) -> MigrateConfig {
        MigrateConfig {
            source_root: dir.join("src"),
            target_root: dir.join("dst"),
            ..MigrateConfig::default()
        }
    }

    #[test]
    fn rejects_zero_workers() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("src")).unwrap();
        let mut config = valid_config(temp.path());
        config.worker_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_target_inside_source() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("src")).unwrap();
        let mut config = valid_config(temp.path());
        config.target_root = config.source_root.join("nested");
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_a_sound_record_and_derives_paths() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("src")).unwrap();
        let config = valid_config(temp.path());
        config.validate().unwrap();

        assert_eq!(config.cache_dir(), config.source_root.join(CACHE_DIR_NAME));
        assert_eq!(config.target_subdir(), config.target_root.join("src"));
        assert_eq!(config.chunk_size_limit_bytes(), 64 * 1024 * 1024);
    }
}
