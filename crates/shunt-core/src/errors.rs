//! Error kinds for the migration engine.
//!
//! Two layers: `EngineError` names the failures the engine reasons about
//! (subprocess timeouts are retried, non-zero exits are not, plan rejection
//! falls back to a fresh run), and `ErrorCategory` classifies raw IO errors
//! so the filesystem primitives can decide whether another attempt is worth
//! making.

use std::io;
use std::path::PathBuf;

/// Category of an IO error for retry decision-making.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient condition, a retry may succeed.
    Transient,
    /// Permanent condition, retrying will never succeed.
    Fatal,
}

/// Classify an IO error for retry decisions.
///
/// Unknown kinds default to `Fatal` so retry loops cannot spin on an error
/// that will never clear.
pub fn categorize_io_error(err: &io::Error) -> ErrorCategory {
    match err.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::ResourceBusy => ErrorCategory::Transient,

        // Windows reports files held open by scanners as permission errors;
        // those frequently clear, so give them the retry path too.
        io::ErrorKind::PermissionDenied => ErrorCategory::Transient,

        io::ErrorKind::NotFound
        | io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::AlreadyExists
        | io::ErrorKind::StorageFull => ErrorCategory::Fatal,

        _ => ErrorCategory::Fatal,
    }
}

/// Failures the engine distinguishes by behavior.
#[derive(Debug)]
pub enum EngineError {
    /// A supervised child exceeded its per-invocation deadline and was killed.
    Timeout { program: String, seconds: u64 },
    /// A supervised child exited non-zero; deterministic, never retried.
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    /// Retries exhausted on a filesystem operation.
    IoFatal { path: PathBuf, source: io::Error },
    /// A stored session does not match the requested migration.
    PlanRejected(String),
    /// Cooperative stop was requested.
    Cancelled,
    /// The configuration record failed validation.
    ConfigInvalid(String),
    /// Symlink creation requires a privilege the process does not hold.
    PrivilegeDenied(String),
}

impl EngineError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Timeout { program, seconds } => {
                write!(f, "{program} did not finish within {seconds}s and was killed")
            }
            EngineError::NonZeroExit {
                program,
                code,
                stderr,
                ..
            } => {
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                let detail = stderr.trim();
                if detail.is_empty() {
                    write!(f, "{program} exited with status {code}")
                } else {
                    write!(f, "{program} exited with status {code}: {detail}")
                }
            }
            EngineError::IoFatal { path, source } => {
                write!(f, "{}: {source}", path.display())
            }
            EngineError::PlanRejected(reason) => write!(f, "session rejected: {reason}"),
            EngineError::Cancelled => write!(f, "operation cancelled"),
            EngineError::ConfigInvalid(reason) => write!(f, "invalid configuration: {reason}"),
            EngineError::PrivilegeDenied(what) => write!(f, "privilege denied: {what}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::IoFatal { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        let busy = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        assert_eq!(categorize_io_error(&busy), ErrorCategory::Transient);

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "locked");
        assert_eq!(categorize_io_error(&denied), ErrorCategory::Transient);
    }

    #[test]
    fn unknown_errors_default_to_fatal() {
        let other = io::Error::other("mystery");
        assert_eq!(categorize_io_error(&other), ErrorCategory::Fatal);
    }

    #[test]
    fn timeout_is_the_only_retryable_engine_error() {
        let timeout = EngineError::Timeout {
            program: "7z".into(),
            seconds: 10,
        };
        assert!(timeout.is_timeout());

        let exit = EngineError::NonZeroExit {
            program: "7z".into(),
            code: Some(2),
            stdout: String::new(),
            stderr: "cannot open file".into(),
        };
        assert!(!exit.is_timeout());
        assert!(exit.to_string().contains("cannot open file"));
    }
}
