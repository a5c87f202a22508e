//! Supervisor for the external archiver child process.
//!
//! The archiver (7-Zip compatible argument shape) does the bulk IO: packing
//! small files into store-mode archives on the source disk and extracting
//! them on the target disk. The supervisor owns the child lifecycle:
//! spawn without a console window, enforce a per-invocation deadline, retry
//! timeouts, and kill every registered child when `stop()` is requested.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::config::MigrateConfig;
use crate::errors::EngineError;
use crate::logger::EngineLogger;
use crate::CancelFlag;

/// Extension of pack artifacts in the cache directory.
pub const ARCHIVE_EXT: &str = "zip";

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Output captured from a finished child.
#[derive(Debug, Default)]
pub struct ChildOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Result of a supervised invocation. Cancellation is a sentinel, not an
/// error: a cancelled run is not a failed run.
#[derive(Debug)]
pub enum ChildStatus {
    Finished(ChildOutput),
    Cancelled,
}

impl ChildStatus {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChildStatus::Cancelled)
    }
}

/// Registry of live children, so `stop()` can kill in-flight archiver calls
/// from any thread while their supervising workers keep polling.
#[derive(Default)]
pub struct ProcessRegistry {
    next_id: AtomicU64,
    children: Mutex<HashMap<u64, Arc<Mutex<Child>>>>,
}

impl ProcessRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, child: Child) -> (u64, Arc<Mutex<Child>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Mutex::new(child));
        self.children.lock().insert(id, Arc::clone(&slot));
        (id, slot)
    }

    fn unregister(&self, id: u64) {
        self.children.lock().remove(&id);
    }

    /// Forcibly kill every registered child. Safe from any thread; the
    /// snapshot keeps the registry lock out of the kill syscalls.
    pub fn kill_all(&self) {
        let snapshot: Vec<Arc<Mutex<Child>>> = self.children.lock().values().cloned().collect();
        for slot in snapshot {
            let _ = slot.lock().kill();
        }
    }

    pub fn active_count(&self) -> usize {
        self.children.lock().len()
    }
}

/// Run one child under supervision.
///
/// Polls `try_wait` against the deadline so the registry stays lockable for
/// the kill path. On timeout the child is killed and `Timeout` raised; on
/// non-zero exit `NonZeroExit` carries the captured streams. If the cancel
/// flag is observed at any point the child is killed and the cancelled
/// sentinel returned without raising.
pub fn run_child(
    registry: &ProcessRegistry,
    cancel: &CancelFlag,
    program: &OsStr,
    args: &[OsString],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<ChildStatus> {
    if cancel.is_set() {
        return Ok(ChildStatus::Cancelled);
    }

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    let program_name = program.to_string_lossy().into_owned();
    let child = command
        .spawn()
        .with_context(|| format!("spawn {program_name}"))?;
    let (id, slot) = registry.register(child);

    let deadline = Instant::now() + timeout;
    let exit_status = loop {
        let polled = slot.lock().try_wait();
        match polled {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => {
                registry.unregister(id);
                return Err(err).with_context(|| format!("wait on {program_name}"));
            }
        }

        if cancel.is_set() {
            kill_and_reap(&slot);
            registry.unregister(id);
            return Ok(ChildStatus::Cancelled);
        }
        if Instant::now() >= deadline {
            kill_and_reap(&slot);
            registry.unregister(id);
            return Err(EngineError::Timeout {
                program: program_name,
                seconds: timeout.as_secs(),
            }
            .into());
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    registry.unregister(id);
    let output = drain_output(&slot);

    // A stop request kills registered children; their exit is cancellation,
    // not failure, even when the kill lands before this loop notices the flag.
    if cancel.is_set() {
        return Ok(ChildStatus::Cancelled);
    }

    if exit_status.success() {
        Ok(ChildStatus::Finished(output))
    } else {
        Err(EngineError::NonZeroExit {
            program: program_name,
            code: exit_status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        }
        .into())
    }
}

fn kill_and_reap(slot: &Arc<Mutex<Child>>) {
    let mut child = slot.lock();
    let _ = child.kill();
    let _ = child.wait();
}

fn drain_output(slot: &Arc<Mutex<Child>>) -> ChildOutput {
    let mut child = slot.lock();
    let mut output = ChildOutput::default();
    if let Some(mut stdout) = child.stdout.take() {
        let _ = stdout.read_to_string(&mut output.stdout);
    }
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut output.stderr);
    }
    output
}

/// Retry wrapper: timeouts are retried up to `attempts` total tries, with
/// the final timeout re-raised. Non-zero exits are deterministic and never
/// retried.
pub fn run_child_with_retry(
    registry: &ProcessRegistry,
    cancel: &CancelFlag,
    logger: &EngineLogger,
    program: &OsStr,
    args: &[OsString],
    cwd: Option<&Path>,
    timeout: Duration,
    attempts: u32,
) -> Result<ChildStatus> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match run_child(registry, cancel, program, args, cwd, timeout) {
            Ok(status) => return Ok(status),
            Err(err) => {
                let timed_out = err
                    .downcast_ref::<EngineError>()
                    .is_some_and(EngineError::is_timeout);
                if timed_out && attempt < attempts {
                    logger.info(format!(
                        "{} timed out, retrying ({attempt}/{attempts})",
                        program.to_string_lossy()
                    ));
                    continue;
                }
                return Err(err);
            }
        }
    }
    unreachable!("retry loop returns on every path")
}

/// Archiver invocation builder bound to one migration run.
pub struct Archiver {
    program: PathBuf,
    threads: usize,
    timeout: Duration,
    attempts: u32,
    registry: Arc<ProcessRegistry>,
    cancel: CancelFlag,
    logger: EngineLogger,
}

impl Archiver {
    pub fn new(
        config: &MigrateConfig,
        registry: Arc<ProcessRegistry>,
        cancel: CancelFlag,
        logger: EngineLogger,
    ) -> Self {
        Self {
            program: config.archiver_program.clone(),
            threads: config.worker_count.max(1),
            timeout: config.subprocess_timeout(),
            attempts: config.subprocess_retries,
            registry,
            cancel,
            logger,
        }
    }

    /// Pack the files named by `filelist` (paths relative to `work_dir`)
    /// into a store-mode archive at `archive`.
    pub fn create_archive(
        &self,
        archive: &Path,
        filelist: &Path,
        work_dir: &Path,
    ) -> Result<ChildStatus> {
        // Store format: the bottleneck is disk, not entropy.
        let args: Vec<OsString> = vec![
            OsString::from("a"),
            OsString::from("-tzip"),
            OsString::from("-mx0"),
            OsString::from(format!("-mmt{}", self.threads)),
            OsString::from("-bso0"),
            OsString::from("-bsp0"),
            OsString::from("-y"),
            archive.as_os_str().to_os_string(),
            {
                let mut listing = OsString::from("@");
                listing.push(filelist.as_os_str());
                listing
            },
        ];
        run_child_with_retry(
            &self.registry,
            &self.cancel,
            &self.logger,
            self.program.as_os_str(),
            &args,
            Some(work_dir),
            self.timeout,
            self.attempts,
        )
    }

    /// Extract `archive` into `out_dir`, overwriting existing entries.
    pub fn extract_archive(&self, archive: &Path, out_dir: &Path) -> Result<ChildStatus> {
        let args: Vec<OsString> = vec![
            OsString::from("x"),
            OsString::from("-y"),
            OsString::from(format!("-mmt{}", self.threads)),
            OsString::from("-bso0"),
            OsString::from("-bsp0"),
            {
                let mut out = OsString::from("-o");
                out.push(out_dir.as_os_str());
                out
            },
            archive.as_os_str().to_os_string(),
        ];
        run_child_with_retry(
            &self.registry,
            &self.cancel,
            &self.logger,
            self.program.as_os_str(),
            &args,
            None,
            self.timeout,
            self.attempts,
        )
    }
}
