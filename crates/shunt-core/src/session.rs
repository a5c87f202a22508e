//! Durable session state: the plan plus the set of completed task ids.
//!
//! The store is a single pretty-printed JSON document rewritten wholesale by
//! a dedicated writer thread. Workers report completions over an unbounded
//! channel; the writer batches them on a flush cadence so write
//! amplification is bounded by run duration, not task count. Every rewrite
//! goes through a temp file and an atomic replace.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::config::MigrateConfig;
use crate::errors::EngineError;
use crate::fs_ops;
use crate::logger::EngineLogger;
use crate::planner::{archive_file_name, Plan, Task, TaskRecord};

/// How often the writer folds queued completions into the session file.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Queue poll granularity; bounds how late a flush window can be noticed.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// The persisted session document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
    pub total_transfer_size: u64,
    pub task_plan: Vec<TaskRecord>,
    pub completed_task_ids: Vec<String>,
}

impl SessionState {
    pub fn from_plan(plan: &Plan) -> Self {
        Self {
            source_dir: plan.source_root.clone(),
            target_dir: plan.target_root.clone(),
            total_transfer_size: plan.total_bytes,
            task_plan: plan.tasks.iter().map(TaskRecord::from_task).collect(),
            completed_task_ids: Vec::new(),
        }
    }
}

/// Parse the session document at `path`.
pub fn load_session(path: &Path) -> Result<SessionState> {
    let bytes = fs::read(fs_ops::normalize(path))
        .with_context(|| format!("read session file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("parse session file {}", path.display()))
}

/// Serialize and atomically replace the session document at `path`.
pub fn write_session(path: &Path, state: &SessionState) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(state).context("serialize session state")?;
    fs_ops::replace_file_atomic(path, &bytes)
        .with_context(|| format!("write session file {}", path.display()))
}

/// Cloneable handle workers use to report completed tasks.
#[derive(Clone)]
pub struct CompletionSender {
    tx: Sender<Option<String>>,
}

impl CompletionSender {
    pub fn record_complete(&self, task_id: &str) {
        // A closed channel means the writer is gone; nothing to do.
        let _ = self.tx.send(Some(task_id.to_string()));
    }
}

/// Single-threaded batching writer for the session file.
pub struct SessionWriter {
    tx: Sender<Option<String>>,
    handle: Option<JoinHandle<()>>,
}

impl SessionWriter {
    /// Write the initial document, then start the writer thread.
    pub fn spawn(
        path: PathBuf,
        state: SessionState,
        flush_interval: Duration,
        logger: EngineLogger,
    ) -> Result<Self> {
        write_session(&path, &state)?;

        let (tx, rx) = unbounded::<Option<String>>();
        let handle = std::thread::Builder::new()
            .name("session-writer".into())
            .spawn(move || {
                let mut completed: HashSet<String> =
                    state.completed_task_ids.iter().cloned().collect();
                let mut dirty = false;
                let mut last_write = Instant::now();
                loop {
                    match rx.recv_timeout(POLL_TIMEOUT) {
                        Ok(Some(task_id)) => {
                            if completed.insert(task_id) {
                                dirty = true;
                            }
                        }
                        Ok(None) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if dirty
                        && last_write.elapsed() >= flush_interval
                        && flush(&path, &state, &completed, &logger)
                    {
                        dirty = false;
                        last_write = Instant::now();
                    }
                }
                if dirty {
                    flush(&path, &state, &completed, &logger);
                }
            })
            .context("spawn session writer thread")?;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> CompletionSender {
        CompletionSender {
            tx: self.tx.clone(),
        }
    }

    /// Send the shutdown sentinel and join; flushes any pending batch.
    pub fn shutdown(mut self) {
        let _ = self.tx.send(None);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Rewrite the session file with the current completed set.
///
/// Rereads the on-disk document first so an externally repaired file is not
/// clobbered; a missing or corrupt file is re-synthesized from the in-memory
/// plan.
fn flush(
    path: &Path,
    fallback: &SessionState,
    completed: &HashSet<String>,
    logger: &EngineLogger,
) -> bool {
    let mut state = fs::read(fs_ops::normalize(path))
        .ok()
        .and_then(|bytes| serde_json::from_slice::<SessionState>(&bytes).ok())
        .unwrap_or_else(|| fallback.clone());

    let mut ids: Vec<String> = completed.iter().cloned().collect();
    ids.sort_unstable();
    state.completed_task_ids = ids;

    match write_session(path, &state) {
        Ok(()) => true,
        Err(err) => {
            logger.error(format!("session flush failed: {err:#}"));
            false
        }
    }
}

/// The recovered work list for a resumed run.
#[derive(Debug)]
pub struct ResumePlan {
    /// ResumeExtract tasks first, then remaining work in stored order.
    pub tasks: Vec<Task>,
    pub completed: HashSet<String>,
    /// Bytes of already-completed tasks, folded into progress continuity.
    pub processed_bytes: u64,
    pub total_bytes: u64,
}

/// Turn a stored session into an executable work list.
///
/// Rejects sessions whose roots disagree with the caller. Completed tasks
/// fold into `processed_bytes`; incomplete packs whose archive survived in
/// the cache become `ResumeExtract` and are ordered ahead of everything
/// else: those archives are sunk source-disk IO, and extracting them first
/// frees cache space fastest.
pub fn plan_resume(
    state: SessionState,
    config: &MigrateConfig,
    cache_dir: &Path,
) -> Result<ResumePlan, EngineError> {
    if state.source_dir != config.source_root {
        return Err(EngineError::PlanRejected(format!(
            "stored source {} does not match requested {}",
            state.source_dir.display(),
            config.source_root.display()
        )));
    }
    if state.target_dir != config.target_root {
        return Err(EngineError::PlanRejected(format!(
            "stored target {} does not match requested {}",
            state.target_dir.display(),
            config.target_root.display()
        )));
    }

    let completed: HashSet<String> = state.completed_task_ids.iter().cloned().collect();
    let mut resume: Vec<Task> = Vec::new();
    let mut fresh: Vec<Task> = Vec::new();
    let mut processed_bytes: u64 = 0;

    for record in state.task_plan {
        if completed.contains(record.task_id()) {
            processed_bytes += record.total_bytes();
            continue;
        }
        match record.into_task() {
            Task::Pack {
                task_id,
                pack_id,
                files,
            } if cache_dir.join(archive_file_name(pack_id)).is_file() => {
                resume.push(Task::ResumeExtract {
                    task_id,
                    pack_id,
                    files,
                });
            }
            task => fresh.push(task),
        }
    }

    let mut tasks = resume;
    tasks.append(&mut fresh);

    Ok(ResumePlan {
        tasks,
        completed,
        processed_bytes,
        total_bytes: state.total_transfer_size,
    })
}
