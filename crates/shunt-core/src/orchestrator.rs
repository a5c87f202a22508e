//! Run lifecycle: plan (or resume), execute, persist, tear down.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::archiver::{Archiver, ProcessRegistry};
use crate::config::{MigrateConfig, SESSION_FILE_NAME};
use crate::fs_ops;
use crate::logger::{EngineLogger, LogCallback, StatusCallback, StatusSink, Verbosity};
use crate::pipeline::{self, PipelineContext};
use crate::planner::{self, Task};
use crate::progress::ProgressTracker;
use crate::session::{self, SessionState, SessionWriter, FLUSH_INTERVAL};
use crate::CancelFlag;

/// How a run ended. `Err` from [`Migrator::run`] is reserved for run-level
/// fatals (invalid plan, unusable cache); per-task failures land here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Every task completed; teardown (and the optional symlink) ran.
    Completed,
    /// Some tasks failed; teardown was skipped so a resumed run can finish.
    CompletedWithFailures,
    /// A stop request was observed; teardown was skipped.
    Cancelled,
}

/// Final accounting for one `run()`.
#[derive(Debug, Clone)]
pub struct MigrationSummary {
    pub outcome: MigrationOutcome,
    pub planned_tasks: usize,
    pub failed_tasks: usize,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub duration: Duration,
}

/// Cloneable handle for requesting cooperative shutdown from any thread.
#[derive(Clone)]
pub struct StopHandle {
    cancel: CancelFlag,
    registry: Arc<ProcessRegistry>,
}

impl StopHandle {
    /// Set the cancel flag, then kill every registered archiver child.
    /// Returns immediately; callers still await `run()`, which drains both
    /// pools before returning.
    pub fn stop(&self) {
        self.cancel.set();
        self.registry.kill_all();
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_set()
    }
}

/// The migration engine. Construct with a validated configuration and the
/// host's status/log callbacks, then call [`run`](Migrator::run) once.
pub struct Migrator {
    config: Arc<MigrateConfig>,
    logger: EngineLogger,
    status: StatusSink,
    cancel: CancelFlag,
    registry: Arc<ProcessRegistry>,
}

impl Migrator {
    pub fn new(
        config: MigrateConfig,
        status: StatusCallback,
        log: LogCallback,
        verbosity: Verbosity,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            logger: EngineLogger::new(verbosity, log),
            status: StatusSink::new(status),
            cancel: CancelFlag::new(),
            registry: ProcessRegistry::new(),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            cancel: self.cancel.clone(),
            registry: Arc::clone(&self.registry),
        }
    }

    /// Execute the migration. Blocks until both pools drain.
    pub fn run(&self) -> Result<MigrationSummary> {
        let started = Instant::now();
        let config = &self.config;
        let cache_dir = config.cache_dir();
        fs::create_dir_all(fs_ops::normalize(&cache_dir))
            .with_context(|| format!("create cache directory {}", cache_dir.display()))?;

        let (tasks, state, processed_bytes, total_bytes) = self.build_work_list(&cache_dir)?;
        let planned_tasks = tasks.len();

        let progress = Arc::new(ProgressTracker::new(total_bytes, self.status.clone()));
        if processed_bytes > 0 {
            // Progress continuity across resume: completed bytes count up
            // front so the percentage picks up where the last run stopped.
            progress.credit(processed_bytes);
        }

        let session_path = config.session_file();
        let writer = SessionWriter::spawn(
            session_path,
            state,
            FLUSH_INTERVAL,
            self.logger.clone(),
        )?;

        let archiver = Arc::new(Archiver::new(
            config,
            Arc::clone(&self.registry),
            self.cancel.clone(),
            self.logger.clone(),
        ));

        let failed = Arc::new(AtomicUsize::new(0));
        let ctx = PipelineContext {
            config: Arc::clone(config),
            archiver,
            completions: writer.sender(),
            progress: Arc::clone(&progress),
            logger: self.logger.clone(),
            cancel: self.cancel.clone(),
            cache_dir: cache_dir.clone(),
            target_subdir: config.target_subdir(),
            failed: Arc::clone(&failed),
        };

        self.status
            .emit(&format!("migrating {planned_tasks} task(s)"), None);
        let pipeline_result = pipeline::run_tasks(&ctx, tasks);

        // Teardown step 1 on success, flush-for-recovery otherwise: the
        // writer is signalled and joined on every path.
        writer.shutdown();
        pipeline_result?;

        let failed_tasks = failed.load(Ordering::SeqCst);
        let cancelled = self.cancel.is_set();

        let outcome = if cancelled {
            self.logger.info("stop requested; leaving session for resume");
            self.status.emit("migration cancelled", None);
            MigrationOutcome::Cancelled
        } else if failed_tasks > 0 {
            self.status.emit(
                &format!("migration finished with {failed_tasks} failed task(s)"),
                None,
            );
            MigrationOutcome::CompletedWithFailures
        } else {
            self.teardown(&cache_dir);
            self.status.emit("migration complete", Some(100));
            MigrationOutcome::Completed
        };

        Ok(MigrationSummary {
            outcome,
            planned_tasks,
            failed_tasks,
            total_bytes,
            processed_bytes: progress.processed(),
            duration: started.elapsed(),
        })
    }

    /// Resolve the work list: resume from a stored session when requested
    /// and usable, otherwise plan fresh.
    fn build_work_list(
        &self,
        cache_dir: &Path,
    ) -> Result<(Vec<Task>, SessionState, u64, u64)> {
        let config = &self.config;
        let session_path = config.session_file();

        if config.resume_session && session_path.is_file() {
            match session::load_session(&session_path) {
                Ok(state) => match session::plan_resume(state.clone(), config, cache_dir) {
                    Ok(resume) => {
                        let reused = resume.tasks.iter().filter(|t| t.is_resume()).count();
                        self.logger.info(format!(
                            "resuming session: {} task(s) left, {} cached archive(s) reused",
                            resume.tasks.len(),
                            reused
                        ));
                        return Ok((
                            resume.tasks,
                            state,
                            resume.processed_bytes,
                            resume.total_bytes,
                        ));
                    }
                    Err(err) => {
                        self.logger
                            .error(format!("cannot resume: {err}; planning fresh"));
                    }
                },
                Err(err) => {
                    self.logger
                        .error(format!("session unreadable: {err:#}; planning fresh"));
                }
            }
        }

        // A fresh plan renumbers packs from 1, so stale artifacts from any
        // abandoned session must go first: the archiver would append into an
        // existing pack_<n> archive.
        clear_stale_artifacts(cache_dir);

        self.status.emit("scanning source tree", None);
        let files = planner::scan_source(&config.source_root, cache_dir, &self.logger)?;
        let plan = planner::build_plan(config, files);
        self.logger.info(format!(
            "planned {} task(s), {} file(s), {} bytes",
            plan.tasks.len(),
            plan.tasks.iter().map(|t| match t {
                Task::Pack { files, .. } | Task::ResumeExtract { files, .. } => files.len(),
                Task::MoveLarge { .. } => 1,
            })
            .sum::<usize>(),
            plan.total_bytes
        ));
        let state = SessionState::from_plan(&plan);
        let total = plan.total_bytes;
        Ok((plan.tasks, state, 0, total))
    }

    /// Success-only teardown: cache tree, then (outside copy-only) the
    /// source root, then the optional directory symlink in its place.
    fn teardown(&self, cache_dir: &Path) {
        let config = &self.config;
        self.status.emit("removing transfer cache", None);
        if !fs_ops::remove_tree(cache_dir) {
            self.logger
                .error(format!("could not remove cache {}", cache_dir.display()));
        }

        if config.copy_only {
            return;
        }

        self.status.emit("removing source tree", None);
        if !fs_ops::remove_tree(&config.source_root) {
            self.logger.error(format!(
                "could not remove source root {}",
                config.source_root.display()
            ));
            return;
        }

        if config.create_symlink {
            // The source root is gone, so the link name is free.
            match create_source_symlink(config) {
                Ok(()) => self.logger.info(format!(
                    "linked {} -> {}",
                    config.source_root.display(),
                    config.target_subdir().display()
                )),
                Err(err) => {
                    // Not retried; the target tree stands on its own.
                    self.logger.error(format!("symlink creation failed: {err:#}"));
                    self.status.emit("symlink creation failed", None);
                }
            }
        }
    }
}

/// Replace the (removed) source root with a directory symlink to the
/// migrated tree.
fn create_source_symlink(config: &MigrateConfig) -> Result<()> {
    let target = config.target_subdir();
    #[cfg(windows)]
    {
        crate::win_fs::require_symlink_privilege()?;
        crate::win_fs::create_dir_symlink(&config.source_root, &target).with_context(|| {
            format!(
                "link {} -> {}",
                config.source_root.display(),
                target.display()
            )
        })?;
    }
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(&target, &config.source_root).with_context(|| {
            format!(
                "link {} -> {}",
                config.source_root.display(),
                target.display()
            )
        })?;
    }
    Ok(())
}

/// Drop pack archives, filelists, and the session document left in the
/// cache by an abandoned or rejected session.
fn clear_stale_artifacts(cache_dir: &Path) {
    let Ok(entries) = fs::read_dir(fs_ops::normalize(cache_dir)) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("pack_") || name.starts_with("filelist_") || name == SESSION_FILE_NAME
        {
            fs_ops::remove_file_retrying(
                &entry.path(),
                fs_ops::REMOVE_ATTEMPTS,
                fs_ops::REMOVE_RETRY_DELAY,
            );
        }
    }
}
