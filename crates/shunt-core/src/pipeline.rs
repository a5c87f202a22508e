//! Dual-pool execution pipeline.
//!
//! The transfer pool runs the bulk phases (pack + extract, or move); the
//! cleanup pool runs source deletion and per-task teardown. A pack's source
//! delete is dispatched the moment its archive exists, so the source disk
//! deletes while the target disk extracts; the per-task finalizer chains
//! behind the delete handle instead of blocking a transfer worker.
//!
//! Failure is task-local: a failed task is logged, counted, and credited to
//! progress (UI monotonicity only); its id never enters the completed set,
//! so a later resumed run re-attempts it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::archiver::Archiver;
use crate::config::MigrateConfig;
use crate::fs_ops::{
    self, COPY_ATTEMPTS, COPY_RETRY_DELAY, REMOVE_ATTEMPTS, REMOVE_RETRY_DELAY,
};
use crate::logger::EngineLogger;
use crate::planner::{archive_file_name, filelist_file_name, FileEntry, Task};
use crate::pool::WorkerPool;
use crate::progress::ProgressTracker;
use crate::session::CompletionSender;
use crate::CancelFlag;

/// Everything a task needs, cheap to clone into worker closures.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<MigrateConfig>,
    pub archiver: Arc<Archiver>,
    pub completions: CompletionSender,
    pub progress: Arc<ProgressTracker>,
    pub logger: EngineLogger,
    pub cancel: CancelFlag,
    pub cache_dir: PathBuf,
    pub target_subdir: PathBuf,
    pub failed: Arc<AtomicUsize>,
}

enum TaskOutcome {
    Done,
    Cancelled,
}

/// Execute the work list on the two pools and drain both.
///
/// ResumeExtract tasks are moved to the front: their archives are sunk
/// source-disk IO, and extracting them first frees cache space immediately.
pub fn run_tasks(ctx: &PipelineContext, mut tasks: Vec<Task>) -> Result<()> {
    tasks.sort_by_key(|task| !task.is_resume());

    let transfer = WorkerPool::new("transfer", ctx.config.worker_count)?;
    let cleanup = Arc::new(WorkerPool::new("cleanup", ctx.config.worker_count)?);

    for task in tasks {
        let ctx = ctx.clone();
        let cleanup = Arc::clone(&cleanup);
        transfer.submit(move || run_one(&ctx, &cleanup, task));
    }

    transfer.join();
    // Transfer workers are the only submitters to the cleanup pool, so after
    // the join above its queue can only drain.
    cleanup.join();
    Ok(())
}

fn run_one(ctx: &PipelineContext, cleanup: &Arc<WorkerPool>, task: Task) {
    if ctx.cancel.is_set() {
        return;
    }
    let bytes = task.total_bytes();
    let label = task.task_id().to_string();
    let result = match task {
        Task::Pack {
            task_id,
            pack_id,
            files,
        } => run_pack(ctx, cleanup, task_id, pack_id, files, false),
        Task::ResumeExtract {
            task_id,
            pack_id,
            files,
        } => run_pack(ctx, cleanup, task_id, pack_id, files, true),
        Task::MoveLarge { task_id, file } => run_move_large(ctx, cleanup, task_id, file),
    };
    match result {
        Ok(TaskOutcome::Done | TaskOutcome::Cancelled) => {}
        Err(err) => {
            ctx.failed.fetch_add(1, Ordering::SeqCst);
            ctx.logger.error(format!("task {label} failed: {err:#}"));
            ctx.progress.credit(bytes);
        }
    }
}

/// Pack state machine: write the filelist, archive, then run the source
/// delete and the target extract concurrently, then finalize.
fn run_pack(
    ctx: &PipelineContext,
    cleanup: &Arc<WorkerPool>,
    task_id: String,
    pack_id: u32,
    files: Vec<FileEntry>,
    resume: bool,
) -> Result<TaskOutcome> {
    let bytes: u64 = files.iter().map(|f| f.size).sum();
    let archive = ctx.cache_dir.join(archive_file_name(pack_id));
    let filelist = ctx.cache_dir.join(filelist_file_name(pack_id));

    if resume {
        ctx.logger
            .info(format!("pack {pack_id}: reusing cached archive"));
    } else {
        write_filelist(&filelist, &ctx.config.source_root, &files)?;
        ctx.logger.debug(format!(
            "pack {pack_id}: archiving {} files ({bytes} bytes)",
            files.len()
        ));
        if ctx
            .archiver
            .create_archive(&archive, &filelist, &ctx.config.source_root)?
            .is_cancelled()
        {
            return Ok(TaskOutcome::Cancelled);
        }
    }

    if ctx.cancel.is_set() {
        return Ok(TaskOutcome::Cancelled);
    }

    // The archive now holds every byte; sources can go while the extract
    // writes the other volume. The two legs touch different disks.
    let delete_ok = Arc::new(AtomicBool::new(true));
    let delete_handle = (!ctx.config.copy_only).then(|| {
        let ctx = ctx.clone();
        let files = files.clone();
        let delete_ok = Arc::clone(&delete_ok);
        cleanup.submit(move || {
            if !delete_sources(&ctx, &files) {
                delete_ok.store(false, Ordering::SeqCst);
            }
        })
    });

    fs::create_dir_all(fs_ops::normalize(&ctx.target_subdir))
        .with_context(|| format!("create target {}", ctx.target_subdir.display()))?;
    if ctx
        .archiver
        .extract_archive(&archive, &ctx.target_subdir)?
        .is_cancelled()
    {
        return Ok(TaskOutcome::Cancelled);
    }

    let ctx = ctx.clone();
    cleanup.submit(move || {
        if let Some(handle) = &delete_handle {
            handle.wait();
        }
        if ctx.cancel.is_set() {
            // The cached archive survives; a resumed run finishes the job.
            return;
        }
        if !delete_ok.load(Ordering::SeqCst) {
            ctx.failed.fetch_add(1, Ordering::SeqCst);
            ctx.logger.error(format!(
                "task {task_id}: source files left behind, keeping archive for resume"
            ));
            ctx.progress.credit(bytes);
            return;
        }
        finalize_pack(&ctx, &task_id, bytes, &archive, &filelist, &files);
    });
    Ok(TaskOutcome::Done)
}

/// Remove a pack's source files. Returns false if any survived retries.
fn delete_sources(ctx: &PipelineContext, files: &[FileEntry]) -> bool {
    let mut all_removed = true;
    for file in files {
        if ctx.cancel.is_set() {
            return false;
        }
        if !fs_ops::remove_file_retrying(&file.path, REMOVE_ATTEMPTS, REMOVE_RETRY_DELAY) {
            ctx.logger
                .error(format!("could not remove source {}", file.path.display()));
            all_removed = false;
        }
    }
    all_removed
}

/// Runs after both the extract and the dispatched delete finished: drop the
/// cache artifacts, reclaim emptied source directories, mark the task
/// complete, credit its bytes.
fn finalize_pack(
    ctx: &PipelineContext,
    task_id: &str,
    bytes: u64,
    archive: &Path,
    filelist: &Path,
    files: &[FileEntry],
) {
    fs_ops::remove_file_retrying(archive, REMOVE_ATTEMPTS, REMOVE_RETRY_DELAY);
    fs_ops::remove_file_retrying(filelist, REMOVE_ATTEMPTS, REMOVE_RETRY_DELAY);
    if !ctx.config.copy_only {
        fs_ops::reclaim_empty_dirs(
            files.iter().map(|f| f.path.as_path()),
            &ctx.config.source_root,
        );
    }
    ctx.completions.record_complete(task_id);
    ctx.progress.credit(bytes);
    ctx.logger.debug(format!("task {task_id} complete"));
}

/// MoveLarge state machine: mirror the relative path under the target
/// subdirectory, move (or copy), then reclaim and complete on the cleanup
/// pool.
fn run_move_large(
    ctx: &PipelineContext,
    cleanup: &Arc<WorkerPool>,
    task_id: String,
    file: FileEntry,
) -> Result<TaskOutcome> {
    if ctx.cancel.is_set() {
        return Ok(TaskOutcome::Cancelled);
    }

    let rel = file
        .path
        .strip_prefix(&ctx.config.source_root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| PathBuf::from(file.path.file_name().unwrap_or_default()));
    let dest = ctx.target_subdir.join(&rel);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(fs_ops::normalize(parent))
            .with_context(|| format!("create target {}", parent.display()))?;
    }

    if ctx.config.copy_only {
        fs_ops::copy_large_retrying(&file.path, &dest, COPY_ATTEMPTS, COPY_RETRY_DELAY)?;
    } else {
        fs_ops::move_file(&file.path, &dest)?;
    }

    // The transfer landed durably, so the task completes even if a stop
    // arrives now; only the directory reclaim is best-effort.
    let ctx = ctx.clone();
    cleanup.submit(move || {
        if !ctx.config.copy_only {
            fs_ops::reclaim_empty_dirs([file.path.as_path()], &ctx.config.source_root);
        }
        ctx.completions.record_complete(&task_id);
        ctx.progress.credit(file.size);
        ctx.logger.debug(format!("task {task_id} complete"));
    });
    Ok(TaskOutcome::Done)
}

/// Emit `filelist_<id>.txt`: one source-relative path per line, LF endings.
fn write_filelist(path: &Path, source_root: &Path, files: &[FileEntry]) -> Result<()> {
    let mut listing = String::new();
    for file in files {
        let rel = file.path.strip_prefix(source_root).unwrap_or(&file.path);
        listing.push_str(&rel.to_string_lossy());
        listing.push('\n');
    }
    fs::write(fs_ops::normalize(path), listing)
        .with_context(|| format!("write filelist {}", path.display()))
}
