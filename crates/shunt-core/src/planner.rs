//! Two-phase migration planner: walk and size the source tree, classify
//! files into individually-moved large files and packable small files, then
//! shuffle and chunk the small files into balanced packs.
//!
//! The shuffle is load-bearing. Chunking a directory-ordered listing would
//! concentrate each pack's reads on one region of the source disk; a random
//! permutation mixed into equal-count packs keeps concurrent workers reading
//! across the whole tree.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::distr::Alphanumeric;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::archiver::ARCHIVE_EXT;
use crate::config::MigrateConfig;
use crate::logger::EngineLogger;

/// Lower clamp of the dynamic large-file threshold.
pub const THRESHOLD_FLOOR: u64 = 16 * 1024 * 1024;
/// Upper clamp of the dynamic large-file threshold.
pub const THRESHOLD_CEIL: u64 = 256 * 1024 * 1024;
/// Multiplier applied to the mean file size before clamping.
const THRESHOLD_AVG_FACTOR: u64 = 10;

/// One regular file discovered at scan time. Immutable after planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
}

/// Unit of resumable work.
#[derive(Debug, Clone)]
pub enum Task {
    /// Aggregate small files into one archive, transfer, extract, delete.
    Pack {
        task_id: String,
        pack_id: u32,
        files: Vec<FileEntry>,
    },
    /// Transfer one file individually.
    MoveLarge { task_id: String, file: FileEntry },
    /// A `Pack` whose archive survived a prior aborted run in the cache;
    /// the pack phase is already paid for.
    ResumeExtract {
        task_id: String,
        pack_id: u32,
        files: Vec<FileEntry>,
    },
}

impl Task {
    pub fn task_id(&self) -> &str {
        match self {
            Task::Pack { task_id, .. }
            | Task::MoveLarge { task_id, .. }
            | Task::ResumeExtract { task_id, .. } => task_id,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        match self {
            Task::Pack { files, .. } | Task::ResumeExtract { files, .. } => {
                files.iter().map(|f| f.size).sum()
            }
            Task::MoveLarge { file, .. } => file.size,
        }
    }

    pub fn is_resume(&self) -> bool {
        matches!(self, Task::ResumeExtract { .. })
    }
}

/// Persisted form of a task. `ResumeExtract` is a recovery-time view of a
/// stored `Pack`, so only two variants exist on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskRecord {
    Pack {
        task_id: String,
        pack_id: u32,
        files: Vec<FileEntry>,
    },
    MoveLarge {
        task_id: String,
        file_info: FileEntry,
    },
}

impl TaskRecord {
    pub fn task_id(&self) -> &str {
        match self {
            TaskRecord::Pack { task_id, .. } | TaskRecord::MoveLarge { task_id, .. } => task_id,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        match self {
            TaskRecord::Pack { files, .. } => files.iter().map(|f| f.size).sum(),
            TaskRecord::MoveLarge { file_info, .. } => file_info.size,
        }
    }

    pub fn from_task(task: &Task) -> Self {
        match task {
            Task::Pack {
                task_id,
                pack_id,
                files,
            }
            | Task::ResumeExtract {
                task_id,
                pack_id,
                files,
            } => TaskRecord::Pack {
                task_id: task_id.clone(),
                pack_id: *pack_id,
                files: files.clone(),
            },
            Task::MoveLarge { task_id, file } => TaskRecord::MoveLarge {
                task_id: task_id.clone(),
                file_info: file.clone(),
            },
        }
    }

    pub fn into_task(self) -> Task {
        match self {
            TaskRecord::Pack {
                task_id,
                pack_id,
                files,
            } => Task::Pack {
                task_id,
                pack_id,
                files,
            },
            TaskRecord::MoveLarge { task_id, file_info } => Task::MoveLarge {
                task_id,
                file: file_info,
            },
        }
    }
}

/// Planner output. Task order is advisory; the pipeline may execute in any
/// order.
#[derive(Debug, Clone)]
pub struct Plan {
    pub source_root: PathBuf,
    pub target_root: PathBuf,
    pub total_bytes: u64,
    pub tasks: Vec<Task>,
}

/// Archive artifact name for a pack.
pub fn archive_file_name(pack_id: u32) -> String {
    format!("pack_{pack_id}.{ARCHIVE_EXT}")
}

/// Filelist artifact name for a pack.
pub fn filelist_file_name(pack_id: u32) -> String {
    format!("filelist_{pack_id}.txt")
}

/// Enumerate regular files under `source_root`, skipping the cache
/// directory. Broken symlinks and files that vanish mid-scan are skipped
/// silently; only a failure at the root is fatal.
pub fn scan_source(
    source_root: &Path,
    cache_dir: &Path,
    logger: &EngineLogger,
) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(source_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !e.path().starts_with(cache_dir));

    for next in walker {
        let entry = match next {
            Ok(entry) => entry,
            Err(err) => {
                if err.depth() == 0 {
                    return Err(err).with_context(|| {
                        format!("enumerate source root {}", source_root.display())
                    });
                }
                logger.debug(format!("scan: skipping unreadable entry: {err}"));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                // Vanished between readdir and stat.
                logger.debug(format!(
                    "scan: skipping {}: {err}",
                    entry.path().display()
                ));
                continue;
            }
        };
        entries.push(FileEntry {
            path: entry.into_path(),
            size: metadata.len(),
        });
    }
    Ok(entries)
}

/// Dynamic cutoff between packed and individually-moved files.
///
/// `clamp(avg × 10, 16 MiB, 256 MiB)`: a tree of tiny files with a few
/// medium ones keeps the medium ones packed, while uniformly medium trees
/// promote them to individual moves, without fixed tuning.
pub fn large_file_threshold(total_bytes: u64, file_count: u64) -> u64 {
    if file_count == 0 {
        return THRESHOLD_CEIL;
    }
    let avg = total_bytes / file_count;
    avg.saturating_mul(THRESHOLD_AVG_FACTOR)
        .clamp(THRESHOLD_FLOOR, THRESHOLD_CEIL)
}

fn new_task_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!("task-{suffix}")
}

/// Build the migration plan: classify, shuffle, chunk, and interleave.
pub fn build_plan(config: &MigrateConfig, files: Vec<FileEntry>) -> Plan {
    let total_bytes: u64 = files.iter().map(|f| f.size).sum();
    let threshold = large_file_threshold(total_bytes, files.len() as u64);

    let mut small: Vec<FileEntry> = Vec::new();
    let mut large: Vec<FileEntry> = Vec::new();
    for file in files {
        if file.size >= threshold {
            large.push(file);
        } else {
            small.push(file);
        }
    }

    small.shuffle(&mut rand::rng());

    let packs = chunk_small_files(
        small,
        config.worker_count,
        config.chunk_size_limit_bytes(),
        config.chunk_file_limit,
    );

    let mut pack_tasks: Vec<Task> = packs
        .into_iter()
        .enumerate()
        .map(|(idx, files)| Task::Pack {
            task_id: new_task_id(),
            pack_id: (idx + 1) as u32,
            files,
        })
        .collect();
    let mut move_tasks: Vec<Task> = large
        .into_iter()
        .map(|file| Task::MoveLarge {
            task_id: new_task_id(),
            file,
        })
        .collect();

    // Interleave pack and move tasks so workers are not all packing (source
    // reads) or all moving (target writes) at the same moment.
    let mut tasks = Vec::with_capacity(pack_tasks.len() + move_tasks.len());
    let mut packs_iter = pack_tasks.drain(..);
    let mut moves_iter = move_tasks.drain(..);
    loop {
        match (packs_iter.next(), moves_iter.next()) {
            (None, None) => break,
            (pack, mov) => {
                tasks.extend(pack);
                tasks.extend(mov);
            }
        }
    }

    Plan {
        source_root: config.source_root.clone(),
        target_root: config.target_root.clone(),
        total_bytes,
        tasks,
    }
}

/// Greedy balanced chunking: equal file counts per pack are the primary
/// rule, the byte limit is a safety valve for the odd run of big-ish small
/// files. `chunk_file_limit` caps packs only in the zero-worker fallback.
fn chunk_small_files(
    files: Vec<FileEntry>,
    worker_count: usize,
    byte_limit: u64,
    file_limit: usize,
) -> Vec<Vec<FileEntry>> {
    if files.is_empty() {
        return Vec::new();
    }

    let ideal_per_pack = if worker_count == 0 {
        file_limit.max(1)
    } else {
        files.len().div_ceil(worker_count).max(1)
    };

    let mut packs: Vec<Vec<FileEntry>> = Vec::new();
    let mut current: Vec<FileEntry> = Vec::new();
    let mut current_bytes: u64 = 0;
    for file in files {
        let over_bytes = !current.is_empty() && current_bytes + file.size > byte_limit;
        if current.len() >= ideal_per_pack || over_bytes {
            packs.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += file.size;
        current.push(file);
    }
    if !current.is_empty() {
        packs.push(current);
    }
    packs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, size: u64) -> FileEntry {
        FileEntry {
            path: PathBuf::from(format!("/data/{name}")),
            size,
        }
    }

    #[test]
    fn threshold_clamps_both_ways() {
        // Tiny average clamps up to the floor.
        assert_eq!(large_file_threshold(1000 * 1024, 1000), THRESHOLD_FLOOR);
        // Huge average clamps down to the ceiling.
        assert_eq!(
            large_file_threshold(100 * 1024 * 1024 * 1024, 10),
            THRESHOLD_CEIL
        );
        // In-range averages scale linearly.
        let total = 1003 * 2 * 1024 * 1024; // 2 MiB mean
        assert_eq!(large_file_threshold(total, 1003), 20 * 1024 * 1024);
    }

    #[test]
    fn chunks_balance_by_count() {
        let files: Vec<FileEntry> = (0..200).map(|i| entry(&format!("f{i}"), 1)).collect();
        let packs = chunk_small_files(files, 8, 64 * 1024 * 1024, 4096);
        assert_eq!(packs.len(), 8);
        assert!(packs.iter().all(|p| p.len() == 25));
    }

    #[test]
    fn byte_valve_seals_oversized_chunks() {
        let files: Vec<FileEntry> = (0..10).map(|i| entry(&format!("f{i}"), 30)).collect();
        // Limit of 100 bytes admits three 30-byte files per pack.
        let packs = chunk_small_files(files, 1, 100, 4096);
        assert!(packs.iter().all(|p| p.len() <= 3));
        let total: usize = packs.iter().map(Vec::len).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn zero_worker_fallback_uses_file_limit() {
        let files: Vec<FileEntry> = (0..10).map(|i| entry(&format!("f{i}"), 1)).collect();
        let packs = chunk_small_files(files, 0, u64::MAX, 4);
        assert_eq!(packs.len(), 3);
        assert_eq!(packs[0].len(), 4);
    }

    #[test]
    fn plan_classifies_against_the_dynamic_threshold() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("src")).unwrap();
        let config = MigrateConfig {
            source_root: temp.path().join("src"),
            target_root: temp.path().join("dst"),
            worker_count: 4,
            ..MigrateConfig::default()
        };

        // 1000 small files plus 3 files over the ceiling: threshold lands in
        // range, the big three become individual moves.
        let mut files: Vec<FileEntry> =
            (0..1000).map(|i| entry(&format!("s{i}"), 100 * 1024)).collect();
        for i in 0..3 {
            files.push(entry(&format!("big{i}"), 500 * 1024 * 1024));
        }

        let plan = build_plan(&config, files);
        let moves = plan
            .tasks
            .iter()
            .filter(|t| matches!(t, Task::MoveLarge { .. }))
            .count();
        assert_eq!(moves, 3);

        let packed: usize = plan
            .tasks
            .iter()
            .filter_map(|t| match t {
                Task::Pack { files, .. } => Some(files.len()),
                _ => None,
            })
            .sum();
        assert_eq!(packed, 1000);
        assert_eq!(
            plan.total_bytes,
            1000 * 100 * 1024 + 3 * 500 * 1024 * 1024
        );
    }

    #[test]
    fn shuffle_loses_no_files() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("src")).unwrap();
        let config = MigrateConfig {
            source_root: temp.path().join("src"),
            target_root: temp.path().join("dst"),
            worker_count: 3,
            ..MigrateConfig::default()
        };
        let files: Vec<FileEntry> = (0..97).map(|i| entry(&format!("f{i}"), 10)).collect();
        let plan = build_plan(&config, files.clone());

        let mut seen: Vec<PathBuf> = plan
            .tasks
            .iter()
            .flat_map(|t| match t {
                Task::Pack { files, .. } => files.iter().map(|f| f.path.clone()).collect(),
                Task::MoveLarge { file, .. } => vec![file.path.clone()],
                Task::ResumeExtract { files, .. } => {
                    files.iter().map(|f| f.path.clone()).collect()
                }
            })
            .collect();
        seen.sort();
        let mut expected: Vec<PathBuf> = files.into_iter().map(|f| f.path).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn task_ids_are_unique() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("src")).unwrap();
        let config = MigrateConfig {
            source_root: temp.path().join("src"),
            target_root: temp.path().join("dst"),
            worker_count: 8,
            ..MigrateConfig::default()
        };
        let files: Vec<FileEntry> = (0..500).map(|i| entry(&format!("f{i}"), 1)).collect();
        let plan = build_plan(&config, files);
        let mut ids: Vec<&str> = plan.tasks.iter().map(Task::task_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), plan.tasks.len());
    }
}
