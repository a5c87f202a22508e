use std::path::PathBuf;

use clap::Parser;

/// Parallel cross-volume directory migration.
///
/// Moves (or copies) a directory tree onto another volume: small files are
/// aggregated into store-mode archives by an external 7-Zip-compatible
/// archiver, large files move individually, and an on-source session cache
/// makes interrupted runs resumable.
#[derive(Debug, Parser)]
#[command(name = "shunt", version)]
pub struct Cli {
    /// Directory to migrate (absolute path).
    pub source: PathBuf,

    /// Directory under which a folder named after the source is created.
    pub target: PathBuf,

    /// Worker threads per pool; defaults to the logical CPU count.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Pack size safety valve in MiB.
    #[arg(long, default_value_t = 64)]
    pub chunk_size_mb: u64,

    /// Files-per-pack cap for the degenerate zero-worker fallback.
    #[arg(long, default_value_t = 4096)]
    pub chunk_files: usize,

    /// Per-invocation archiver timeout in seconds.
    #[arg(long, default_value_t = 10)]
    pub archiver_timeout: u64,

    /// Archiver binary (7-Zip compatible arguments).
    #[arg(long, default_value = "7z")]
    pub archiver: PathBuf,

    /// Copy instead of move: sources are never deleted.
    #[arg(long)]
    pub copy_only: bool,

    /// After a successful move, replace the source root with a directory
    /// symlink to the migrated tree.
    #[arg(long)]
    pub symlink: bool,

    /// Resume a previously interrupted migration if a session exists.
    #[arg(long)]
    pub resume: bool,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
