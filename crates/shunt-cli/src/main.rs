mod cli;

use std::path::absolute;
use std::sync::Arc;

use clap::Parser;
use eyre::{eyre, Result};

use shunt_core::{MigrateConfig, MigrationOutcome, Migrator, Verbosity};

use crate::cli::Cli;

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Cli::parse();

    let config = MigrateConfig {
        source_root: absolute(&args.source)?,
        target_root: absolute(&args.target)?,
        worker_count: args.workers.unwrap_or_else(|| num_cpus::get().max(1)),
        chunk_size_limit_mb: args.chunk_size_mb,
        chunk_file_limit: args.chunk_files,
        subprocess_timeout_s: args.archiver_timeout,
        copy_only: args.copy_only,
        create_symlink: args.symlink,
        resume_session: args.resume,
        archiver_program: args.archiver.clone(),
        ..MigrateConfig::default()
    };

    let verbosity = match args.verbose {
        0 => Verbosity::Error,
        1 => Verbosity::Info,
        _ => Verbosity::Debug,
    };

    let status = Arc::new(|message: &str, percent: Option<u8>| match percent {
        Some(p) => println!("[{p:>3}%] {message}"),
        None => println!("[ -- ] {message}"),
    });
    let log = Arc::new(|line: &str| {
        eprintln!("{} {line}", chrono::Local::now().format("%H:%M:%S%.3f"));
    });

    // The engine reports through anyhow; re-wrap for eyre at this seam.
    let migrator = Migrator::new(config, status, log, verbosity).map_err(|err| eyre!("{err:#}"))?;

    let stop = migrator.stop_handle();
    ctrlc::set_handler(move || {
        eprintln!("interrupt received, stopping…");
        stop.stop();
    })?;

    let summary = migrator.run().map_err(|err| eyre!("{err:#}"))?;
    match summary.outcome {
        MigrationOutcome::Completed => {
            println!(
                "done: {} task(s), {} bytes in {:.1?}",
                summary.planned_tasks, summary.total_bytes, summary.duration
            );
            Ok(())
        }
        MigrationOutcome::CompletedWithFailures => Err(eyre!(
            "{} of {} task(s) failed; rerun with --resume to retry",
            summary.failed_tasks,
            summary.planned_tasks
        )),
        MigrationOutcome::Cancelled => Err(eyre!("migration cancelled; session kept for --resume")),
    }
}
