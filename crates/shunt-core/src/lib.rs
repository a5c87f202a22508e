pub mod archiver;
pub mod config;
pub mod errors;
pub mod fs_ops;
pub mod logger;
pub mod orchestrator;
pub mod pipeline;
pub mod planner;
pub mod pool;
pub mod progress;
pub mod session;
#[cfg(windows)]
pub mod win_fs;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use config::MigrateConfig;
pub use errors::EngineError;
pub use logger::{LogCallback, StatusCallback, Verbosity};
pub use orchestrator::{MigrationOutcome, MigrationSummary, Migrator, StopHandle};

/// Cooperative cancellation flag shared across pools, tasks, and the
/// subprocess supervisor. Setting it is sticky.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
