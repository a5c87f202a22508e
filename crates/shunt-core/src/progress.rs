//! Aggregated byte progress with integer-percent throttling.

use parking_lot::Mutex;

use crate::logger::StatusSink;

struct ProgressInner {
    processed: u64,
    last_percent: Option<u8>,
}

/// Mutex-guarded processed-bytes counter. The status callback fires only
/// when the integer percentage strictly advances, so callers see a
/// monotone 0..=100 sequence no matter how many workers credit bytes.
pub struct ProgressTracker {
    total_bytes: u64,
    status: StatusSink,
    inner: Mutex<ProgressInner>,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64, status: StatusSink) -> Self {
        Self {
            total_bytes,
            status,
            inner: Mutex::new(ProgressInner {
                processed: 0,
                last_percent: None,
            }),
        }
    }

    /// Credit bytes toward completion and emit a throttled status update.
    pub fn credit(&self, bytes: u64) {
        let advanced = {
            let mut inner = self.inner.lock();
            inner.processed = inner.processed.saturating_add(bytes).min(self.total_bytes);
            let percent = self.percent_of(inner.processed);
            if inner.last_percent.is_none_or(|last| percent > last) {
                inner.last_percent = Some(percent);
                Some(percent)
            } else {
                None
            }
        };
        // Callback runs outside the lock.
        if let Some(percent) = advanced {
            self.status
                .emit(&format!("transferred {percent}%"), Some(percent));
        }
    }

    pub fn processed(&self) -> u64 {
        self.inner.lock().processed
    }

    pub fn total(&self) -> u64 {
        self.total_bytes
    }

    fn percent_of(&self, processed: u64) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        ((processed.saturating_mul(100)) / self.total_bytes).min(100) as u8
    }
}
