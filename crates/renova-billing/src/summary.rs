use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Only the first few per-item errors are carried verbatim; the rest are
/// reflected in the `failed` count.
pub const ERROR_SAMPLE_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub processed: u64,
    pub renewed: u64,
    pub escalated: u64,
    pub paused: u64,
    pub charged: u64,
    pub exhausted: u64,
    pub notices_sent: u64,
    pub skipped: u64,
    pub failed: u64,
    pub errors: Vec<String>,
}

impl RunSummary {
    pub fn record_error(&mut self, message: String) {
        self.failed += 1;
        if self.errors.len() < ERROR_SAMPLE_LIMIT {
            self.errors.push(message);
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.failed as f64 / self.processed as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DispatchStatus {
    Sent,
    AlreadySent,
    DeliveryFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoticeDispatch {
    pub obligation_id: Uuid,
    pub lead_days: i32,
    pub status: DispatchStatus,
}
