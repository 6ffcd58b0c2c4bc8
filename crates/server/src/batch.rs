//! Shared plumbing for the long-running batch operations (full score
//! recalculation, duplicate sweep): the summary report shape and the
//! cooperative cancellation flag. Per-item failures are collected, never
//! thrown; a batch request always returns a summary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Cooperative cancellation signal checked between per-lead units of work,
/// never mid-transaction. Cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    /// True when the run stopped at the cancellation flag; the checkpoint
    /// then points at the last processed lead so a rerun resumes.
    pub cancelled: bool,
    pub failures: Vec<BatchFailure>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub lead_id: String,
    pub error: String,
}

impl BatchReport {
    pub fn record_success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, lead_id: &str, error: impl std::fmt::Display) {
        self.processed += 1;
        self.failed += 1;
        self.failures.push(BatchFailure { lead_id: lead_id.to_string(), error: error.to_string() });
    }
}
