//! Queue types for the scheduler

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::JobId;

/// Position of a WAITING job in dispatch order
///
/// Sorts so that iterating a `BTreeSet<QueueKey>` yields the next job to
/// dispatch first: higher priority, then earlier arrival, then lower id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub priority: i64,
    pub seq: u64,
    pub id: JobId,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Statistics for the scheduler
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_timed_out: u64,
    pub total_retried: u64,
    pub total_canceled: u64,
    pub peak_waiting: usize,
    pub peak_running: usize,
}

/// Snapshot of queue occupancy
#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    pub waiting: usize,
    pub ready: usize,
    pub running: usize,
    pub retry_wait: usize,
    pub paused: bool,
    /// Time-weighted average of running bodies over the load window
    pub load: f64,
    pub stats: SchedulerStats,
}

/// One non-terminal job as listed by `queue_details`
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub job: JobId,
    pub owner: String,
    pub priority: i64,
    pub status: QueueEntryStatus,
    /// Time spent in the current status
    pub wait_time: Duration,
}

/// Status of a queue entry, in listing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueEntryStatus {
    Running,
    Ready,
    Waiting,
    RetryWait,
}
