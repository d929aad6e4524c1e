//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::PolicyKind;

/// Per-kind scheduler configuration
///
/// A bound of 0 means unbounded, except `thread_pool_size` which must be at least 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Worker tasks pulling from the waiting queue
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,

    /// Max admitted jobs not yet running: waiting, handed to a worker, or waiting to retry
    #[serde(default = "default_bound")]
    pub max_queue_size: usize,

    /// Max jobs in WAITING
    #[serde(default = "default_bound")]
    pub max_waiting_jobs: usize,

    /// Max jobs taken off the waiting queue: handed to a worker or RUNNING
    #[serde(default = "default_bound")]
    pub max_ready_queue_size: usize,

    /// Max jobs handed to a worker that has not started them yet
    #[serde(default = "default_bound")]
    pub max_ready_jobs: usize,

    /// Max RUNNING jobs per owner
    #[serde(default = "default_max_running_by_owner")]
    pub max_running_by_owner: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u64,

    /// Lifetime given to jobs that do not carry their own
    #[serde(default = "default_lifetime_secs")]
    pub default_lifetime_secs: u64,

    /// Retention window of the load observer
    #[serde(default = "default_load_window_ms")]
    pub load_window_ms: u64,

    #[serde(default)]
    pub priority_policy: PolicyKind,
}

fn default_thread_pool_size() -> usize {
    10
}

fn default_bound() -> usize {
    1000
}

fn default_max_running_by_owner() -> usize {
    10
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_timeout_ms() -> u64 {
    60_000
}

fn default_lifetime_secs() -> u64 {
    4 * 60 * 60
}

fn default_load_window_ms() -> u64 {
    60_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: 10,
            max_queue_size: 1000,
            max_waiting_jobs: 1000,
            max_ready_queue_size: 1000,
            max_ready_jobs: 1000,
            max_running_by_owner: 10,
            max_retries: 10,
            retry_timeout_ms: 60_000,
            default_lifetime_secs: 4 * 60 * 60,
            load_window_ms: 60_000,
            priority_policy: PolicyKind::Fifo,
        }
    }
}

/// `true` when `count` has reached a bound where 0 means unbounded
pub(crate) fn at_bound(count: usize, bound: usize) -> bool {
    bound != 0 && count >= bound
}

impl SchedulerConfig {
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    pub fn default_lifetime(&self) -> Duration {
        Duration::from_secs(self.default_lifetime_secs)
    }

    pub fn load_window(&self) -> Duration {
        Duration::from_millis(self.load_window_ms)
    }

    /// Reject settings a scheduler cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.thread_pool_size == 0 {
            return Err("thread-pool-size must be at least 1".to_string());
        }
        if self.load_window_ms == 0 {
            return Err("load-window-ms must be at least 1".to_string());
        }
        Ok(())
    }
}
