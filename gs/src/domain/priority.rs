//! Priority policies for ordering waiting jobs

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::job::Job;

/// Scheduler load as seen by a policy when a job is (re)queued
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PolicyContext {
    /// Jobs of the same owner currently RUNNING
    pub running_for_owner: usize,
    /// Jobs of the same owner RUNNING or handed to a worker
    pub in_flight_for_owner: usize,
    /// All RUNNING jobs in the scheduler
    pub running_total: usize,
    /// Average busy workers over the load window
    pub load: f64,
}

/// Assigns the priority a waiting job is ordered by; higher is served first
pub trait PriorityPolicy: Send + Sync {
    fn evaluate(&self, job: &Job, cx: &PolicyContext) -> i64;

    /// Delay before a job in RETRY_WAIT is re-admitted
    fn retry_delay(&self, _job: &Job, default: Duration) -> Duration {
        default
    }

    fn name(&self) -> &'static str;
}

/// Every job gets the same priority, so arrival order decides
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoPolicy;

impl PriorityPolicy for FifoPolicy {
    fn evaluate(&self, _job: &Job, _cx: &PolicyContext) -> i64 {
        0
    }

    fn name(&self) -> &'static str {
        "fifo"
    }
}

/// Owners with less work in flight go first
#[derive(Debug, Clone, Copy, Default)]
pub struct FairSharePolicy;

impl PriorityPolicy for FairSharePolicy {
    fn evaluate(&self, _job: &Job, cx: &PolicyContext) -> i64 {
        -i64::try_from(cx.in_flight_for_owner).unwrap_or(i64::MAX)
    }

    fn name(&self) -> &'static str {
        "fair-share"
    }
}

/// Policy selector used in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    #[default]
    Fifo,
    FairShare,
}

impl PolicyKind {
    pub fn build(self) -> Arc<dyn PriorityPolicy> {
        match self {
            Self::Fifo => Arc::new(FifoPolicy),
            Self::FairShare => Arc::new(FairSharePolicy),
        }
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fifo => write!(f, "fifo"),
            Self::FairShare => write!(f, "fair-share"),
        }
    }
}

impl std::str::FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "fair-share" | "fairshare" => Ok(Self::FairShare),
            _ => Err(format!("Unknown priority policy: {}", s)),
        }
    }
}
