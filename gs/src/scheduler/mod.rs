//! Job scheduling: admission, ordering, execution and retry
//!
//! - [`Scheduler`] - one job kind's queue, worker pool and retry driver
//! - [`SchedulerRegistry`] - the schedulers of an installation, keyed by kind
//! - [`RetryTimer`] - timer task shared by every scheduler
//! - [`JobBody`] - the operation a scheduler runs for each job

mod body;
mod config;
mod core;
mod error;
mod queue;
mod registry;
mod retry;

pub use body::{JobBody, JobFailure, RunContext};
pub use config::SchedulerConfig;
pub use core::Scheduler;
pub use error::{CapacityReason, SchedulerError};
pub use queue::{QueueEntry, QueueEntryStatus, QueueKey, QueueState, SchedulerStats};
pub use registry::SchedulerRegistry;
pub use retry::{RetryTarget, RetryTimer};
