//! Gridsched - job scheduling engine for a grid storage system
//!
//! Every client request (list, read, write, stage, copy, reserve) becomes one
//! or more jobs. Each job kind gets its own scheduler that admits jobs under
//! capacity and per-owner fairness limits, runs them on a bounded worker pool,
//! retries recoverable failures after a delay and drives every job to a
//! terminal state.
//!
//! # Core Concepts
//!
//! - **Explicit state machine**: jobs move QUEUED → WAITING → RUNNING and end
//!   DONE, FAILED or CANCELED; every mutation holds the job's write lock
//! - **Refuse, don't block**: admission over a bound fails fast with a
//!   capacity error the caller can back off on
//! - **Cooperative cancellation**: a running body sees the cancel flag and
//!   stops on its own
//! - **Wrap-aware ordinals**: member ordinals of a compound request follow
//!   allocation order even when ids wrap past `i64::MAX`
//!
//! # Modules
//!
//! - [`scheduler`] - schedulers, the registry and the shared retry timer
//! - [`domain`] - jobs, ids, request sequencing and priority policies
//! - [`sync`] - generalized lock, gate and blocking counter
//! - [`metrics`] - load observer and CPU usage accounting
//! - [`transport`] - request/reply endpoints used by job bodies
//! - [`context`] - diagnostic context carried across tasks
//! - [`config`] - configuration types and loading
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod scheduler;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use context::DiagnosticContext;
pub use domain::{CompoundRequest, Job, JobId, JobKind, JobState, RequestId};
pub use error::ErrorKind;
pub use scheduler::{JobBody, JobFailure, RunContext, Scheduler, SchedulerConfig, SchedulerError, SchedulerRegistry};
pub use transport::{DeliveryError, Endpoint};
