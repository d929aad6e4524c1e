//! Operation bodies executed by scheduler workers

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::DiagnosticContext;
use crate::domain::Job;
use crate::error::ErrorKind;
use crate::sync::LockOwner;

/// Outcome of a failed body run
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobFailure {
    /// Worth retrying after the retry timeout
    #[error("{0}")]
    Transient(String),

    /// Retrying cannot help
    #[error("{0}")]
    Terminal(String),

    /// The body observed the cancel flag and stopped
    #[error("canceled")]
    Canceled,

    /// The job's lifetime ran out while the body was running
    #[error("lifetime exceeded")]
    TimedOut,
}

impl JobFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Terminal(_) | Self::Canceled => ErrorKind::Terminal,
            Self::TimedOut => ErrorKind::Timeout,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// What a body sees of the job it runs
///
/// The worker does not hold the job's lock while the body runs. A body that
/// needs a consistent view for a synchronous step can take it with
/// [`RunContext::owner`], which is the worker's own lock identity.
#[derive(Debug, Clone)]
pub struct RunContext {
    job: Arc<Job>,
    diagnostic: DiagnosticContext,
    owner: LockOwner,
}

impl RunContext {
    pub(crate) fn new(job: Arc<Job>, diagnostic: DiagnosticContext, owner: LockOwner) -> Self {
        Self { job, diagnostic, owner }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn diagnostic(&self) -> &DiagnosticContext {
        &self.diagnostic
    }

    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.job.retry_count() + 1
    }

    pub fn cancelled(&self) -> bool {
        self.job.is_cancel_requested()
    }

    /// Safe point: fails with [`JobFailure::Canceled`] once cancellation was requested
    pub fn checkpoint(&self) -> Result<(), JobFailure> {
        if self.cancelled() {
            return Err(JobFailure::Canceled);
        }
        Ok(())
    }

    /// Resolves once cancellation is requested
    pub async fn until_cancelled(&self) {
        self.job.cancel_token().cancelled().await
    }
}

/// The operation a scheduler runs for each job of its kind
#[async_trait]
pub trait JobBody: Send + Sync {
    async fn run(&self, cx: &RunContext) -> Result<(), JobFailure>;
}
