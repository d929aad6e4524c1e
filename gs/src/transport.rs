//! Endpoint - request/reply delivery to the surrounding system
//!
//! Job bodies talk to storage pools, peers and tape systems through an
//! [`Endpoint`]. The scheduler never calls one itself; a body converts the
//! [`DeliveryError`] it gets back into a [`JobFailure`] with `?`.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::error::ErrorKind;
use crate::scheduler::JobFailure;

/// Errors returned by an endpoint
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("No route to {0}")]
    NoRoute(String),

    #[error("Destination busy, retry after {retry_after:?}")]
    Busy { retry_after: Duration },

    #[error("Reply timed out after {0:?}")]
    Timeout(Duration),

    #[error("Destination error {code}: {message}")]
    Remote { code: u32, message: String },

    #[error("Endpoint closed")]
    Closed,
}

impl DeliveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoRoute(_) | Self::Busy { .. } => ErrorKind::Transient,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Remote { code, .. } if Self::remote_is_transient(*code) => ErrorKind::Transient,
            Self::Remote { .. } | Self::Closed => ErrorKind::Terminal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoRoute(_) | Self::Busy { .. } | Self::Timeout(_) => true,
            Self::Remote { code, .. } => Self::remote_is_transient(*code),
            Self::Closed => false,
        }
    }

    /// Get the retry duration if the destination asked for one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Busy { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    // 10xxx codes are the "try again later" range
    fn remote_is_transient(code: u32) -> bool {
        (10_000..11_000).contains(&code)
    }
}

impl From<DeliveryError> for JobFailure {
    fn from(err: DeliveryError) -> Self {
        if err.is_retryable() {
            JobFailure::Transient(err.to_string())
        } else {
            JobFailure::Terminal(err.to_string())
        }
    }
}

/// Asynchronous request/reply channel to one destination
#[async_trait]
pub trait Endpoint: Send + Sync {
    type Request: Send + 'static;
    type Reply: Send + 'static;

    /// Deliver `request` and wait for the reply or an error
    async fn deliver(&self, request: Self::Request) -> Result<Self::Reply, DeliveryError>;

    /// Destination name, for logs
    fn name(&self) -> &str;
}

/// Deliver with a reply deadline
pub async fn deliver_with_timeout<E>(endpoint: &E, request: E::Request, timeout: Duration) -> Result<E::Reply, DeliveryError>
where
    E: Endpoint + ?Sized,
{
    debug!(endpoint = endpoint.name(), ?timeout, "deliver_with_timeout: called");
    match tokio::time::timeout(timeout, endpoint.deliver(request)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(endpoint = endpoint.name(), "deliver_with_timeout: timed out");
            Err(DeliveryError::Timeout(timeout))
        }
    }
}
