//! Error classification shared by every component
//!
//! Each component defines its own `thiserror` enum; all of them map onto
//! [`ErrorKind`] so callers can branch on "back off and retry" versus
//! "this is a bug" without matching every variant.

use serde::{Deserialize, Serialize};

/// Broad category of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Admission refused; the caller should back off and try again later
    Capacity,
    /// Caller bug: illegal transition, double release, unbalanced calls
    Contract,
    /// Recoverable operation failure that drives the retry loop
    Transient,
    /// Non-recoverable failure, or retries exhausted
    Terminal,
    /// A deadline passed
    Timeout,
    /// A consistency check failed
    Invariant,
}

impl ErrorKind {
    /// Whether retrying the same call later can succeed
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Capacity | Self::Transient)
    }

    /// Whether this indicates a programming error in the caller
    pub fn is_bug(self) -> bool {
        matches!(self, Self::Contract | Self::Invariant)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Capacity => write!(f, "capacity"),
            Self::Contract => write!(f, "contract"),
            Self::Transient => write!(f, "transient"),
            Self::Terminal => write!(f, "terminal"),
            Self::Timeout => write!(f, "timeout"),
            Self::Invariant => write!(f, "invariant"),
        }
    }
}
