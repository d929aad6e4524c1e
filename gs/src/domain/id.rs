//! Job and request identifiers
//!
//! Ids are signed 64-bit values drawn from a wrapping allocator: after
//! `i64::MAX` comes `i64::MIN`. Numeric order is therefore not allocation
//! order; see [`super::sequence`] for how ordinals are recovered.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Stable identity of a job, unique within the installation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

/// Identity of the compound request a job belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(i64);

macro_rules! raw_id {
    ($name:ident) => {
        impl $name {
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            pub const fn as_i64(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

raw_id!(JobId);
raw_id!(RequestId);

/// Wrapping id allocator shared by jobs and requests
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicI64,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl IdAllocator {
    pub fn starting_at(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }

    /// Next raw id; wraps from `i64::MAX` to `i64::MIN`
    pub fn next_raw(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_job_id(&self) -> JobId {
        JobId(self.next_raw())
    }

    pub fn next_request_id(&self) -> RequestId {
        RequestId(self.next_raw())
    }
}
