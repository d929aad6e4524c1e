//! CPU usage accounting
//!
//! [`CpuUsageAccount`] holds cumulative `combined` (user + system) and `user`
//! time in nanoseconds. The two counters are updated independently, so
//! `combined >= user` is only checked on request by
//! [`CpuUsageAccount::assert_consistent`].
//!
//! [`FractionalCpuUsage`] turns a usage delta over a quantum into fractions of
//! the machine's capacity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CpuUsageError {
    #[error("negative {counter} delta {delta}ns")]
    NegativeDelta { counter: &'static str, delta: i64 },

    #[error("{counter} went backwards from {current}ns to {attempted}ns")]
    RetrogradeClock {
        counter: &'static str,
        current: u64,
        attempted: u64,
    },

    #[error("{counter} overflowed")]
    Overflow { counter: &'static str },

    #[error("combined usage {combined}ns is below user usage {user}ns")]
    InvariantViolated { combined: u64, user: u64 },

    #[error("{counter} usage {usage:?} exceeds quantum {quantum:?}")]
    ExceedsQuantum {
        counter: &'static str,
        usage: Duration,
        quantum: Duration,
    },

    #[error("quantum must be non-zero")]
    ZeroQuantum,

    #[error("failed to sample process usage: {0}")]
    Sample(#[from] nix::errno::Errno),
}

impl CpuUsageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NegativeDelta { .. } | Self::RetrogradeClock { .. } | Self::ZeroQuantum => ErrorKind::Contract,
            Self::Overflow { .. } | Self::InvariantViolated { .. } | Self::ExceedsQuantum { .. } => {
                ErrorKind::Invariant
            }
            Self::Sample(_) => ErrorKind::Transient,
        }
    }
}

/// Point-in-time copy of an account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub combined: Duration,
    pub user: Duration,
}

impl CpuUsage {
    pub fn system(&self) -> Duration {
        self.combined.saturating_sub(self.user)
    }

    /// Usage accumulated since `earlier`
    pub fn since(&self, earlier: &CpuUsage) -> CpuUsage {
        CpuUsage {
            combined: self.combined.saturating_sub(earlier.combined),
            user: self.user.saturating_sub(earlier.user),
        }
    }
}

/// Cumulative, monotonic (combined, user) counters
#[derive(Debug, Default)]
pub struct CpuUsageAccount {
    combined: AtomicU64,
    user: AtomicU64,
}

fn add(counter: &AtomicU64, name: &'static str, delta: i64) -> Result<(), CpuUsageError> {
    let delta = u64::try_from(delta).map_err(|_| CpuUsageError::NegativeDelta { counter: name, delta })?;
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| current.checked_add(delta))
        .map(|_| ())
        .map_err(|_| CpuUsageError::Overflow { counter: name })
}

fn set(counter: &AtomicU64, name: &'static str, value: u64) -> Result<u64, CpuUsageError> {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            (value >= current).then_some(value)
        })
        .map(|previous| value - previous)
        .map_err(|current| CpuUsageError::RetrogradeClock {
            counter: name,
            current,
            attempted: value,
        })
}

impl CpuUsageAccount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_combined(&self, delta_nanos: i64) -> Result<(), CpuUsageError> {
        add(&self.combined, "combined", delta_nanos)
    }

    pub fn add_user(&self, delta_nanos: i64) -> Result<(), CpuUsageError> {
        add(&self.user, "user", delta_nanos)
    }

    /// Move `combined` forward to `nanos`; returns the delta applied
    pub fn set_combined(&self, nanos: u64) -> Result<u64, CpuUsageError> {
        set(&self.combined, "combined", nanos)
    }

    /// Move `user` forward to `nanos`; returns the delta applied
    pub fn set_user(&self, nanos: u64) -> Result<u64, CpuUsageError> {
        set(&self.user, "user", nanos)
    }

    pub fn combined(&self) -> Duration {
        Duration::from_nanos(self.combined.load(Ordering::SeqCst))
    }

    pub fn user(&self) -> Duration {
        Duration::from_nanos(self.user.load(Ordering::SeqCst))
    }

    /// combined - user
    pub fn system(&self) -> Duration {
        self.snapshot().system()
    }

    pub fn snapshot(&self) -> CpuUsage {
        CpuUsage {
            combined: self.combined(),
            user: self.user(),
        }
    }

    pub fn assert_consistent(&self) -> Result<(), CpuUsageError> {
        let combined = self.combined.load(Ordering::SeqCst);
        let user = self.user.load(Ordering::SeqCst);
        if combined < user {
            return Err(CpuUsageError::InvariantViolated { combined, user });
        }
        Ok(())
    }
}

/// CPU usage over one quantum, as fractions of all available cores
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FractionalCpuUsage {
    combined: f64,
    user: f64,
}

impl FractionalCpuUsage {
    /// Normalize by the number of cores this process may run on
    pub fn new(usage: CpuUsage, quantum: Duration) -> Result<Self, CpuUsageError> {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self::with_cores(usage, quantum, cores)
    }

    pub fn with_cores(usage: CpuUsage, quantum: Duration, cores: usize) -> Result<Self, CpuUsageError> {
        if quantum.is_zero() {
            return Err(CpuUsageError::ZeroQuantum);
        }
        let cores = cores.max(1) as u32;
        let combined = usage.combined / cores;
        let user = usage.user / cores;

        for (counter, value) in [("combined", combined), ("user", user)] {
            if value > quantum {
                return Err(CpuUsageError::ExceedsQuantum {
                    counter,
                    usage: value,
                    quantum,
                });
            }
        }

        let quantum_secs = quantum.as_secs_f64();
        Ok(Self {
            combined: combined.as_secs_f64() / quantum_secs,
            user: user.as_secs_f64() / quantum_secs,
        })
    }

    pub fn combined(&self) -> f64 {
        self.combined
    }

    pub fn user(&self) -> f64 {
        self.user
    }

    pub fn system(&self) -> f64 {
        (self.combined - self.user).max(0.0)
    }
}
