//! Concurrency primitives the scheduler is built from
//!
//! - [`GeneralizedLock`] - upgradeable, re-entrant read/write lock guarding job state
//! - [`Gate`] - barrier that blocks new entrants without evicting current ones
//! - [`BlockingCounter`] - monotonic counter with deadline-bounded change waits
//!
//! None of these retry internally; retry policy lives in the scheduler.

mod counter;
mod gate;
mod lock;

pub use counter::{BlockingCounter, CounterError};
pub use gate::{Gate, GatePass};
pub use lock::{GeneralizedLock, LockError, LockMode, LockOwner};
