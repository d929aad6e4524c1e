//! BlockingCounter - monotonic counter with deadline-bounded change waits

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ErrorKind;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CounterError {
    #[error("wait for counter to pass {lower_bound} was interrupted")]
    Interrupted { lower_bound: u64 },
}

impl CounterError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Timeout
    }
}

/// Linearizable counter whose increments wake every waiter
#[derive(Debug, Default)]
pub struct BlockingCounter {
    value: AtomicU64,
    changed: Notify,
}

impl BlockingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and wake all waiters; returns the new value
    pub fn increment(&self) -> u64 {
        let value = self.value.fetch_add(1, Ordering::SeqCst) + 1;
        self.changed.notify_waiters();
        value
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Set back to zero; the only way the value ever decreases
    pub fn reset(&self) {
        debug!("BlockingCounter::reset: called");
        self.value.store(0, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Wait until the value exceeds `lower_bound` or `deadline` passes
    ///
    /// Returns whether the condition was met. Cancelling `interrupt` aborts the
    /// wait with [`CounterError::Interrupted`] instead of returning `false`.
    pub async fn await_change_until(
        &self,
        lower_bound: u64,
        deadline: Instant,
        interrupt: &CancellationToken,
    ) -> Result<bool, CounterError> {
        loop {
            let changed = self.changed.notified();
            if self.get() > lower_bound {
                return Ok(true);
            }
            if interrupt.is_cancelled() {
                return Err(CounterError::Interrupted { lower_bound });
            }
            tokio::select! {
                biased;
                _ = interrupt.cancelled() => return Err(CounterError::Interrupted { lower_bound }),
                _ = changed => continue,
                _ = tokio::time::sleep_until(deadline) => return Ok(self.get() > lower_bound),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let counter = Arc::new(BlockingCounter::new());
        let (callers, per_caller) = (8u64, 1000u64);

        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let counter = counter.clone();
                tokio::spawn(async move {
                    for _ in 0..per_caller {
                        counter.increment();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.get(), callers * per_caller);
    }

    #[tokio::test]
    async fn test_await_change_times_out_without_increment() {
        let counter = BlockingCounter::new();
        let token = CancellationToken::new();
        let started = Instant::now();

        let met = counter
            .await_change_until(0, Instant::now() + Duration::from_millis(200), &token)
            .await
            .unwrap();

        assert!(!met);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_await_change_sees_increment() {
        let counter = Arc::new(BlockingCounter::new());
        let token = CancellationToken::new();

        let incrementer = {
            let counter = counter.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                counter.increment();
            })
        };

        let met = counter
            .await_change_until(0, Instant::now() + Duration::from_millis(200), &token)
            .await
            .unwrap();
        assert!(met);
        incrementer.await.unwrap();
    }

    #[tokio::test]
    async fn test_already_past_bound_returns_immediately() {
        let counter = BlockingCounter::new();
        counter.increment();
        counter.increment();
        let token = CancellationToken::new();

        let met = counter.await_change_until(1, Instant::now(), &token).await.unwrap();
        assert!(met);
    }

    #[tokio::test]
    async fn test_interrupted_wait_is_an_error() {
        let counter = BlockingCounter::new();
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
            })
        };

        let err = counter
            .await_change_until(0, Instant::now() + Duration::from_secs(5), &token)
            .await
            .unwrap_err();
        assert_eq!(err, CounterError::Interrupted { lower_bound: 0 });
        canceller.await.unwrap();
    }

    #[test]
    fn test_reset() {
        let counter = BlockingCounter::new();
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        counter.reset();
        assert_eq!(counter.get(), 0);
    }
}
