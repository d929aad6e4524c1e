//! RetryTimer - one timer task re-admitting jobs out of RETRY_WAIT
//!
//! Every scheduler shares the same timer. Requests arrive over a channel,
//! due entries sit in a min-heap and the task sleeps until the earliest one.
//! Re-admission runs in its own task, scoped to the job's diagnostic context,
//! so a slow scheduler never delays another one's retries.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info};

use crate::context::DiagnosticContext;
use crate::domain::JobId;

use super::error::SchedulerError;

/// Receiver of due retries
#[async_trait]
pub trait RetryTarget: Send + Sync {
    /// Move `job` from RETRY_WAIT back to WAITING
    async fn readmit(&self, job: JobId, cx: DiagnosticContext);

    fn name(&self) -> &str;
}

enum RetryRequest {
    Schedule(Due),
    Pending { reply_tx: oneshot::Sender<usize> },
    Shutdown,
}

struct Due {
    at: Instant,
    seq: u64,
    job: JobId,
    cx: DiagnosticContext,
    target: Weak<dyn RetryTarget>,
}

impl PartialEq for Due {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Due {}

impl Ord for Due {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Due {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Handle to the shared retry timer task
#[derive(Clone)]
pub struct RetryTimer {
    tx: mpsc::UnboundedSender<RetryRequest>,
}

impl std::fmt::Debug for RetryTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryTimer").field("closed", &self.tx.is_closed()).finish()
    }
}

impl RetryTimer {
    /// Start the timer task
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx));
        (Self { tx }, task)
    }

    /// Re-admit `job` into `target` once `delay` has elapsed
    pub fn schedule(
        &self,
        job: JobId,
        delay: Duration,
        cx: DiagnosticContext,
        target: Weak<dyn RetryTarget>,
    ) -> Result<(), SchedulerError> {
        debug!(%job, ?delay, "RetryTimer::schedule: called");
        self.tx
            .send(RetryRequest::Schedule(Due {
                at: Instant::now() + delay,
                seq: 0,
                job,
                cx,
                target,
            }))
            .map_err(|_| SchedulerError::RetryTimerClosed)
    }

    /// Number of retries not yet due
    pub async fn pending(&self) -> Result<usize, SchedulerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RetryRequest::Pending { reply_tx })
            .map_err(|_| SchedulerError::RetryTimerClosed)?;
        reply_rx.await.map_err(|_| SchedulerError::RetryTimerClosed)
    }

    /// Stop the timer; retries not yet due are dropped
    pub fn shutdown(&self) {
        debug!("RetryTimer::shutdown: called");
        let _ = self.tx.send(RetryRequest::Shutdown);
    }
}

fn fire(due: Due) {
    let Some(target) = due.target.upgrade() else {
        debug!(job = %due.job, "RetryTimer: target gone, dropping retry");
        return;
    };
    let span = due.cx.span(target.name(), due.job);
    tokio::spawn(async move { target.readmit(due.job, due.cx).await }.instrument(span));
}

async fn run(mut rx: mpsc::UnboundedReceiver<RetryRequest>) {
    let mut pending: BinaryHeap<Reverse<Due>> = BinaryHeap::new();
    let mut next_seq = 0u64;

    info!("RetryTimer started");

    loop {
        let wake_at = pending
            .peek()
            .map(|Reverse(due)| due.at)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            req = rx.recv() => match req {
                Some(RetryRequest::Schedule(mut due)) => {
                    due.seq = next_seq;
                    next_seq += 1;
                    pending.push(Reverse(due));
                }
                Some(RetryRequest::Pending { reply_tx }) => {
                    let _ = reply_tx.send(pending.len());
                }
                Some(RetryRequest::Shutdown) | None => {
                    info!(dropped = pending.len(), "RetryTimer shutting down");
                    break;
                }
            },
            _ = tokio::time::sleep_until(wake_at), if !pending.is_empty() => {
                let now = Instant::now();
                while pending.peek().is_some_and(|Reverse(due)| due.at <= now) {
                    if let Some(Reverse(due)) = pending.pop() {
                        fire(due);
                    }
                }
            }
        }
    }

    info!("RetryTimer stopped");
}
