//! LoadObserver - sliding-window estimate of concurrently active workers
//!
//! Keeps a time-ordered history of `+1`/`-1` events. The load is the
//! integral of the active-worker count over the retention window divided by
//! the window length, so one worker busy for the whole window reads 1.0.
//!
//! Events older than the window are folded into a base count lazily, at most
//! once per purge pause, so bursts of events do not pay for a purge each.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::ErrorKind;

const DEFAULT_PURGE_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("worker_finished called with no worker outstanding")]
    Unbalanced,
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Contract
    }
}

#[derive(Debug)]
struct History {
    /// Active count before the oldest retained event
    base: i64,
    active: i64,
    events: VecDeque<(Instant, i64)>,
    last_purge: Instant,
    created: Instant,
}

impl History {
    fn record(&mut self, at: Instant, delta: i64) {
        // Callers may race on timestamps; keep the history ordered
        let at = self.events.back().map_or(at, |(last, _)| at.max(*last));
        self.active += delta;
        self.events.push_back((at, delta));
    }

    fn purge(&mut self, now: Instant, window: Duration) -> usize {
        let Some(cutoff) = now.checked_sub(window) else {
            return 0;
        };
        let mut purged = 0;
        while let Some(&(at, delta)) = self.events.front() {
            if at > cutoff {
                break;
            }
            self.base += delta;
            self.events.pop_front();
            purged += 1;
        }
        self.last_purge = now;
        purged
    }
}

/// Time-weighted average of active workers over a retention window
#[derive(Debug)]
pub struct LoadObserver {
    window: Duration,
    purge_pause: Duration,
    history: Mutex<History>,
}

impl LoadObserver {
    pub fn new(window: Duration) -> Self {
        Self::with_purge_pause(window, DEFAULT_PURGE_PAUSE.min(window))
    }

    pub fn with_purge_pause(window: Duration, purge_pause: Duration) -> Self {
        debug!(?window, ?purge_pause, "LoadObserver::new: called");
        let now = Instant::now();
        Self {
            window,
            purge_pause,
            history: Mutex::new(History {
                base: 0,
                active: 0,
                events: VecDeque::new(),
                last_purge: now,
                created: now,
            }),
        }
    }

    fn history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn worker_started(&self) {
        self.worker_started_at(Instant::now());
    }

    pub fn worker_started_at(&self, now: Instant) {
        let mut history = self.history();
        history.record(now, 1);
        self.maybe_purge(&mut history, now);
    }

    pub fn worker_finished(&self) -> Result<(), LoadError> {
        self.worker_finished_at(Instant::now())
    }

    pub fn worker_finished_at(&self, now: Instant) -> Result<(), LoadError> {
        let mut history = self.history();
        if history.active <= 0 {
            warn!("LoadObserver::worker_finished: no worker outstanding");
            return Err(LoadError::Unbalanced);
        }
        history.record(now, -1);
        self.maybe_purge(&mut history, now);
        Ok(())
    }

    /// Workers active right now
    pub fn active(&self) -> usize {
        self.history().active.max(0) as usize
    }

    pub fn current_load(&self) -> f64 {
        self.current_load_at(Instant::now())
    }

    pub fn current_load_at(&self, now: Instant) -> f64 {
        let mut history = self.history();
        self.maybe_purge(&mut history, now);

        let window_secs = self.window.as_secs_f64();
        if window_secs == 0.0 {
            return history.active.max(0) as f64;
        }

        let start = now.checked_sub(self.window).unwrap_or(history.created);
        let mut level = history.base;
        let mut cursor = start;
        let mut integral = 0.0;
        for &(at, delta) in &history.events {
            if at > now {
                break;
            }
            if at > cursor {
                integral += level as f64 * (at - cursor).as_secs_f64();
                cursor = at;
            }
            level += delta;
        }
        integral += level as f64 * now.saturating_duration_since(cursor).as_secs_f64();

        integral / window_secs
    }

    fn maybe_purge(&self, history: &mut History, now: Instant) {
        if now.saturating_duration_since(history.last_purge) < self.purge_pause {
            return;
        }
        let purged = history.purge(now, self.window);
        if purged > 0 {
            debug!(purged, "LoadObserver::maybe_purge: folded expired events");
        }
    }
}
