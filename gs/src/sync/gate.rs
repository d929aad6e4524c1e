//! Gate - open/closed barrier for new entrants
//!
//! Closing the gate only stops new entrants; anyone already holding a
//! [`GatePass`] keeps it until the pass is dropped.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct GateState {
    open: bool,
    inside: usize,
}

/// Two-state barrier; open/close are serialized by an internal mutex
#[derive(Debug)]
pub struct Gate {
    state: Mutex<GateState>,
    opened: Notify,
}

/// Proof of admission; leaving is implicit on drop
#[derive(Debug)]
pub struct GatePass<'a> {
    gate: &'a Gate,
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state();
        state.inside = state.inside.saturating_sub(1);
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Gate {
    pub fn new(open: bool) -> Self {
        Self {
            state: Mutex::new(GateState { open, inside: 0 }),
            opened: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open(&self) {
        debug!("Gate::open: called");
        self.state().open = true;
        self.opened.notify_waiters();
    }

    pub fn close(&self) {
        debug!("Gate::close: called");
        self.state().open = false;
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    /// Number of entrants currently holding a pass
    pub fn inside(&self) -> usize {
        self.state().inside
    }

    /// Enter if the gate is open right now
    pub fn try_enter(&self) -> Option<GatePass<'_>> {
        let mut state = self.state();
        if !state.open {
            return None;
        }
        state.inside += 1;
        Some(GatePass { gate: self })
    }

    /// Wait until the gate is open, then enter
    pub async fn enter(&self) -> GatePass<'_> {
        loop {
            // Registered before the check so an open() in between is not missed
            let opened = self.opened.notified();
            if let Some(pass) = self.try_enter() {
                return pass;
            }
            opened.await;
        }
    }

    /// Like [`Self::enter`], but gives up at `deadline`
    pub async fn enter_until(&self, deadline: Instant) -> Option<GatePass<'_>> {
        tokio::time::timeout_at(deadline, self.enter()).await.ok()
    }
}
