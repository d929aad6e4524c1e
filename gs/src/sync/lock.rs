//! GeneralizedLock - upgradeable read/write lock keyed by logical owner
//!
//! Holders are identified by a [`LockOwner`] rather than by task or thread, so
//! one worker can enter a job, re-enter it during a multi-step operation, and
//! upgrade its read hold to a write hold without deadlocking on itself.
//!
//! The lock is a small state machine behind a std mutex:
//!
//! - `holders`: per-owner stack of granted modes; popping the stack is what
//!   `release()` does, so a release after an upgrade restores the read hold
//! - `waiters`: arena of waiter records keyed by arrival ticket; iteration order
//!   is arrival order, which gives FIFO service per request
//! - `upgrade`: ticket of the single pending upgrade, served ahead of the queue
//!   as soon as the upgrading owner is the only holder
//!
//! A reader never overtakes a queued writer, so a stream of readers cannot
//! starve writers. Abandoned waits (deadline or dropped future) withdraw their
//! record; a grant that raced with abandonment is handed back.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::error::ErrorKind;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Logical identity of a lock holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockOwner(u64);

impl LockOwner {
    /// Allocate a process-unique owner identity
    pub fn next() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

/// Mode a lock (or one owner's hold on it) is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    None,
    Read,
    Write,
}

/// Contract violations reported by [`GeneralizedLock`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("{owner} released a lock it does not hold")]
    NotHeld { owner: LockOwner },

    #[error("{owner} must hold the lock for reading before upgrading")]
    UpgradeWithoutRead { owner: LockOwner },

    #[error("{owner} cannot upgrade while {pending} is already upgrading")]
    UpgradeConflict { owner: LockOwner, pending: LockOwner },
}

impl LockError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Contract
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Read,
    Write,
    Upgrade,
}

struct Waiter {
    owner: LockOwner,
    request: Request,
    tx: oneshot::Sender<()>,
}

enum Admission {
    Granted,
    Queued { ticket: u64, rx: oneshot::Receiver<()> },
}

#[derive(Default)]
struct LockState {
    holders: HashMap<LockOwner, Vec<LockMode>>,
    waiters: BTreeMap<u64, Waiter>,
    upgrade: Option<u64>,
    next_ticket: u64,
}

impl LockState {
    fn mode_of(&self, owner: LockOwner) -> LockMode {
        self.holders
            .get(&owner)
            .and_then(|stack| stack.iter().max().copied())
            .unwrap_or(LockMode::None)
    }

    fn mode(&self) -> LockMode {
        self.holders
            .values()
            .flat_map(|stack| stack.iter())
            .max()
            .copied()
            .unwrap_or(LockMode::None)
    }

    fn push(&mut self, owner: LockOwner, mode: LockMode) {
        self.holders.entry(owner).or_default().push(mode);
    }

    fn pop(&mut self, owner: LockOwner) -> Option<LockMode> {
        let stack = self.holders.get_mut(&owner)?;
        let mode = stack.pop();
        if stack.is_empty() {
            self.holders.remove(&owner);
        }
        mode
    }

    fn sole_holder(&self, owner: LockOwner) -> bool {
        self.holders.keys().all(|holder| *holder == owner)
    }

    fn pending_upgrader(&self) -> Option<LockOwner> {
        self.upgrade
            .and_then(|ticket| self.waiters.get(&ticket))
            .map(|waiter| waiter.owner)
    }

    fn admit(&mut self, owner: LockOwner, request: Request) -> Result<Admission, LockError> {
        let held = self.mode_of(owner);
        let request = match (request, held) {
            // Re-entry by the same owner never queues
            (Request::Read, LockMode::Read | LockMode::Write) => {
                self.push(owner, LockMode::Read);
                return Ok(Admission::Granted);
            }
            (Request::Write | Request::Upgrade, LockMode::Write) => {
                self.push(owner, LockMode::Write);
                return Ok(Admission::Granted);
            }
            (Request::Write, LockMode::Read) => Request::Upgrade,
            (Request::Upgrade, LockMode::None) => return Err(LockError::UpgradeWithoutRead { owner }),
            (request, _) => request,
        };

        let granted = match request {
            Request::Upgrade => {
                if let Some(pending) = self.pending_upgrader() {
                    return Err(LockError::UpgradeConflict { owner, pending });
                }
                self.sole_holder(owner)
            }
            Request::Read => self.upgrade.is_none() && self.waiters.is_empty() && self.mode() != LockMode::Write,
            Request::Write => self.upgrade.is_none() && self.waiters.is_empty() && self.holders.is_empty(),
        };

        if granted {
            let mode = if request == Request::Read {
                LockMode::Read
            } else {
                LockMode::Write
            };
            self.push(owner, mode);
            return Ok(Admission::Granted);
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(ticket, Waiter { owner, request, tx });
        if request == Request::Upgrade {
            self.upgrade = Some(ticket);
        }
        Ok(Admission::Queued { ticket, rx })
    }

    /// Hand the lock to every waiter that can now hold it
    fn grant_waiters(&mut self) -> usize {
        let mut granted = 0;

        if let Some(ticket) = self.upgrade {
            let Some(owner) = self.waiters.get(&ticket).map(|waiter| waiter.owner) else {
                self.upgrade = None;
                return self.grant_waiters();
            };
            if !self.sole_holder(owner) {
                return 0;
            }
            self.upgrade = None;
            if let Some(waiter) = self.waiters.remove(&ticket) {
                self.push(owner, LockMode::Write);
                if waiter.tx.send(()).is_ok() {
                    return 1;
                }
                self.pop(owner);
            }
        }

        loop {
            let Some((&ticket, waiter)) = self.waiters.first_key_value() else {
                break;
            };
            let grantable = match waiter.request {
                Request::Read => self.mode() != LockMode::Write,
                Request::Write => self.holders.is_empty(),
                Request::Upgrade => false,
            };
            if !grantable {
                break;
            }
            let Some(waiter) = self.waiters.remove(&ticket) else {
                break;
            };
            let mode = if waiter.request == Request::Read {
                LockMode::Read
            } else {
                LockMode::Write
            };
            self.push(waiter.owner, mode);
            if waiter.tx.send(()).is_err() {
                self.pop(waiter.owner);
                continue;
            }
            granted += 1;
        }
        granted
    }

    fn withdraw(&mut self, ticket: u64) -> bool {
        if self.waiters.remove(&ticket).is_none() {
            return false;
        }
        if self.upgrade == Some(ticket) {
            self.upgrade = None;
        }
        self.grant_waiters();
        true
    }
}

/// Queued acquisition; withdraws its waiter record if abandoned
struct PendingAcquire<'a> {
    lock: &'a GeneralizedLock,
    owner: LockOwner,
    ticket: u64,
    rx: oneshot::Receiver<()>,
    armed: bool,
}

impl PendingAcquire<'_> {
    /// Give up waiting; returns true if the grant won the race
    fn withdraw(&mut self) -> bool {
        self.armed = false;
        let mut state = self.lock.state();
        !state.withdraw(self.ticket)
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.lock.state();
        if !state.withdraw(self.ticket) {
            // Granted, but nobody is left to observe it
            state.pop(self.owner);
            state.grant_waiters();
        }
    }
}

/// Upgradeable, re-entrant, FIFO-fair read/write lock
#[derive(Default)]
pub struct GeneralizedLock {
    state: Mutex<LockState>,
}

impl std::fmt::Debug for GeneralizedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("GeneralizedLock")
            .field("mode", &state.mode())
            .field("holders", &state.holders.len())
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl GeneralizedLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire shared access, waiting behind any queued writer
    pub async fn acquire_read(&self, owner: LockOwner) -> Result<(), LockError> {
        self.acquire(owner, Request::Read, None).await.map(|_| ())
    }

    /// Acquire exclusive access; an owner already reading is upgraded
    pub async fn acquire_write(&self, owner: LockOwner) -> Result<(), LockError> {
        self.acquire(owner, Request::Write, None).await.map(|_| ())
    }

    /// Upgrade an existing read hold to write once all other holders leave
    pub async fn upgrade(&self, owner: LockOwner) -> Result<(), LockError> {
        self.acquire(owner, Request::Upgrade, None).await.map(|_| ())
    }

    /// Like [`Self::acquire_read`], giving up at `deadline`; returns whether acquired
    pub async fn acquire_read_until(&self, owner: LockOwner, deadline: Instant) -> Result<bool, LockError> {
        self.acquire(owner, Request::Read, Some(deadline)).await
    }

    /// Like [`Self::acquire_write`], giving up at `deadline`; returns whether acquired
    pub async fn acquire_write_until(&self, owner: LockOwner, deadline: Instant) -> Result<bool, LockError> {
        self.acquire(owner, Request::Write, Some(deadline)).await
    }

    /// Like [`Self::upgrade`], giving up at `deadline`; returns whether upgraded
    pub async fn upgrade_until(&self, owner: LockOwner, deadline: Instant) -> Result<bool, LockError> {
        self.acquire(owner, Request::Upgrade, Some(deadline)).await
    }

    async fn acquire(&self, owner: LockOwner, request: Request, deadline: Option<Instant>) -> Result<bool, LockError> {
        let admission = self.state().admit(owner, request);
        let (ticket, rx) = match admission {
            Ok(Admission::Granted) => return Ok(true),
            Ok(Admission::Queued { ticket, rx }) => (ticket, rx),
            Err(e) => {
                error!(%owner, ?request, error = %e, "GeneralizedLock::acquire: contract violation");
                return Err(e);
            }
        };
        debug!(%owner, ?request, ticket, "GeneralizedLock::acquire: queued");

        let mut pending = PendingAcquire {
            lock: self,
            owner,
            ticket,
            rx,
            armed: true,
        };
        let granted = match deadline {
            Some(deadline) => matches!(tokio::time::timeout_at(deadline, &mut pending.rx).await, Ok(Ok(()))),
            None => (&mut pending.rx).await.is_ok(),
        };
        if granted {
            pending.armed = false;
            return Ok(true);
        }

        let acquired = pending.withdraw();
        debug!(%owner, ?request, ticket, acquired, "GeneralizedLock::acquire: deadline passed");
        Ok(acquired)
    }

    /// Drop the owner's most recent acquisition, restoring its previous mode
    pub fn release(&self, owner: LockOwner) -> Result<LockMode, LockError> {
        let mut state = self.state();
        if state.pop(owner).is_none() {
            error!(%owner, "GeneralizedLock::release: lock not held");
            return Err(LockError::NotHeld { owner });
        }
        let remaining = state.mode_of(owner);
        let woken = state.grant_waiters();
        if woken > 0 {
            debug!(%owner, woken, "GeneralizedLock::release: granted waiters");
        }
        Ok(remaining)
    }

    /// Current overall mode
    pub fn mode(&self) -> LockMode {
        self.state().mode()
    }

    /// Mode held by one owner
    pub fn mode_of(&self, owner: LockOwner) -> LockMode {
        self.state().mode_of(owner)
    }

    pub fn holds_write(&self, owner: LockOwner) -> bool {
        self.mode_of(owner) == LockMode::Write
    }

    /// Number of queued waiters, including a pending upgrade
    pub fn queued(&self) -> usize {
        self.state().waiters.len()
    }
}
