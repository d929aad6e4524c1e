//! Scheduler implementation
//!
//! A scheduler owns one job kind. Jobs move through four slots:
//!
//! - waiting: admitted, WAITING, ordered by [`QueueKey`]
//! - ready: taken by a worker that has not yet moved it to RUNNING
//! - running: the body is executing
//! - retry-wait: parked in the shared [`RetryTimer`]
//!
//! Every state change happens with the job's write lock held, and the
//! scheduler's inner mutex is only ever taken after a job lock, never before.
//! Workers drop the job lock while the body runs and take it again to commit.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Instant as StdInstant;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::context::DiagnosticContext;
use crate::domain::{Job, JobId, JobKind, JobSnapshot, JobState, PolicyContext, PriorityPolicy};
use crate::metrics::LoadObserver;
use crate::sync::{BlockingCounter, CounterError, Gate, LockOwner};

use super::body::{JobBody, JobFailure, RunContext};
use super::config::{SchedulerConfig, at_bound};
use super::error::{CapacityReason, SchedulerError};
use super::queue::{QueueEntry, QueueEntryStatus, QueueKey, QueueState, SchedulerStats};
use super::retry::{RetryTarget, RetryTimer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Waiting(QueueKey),
    Ready,
    Running,
    RetryWait,
    Finished,
}

struct Tracked {
    job: Arc<Job>,
    cx: DiagnosticContext,
    slot: Slot,
    since: StdInstant,
}

#[derive(Debug, Default, Clone, Copy)]
struct OwnerLoad {
    ready: usize,
    running: usize,
}

/// Internal state protected by mutex
struct SchedulerInner {
    jobs: HashMap<JobId, Tracked>,
    waiting: BTreeSet<QueueKey>,
    ready: usize,
    running: usize,
    retry_wait: usize,
    owners: HashMap<String, OwnerLoad>,
    accepting: bool,
    next_seq: u64,
    stats: SchedulerStats,
}

impl SchedulerInner {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            waiting: BTreeSet::new(),
            ready: 0,
            running: 0,
            retry_wait: 0,
            owners: HashMap::new(),
            accepting: true,
            next_seq: 0,
            stats: SchedulerStats::default(),
        }
    }

    fn owner_load(&self, owner: &str) -> OwnerLoad {
        self.owners.get(owner).copied().unwrap_or_default()
    }

    fn policy_context(&self, owner: &str, load: f64) -> PolicyContext {
        let owned = self.owner_load(owner);
        PolicyContext {
            running_for_owner: owned.running,
            in_flight_for_owner: owned.running + owned.ready,
            running_total: self.running,
            load,
        }
    }

    fn next_key(&mut self, priority: i64, id: JobId) -> QueueKey {
        let seq = self.next_seq;
        self.next_seq += 1;
        QueueKey { priority, seq, id }
    }

    /// Admission bound the owner's next job would break, if any
    fn refusal(&self, owner: &str, config: &SchedulerConfig) -> Option<CapacityReason> {
        let waiting = self.waiting.len();
        if at_bound(self.backlog(), config.max_queue_size) {
            return Some(CapacityReason::QueueFull);
        }
        if at_bound(waiting, config.max_waiting_jobs) {
            return Some(CapacityReason::WaitingJobsExceeded);
        }
        if at_bound(self.owner_load(owner).running, config.max_running_by_owner) {
            return Some(CapacityReason::OwnerRunningLimit);
        }
        None
    }

    /// Admitted jobs not yet running, including those waiting to retry
    fn backlog(&self) -> usize {
        self.waiting.len() + self.ready + self.retry_wait
    }

    /// Move a tracked job between slots, keeping every count in step
    fn move_to(&mut self, id: JobId, slot: Slot) {
        let Some(tracked) = self.jobs.get_mut(&id) else {
            return;
        };
        let previous = std::mem::replace(&mut tracked.slot, slot);
        tracked.since = StdInstant::now();
        let owner = tracked.job.owner().to_string();

        let load = self.owners.entry(owner.clone()).or_default();
        match previous {
            Slot::Waiting(key) => {
                self.waiting.remove(&key);
            }
            Slot::Ready => {
                self.ready = self.ready.saturating_sub(1);
                load.ready = load.ready.saturating_sub(1);
            }
            Slot::Running => {
                self.running = self.running.saturating_sub(1);
                load.running = load.running.saturating_sub(1);
            }
            Slot::RetryWait => self.retry_wait = self.retry_wait.saturating_sub(1),
            Slot::Finished => {}
        }
        match slot {
            Slot::Waiting(key) => {
                self.waiting.insert(key);
                self.stats.peak_waiting = self.stats.peak_waiting.max(self.waiting.len());
            }
            Slot::Ready => {
                self.ready += 1;
                load.ready += 1;
            }
            Slot::Running => {
                self.running += 1;
                load.running += 1;
                self.stats.peak_running = self.stats.peak_running.max(self.running);
            }
            Slot::RetryWait => self.retry_wait += 1,
            Slot::Finished => {}
        }
        if load.ready == 0 && load.running == 0 {
            self.owners.remove(&owner);
        }
    }

    /// Take the best waiting job whose owner still has room
    fn take_next(&mut self, config: &SchedulerConfig) -> Option<(Arc<Job>, DiagnosticContext)> {
        if !self.accepting
            || at_bound(self.ready, config.max_ready_jobs)
            || at_bound(self.ready + self.running, config.max_ready_queue_size)
        {
            return None;
        }
        let key = *self.waiting.iter().find(|key| {
            self.jobs.get(&key.id).is_some_and(|tracked| {
                let load = self.owner_load(tracked.job.owner());
                !at_bound(load.running + load.ready, config.max_running_by_owner)
            })
        })?;
        self.move_to(key.id, Slot::Ready);
        let tracked = self.jobs.get(&key.id)?;
        Some((tracked.job.clone(), tracked.cx.clone()))
    }

    fn finish(&mut self, id: JobId) {
        self.move_to(id, Slot::Finished);
    }
}

/// Admission control, worker pool and retry driver for one job kind
pub struct Scheduler {
    name: String,
    kind: JobKind,
    config: SchedulerConfig,
    policy: Arc<dyn PriorityPolicy>,
    body: Arc<dyn JobBody>,
    retry: RetryTimer,
    this: Weak<Scheduler>,
    inner: Mutex<SchedulerInner>,
    work: Notify,
    dispatch: Gate,
    load: LoadObserver,
    progress: BlockingCounter,
    stopping: CancellationToken,
    halted: CancellationToken,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("policy", &self.policy.name())
            .finish()
    }
}

impl Scheduler {
    /// Start a scheduler using the policy named in `config`
    pub fn spawn(
        name: impl Into<String>,
        kind: JobKind,
        config: SchedulerConfig,
        body: Arc<dyn JobBody>,
        retry: RetryTimer,
    ) -> Result<Arc<Self>, SchedulerError> {
        let policy = config.priority_policy.build();
        Self::spawn_with_policy(name, kind, config, policy, body, retry)
    }

    /// Start a scheduler with an explicit priority policy
    pub fn spawn_with_policy(
        name: impl Into<String>,
        kind: JobKind,
        config: SchedulerConfig,
        policy: Arc<dyn PriorityPolicy>,
        body: Arc<dyn JobBody>,
        retry: RetryTimer,
    ) -> Result<Arc<Self>, SchedulerError> {
        let name = name.into();
        debug!(%name, %kind, ?config, "Scheduler::spawn: called");
        config.validate().map_err(|reason| SchedulerError::InvalidConfig {
            scheduler: name.clone(),
            reason,
        })?;

        let pool = config.thread_pool_size;
        let load = LoadObserver::new(config.load_window());
        let scheduler = Arc::new_cyclic(|this| Self {
            name,
            kind,
            config,
            policy,
            body,
            retry,
            this: this.clone(),
            inner: Mutex::new(SchedulerInner::new()),
            work: Notify::new(),
            dispatch: Gate::new(true),
            load,
            progress: BlockingCounter::new(),
            stopping: CancellationToken::new(),
            halted: CancellationToken::new(),
            workers: StdMutex::new(Vec::new()),
        });

        let workers: Vec<_> = (0..pool)
            .map(|worker| tokio::spawn(scheduler.clone().work(worker)))
            .collect();
        *scheduler.workers.lock().unwrap_or_else(PoisonError::into_inner) = workers;

        info!(
            scheduler = %scheduler.name,
            %kind,
            pool,
            policy = scheduler.policy.name(),
            "Scheduler started"
        );
        Ok(scheduler)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run `f` with the job's write lock and the inner state held, in that order
    async fn locked<T>(
        &self,
        job: &Job,
        owner: LockOwner,
        f: impl FnOnce(&mut SchedulerInner) -> Result<T, SchedulerError>,
    ) -> Result<T, SchedulerError> {
        job.lock().acquire_write(owner).await?;
        let result = {
            let mut inner = self.inner.lock().await;
            f(&mut inner)
        };
        let released = job.lock().release(owner);
        let value = result?;
        released?;
        Ok(value)
    }

    /// Admit a job with a fresh diagnostic context
    pub async fn submit(&self, job: Arc<Job>) -> Result<JobId, SchedulerError> {
        self.submit_with_context(job, DiagnosticContext::new()).await
    }

    /// Admit a job, or refuse it without touching scheduler state
    pub async fn submit_with_context(&self, job: Arc<Job>, cx: DiagnosticContext) -> Result<JobId, SchedulerError> {
        let id = job.id();
        debug!(scheduler = %self.name, %id, owner = job.owner(), "Scheduler::submit: called");
        if job.kind() != self.kind {
            return Err(SchedulerError::WrongKind {
                scheduler: self.name.clone(),
                expected: self.kind,
                actual: job.kind(),
            });
        }

        let owner = LockOwner::next();
        self.locked(&job, owner, |inner| {
            if !inner.accepting {
                return Err(SchedulerError::ShuttingDown(self.name.clone()));
            }
            if inner.jobs.contains_key(&id) {
                return Err(SchedulerError::DuplicateJob(id));
            }
            if let Some(reason) = inner.refusal(job.owner(), &self.config) {
                warn!(scheduler = %self.name, %id, owner = job.owner(), %reason, "Scheduler::submit: refused");
                return Err(SchedulerError::CapacityExceeded {
                    scheduler: self.name.clone(),
                    job: id,
                    reason,
                });
            }

            job.transition(owner, JobState::Waiting)?;
            let policy_cx = inner.policy_context(job.owner(), self.load.current_load());
            let priority = self.policy.evaluate(&job, &policy_cx);
            job.set_priority(owner, priority)?;

            let key = inner.next_key(priority, id);
            inner.jobs.insert(
                id,
                Tracked {
                    job: job.clone(),
                    cx,
                    slot: Slot::Finished,
                    since: StdInstant::now(),
                },
            );
            inner.move_to(id, Slot::Waiting(key));
            inner.stats.total_submitted += 1;
            debug!(scheduler = %self.name, %id, priority, "Scheduler::submit: admitted");
            Ok(())
        })
        .await?;

        self.work.notify_waiters();
        Ok(id)
    }

    /// Submit, retrying refused admissions until `deadline`
    ///
    /// Each retry waits for some job to leave RUNNING or finish, which is when
    /// capacity can free up. The last refusal is returned once the deadline passes.
    pub async fn submit_wait(
        &self,
        job: Arc<Job>,
        cx: DiagnosticContext,
        deadline: Instant,
    ) -> Result<JobId, SchedulerError> {
        debug!(scheduler = %self.name, id = %job.id(), "Scheduler::submit_wait: called");
        loop {
            let seen = self.progress.get();
            match self.submit_with_context(job.clone(), cx.clone()).await {
                Err(refused @ SchedulerError::CapacityExceeded { .. }) => {
                    match self.progress.await_change_until(seen, deadline, &self.stopping).await {
                        Ok(true) => continue,
                        Ok(false) => return Err(refused),
                        Err(CounterError::Interrupted { .. }) => {
                            return Err(SchedulerError::ShuttingDown(self.name.clone()));
                        }
                    }
                }
                other => return other,
            }
        }
    }

    /// Cancel a job; a RUNNING job only gets its cooperative flag raised
    pub async fn cancel(&self, id: JobId) -> Result<(), SchedulerError> {
        debug!(scheduler = %self.name, %id, "Scheduler::cancel: called");
        let job = self.job(id).await.ok_or(SchedulerError::UnknownJob(id))?;

        let owner = LockOwner::next();
        let canceled = self
            .locked(&job, owner, |inner| {
                let state = job.state();
                if state.is_terminal() {
                    debug!(%id, %state, "Scheduler::cancel: already terminal");
                    return Ok(false);
                }
                job.request_cancel();
                if state == JobState::Running {
                    debug!(%id, "Scheduler::cancel: running, cancel flag raised");
                    return Ok(false);
                }
                job.transition(owner, JobState::Canceled)?;
                inner.finish(id);
                inner.stats.total_canceled += 1;
                Ok(true)
            })
            .await?;

        if canceled {
            info!(scheduler = %self.name, %id, "Job canceled");
            self.progress.increment();
            self.work.notify_waiters();
        }
        Ok(())
    }

    pub async fn job(&self, id: JobId) -> Option<Arc<Job>> {
        self.inner.lock().await.jobs.get(&id).map(|tracked| tracked.job.clone())
    }

    pub async fn job_state(&self, id: JobId) -> Result<JobState, SchedulerError> {
        self.job(id)
            .await
            .map(|job| job.state())
            .ok_or(SchedulerError::UnknownJob(id))
    }

    pub async fn snapshot(&self, id: JobId) -> Result<JobSnapshot, SchedulerError> {
        self.job(id)
            .await
            .map(|job| job.snapshot())
            .ok_or(SchedulerError::UnknownJob(id))
    }

    /// Wait until the job reaches a terminal state or `deadline` passes
    pub async fn await_terminal(&self, id: JobId, deadline: Instant) -> Result<JobState, SchedulerError> {
        debug!(scheduler = %self.name, %id, "Scheduler::await_terminal: called");
        loop {
            let seen = self.progress.get();
            let state = self.job_state(id).await?;
            if state.is_terminal() {
                return Ok(state);
            }
            match self.progress.await_change_until(seen, deadline, &self.halted).await {
                Ok(true) => continue,
                Ok(false) => return Err(SchedulerError::Timeout(id)),
                Err(CounterError::Interrupted { .. }) => {
                    let state = self.job_state(id).await?;
                    return if state.is_terminal() {
                        Ok(state)
                    } else {
                        Err(SchedulerError::ShuttingDown(self.name.clone()))
                    };
                }
            }
        }
    }

    /// Drop a terminal job from the scheduler
    pub async fn forget(&self, id: JobId) -> Result<Arc<Job>, SchedulerError> {
        debug!(scheduler = %self.name, %id, "Scheduler::forget: called");
        let mut inner = self.inner.lock().await;
        let state = inner
            .jobs
            .get(&id)
            .map(|tracked| tracked.job.state())
            .ok_or(SchedulerError::UnknownJob(id))?;
        if !state.is_terminal() {
            return Err(SchedulerError::NotTerminal { job: id, state });
        }
        inner
            .jobs
            .remove(&id)
            .map(|tracked| tracked.job)
            .ok_or(SchedulerError::UnknownJob(id))
    }

    /// Stop dispatching new jobs; running jobs are unaffected
    pub fn pause(&self) {
        info!(scheduler = %self.name, "Scheduler paused");
        self.dispatch.close();
    }

    pub fn resume(&self) {
        info!(scheduler = %self.name, "Scheduler resumed");
        self.dispatch.open();
    }

    pub fn is_paused(&self) -> bool {
        !self.dispatch.is_open()
    }

    pub async fn queue_state(&self) -> QueueState {
        debug!(scheduler = %self.name, "Scheduler::queue_state: called");
        let inner = self.inner.lock().await;
        QueueState {
            waiting: inner.waiting.len(),
            ready: inner.ready,
            running: inner.running,
            retry_wait: inner.retry_wait,
            paused: self.is_paused(),
            load: self.load.current_load(),
            stats: inner.stats.clone(),
        }
    }

    /// Non-terminal jobs: running, ready, waiting in dispatch order, then retry-wait
    pub async fn queue_details(&self) -> Vec<QueueEntry> {
        debug!(scheduler = %self.name, "Scheduler::queue_details: called");
        let inner = self.inner.lock().await;
        let now = StdInstant::now();
        let entry = |tracked: &Tracked, status| QueueEntry {
            job: tracked.job.id(),
            owner: tracked.job.owner().to_string(),
            priority: tracked.job.priority(),
            status,
            wait_time: now.duration_since(tracked.since),
        };

        let mut entries: Vec<QueueEntry> = inner
            .jobs
            .values()
            .filter_map(|tracked| match tracked.slot {
                Slot::Running => Some(entry(tracked, QueueEntryStatus::Running)),
                Slot::Ready => Some(entry(tracked, QueueEntryStatus::Ready)),
                _ => None,
            })
            .collect();
        entries.sort_by_key(|e| (e.status, e.job));

        entries.extend(
            inner
                .waiting
                .iter()
                .filter_map(|key| inner.jobs.get(&key.id))
                .map(|tracked| entry(tracked, QueueEntryStatus::Waiting)),
        );

        let mut retrying: Vec<QueueEntry> = inner
            .jobs
            .values()
            .filter(|tracked| tracked.slot == Slot::RetryWait)
            .map(|tracked| entry(tracked, QueueEntryStatus::RetryWait))
            .collect();
        retrying.sort_by_key(|e| e.job);
        entries.extend(retrying);
        entries
    }

    pub async fn stats(&self) -> SchedulerStats {
        debug!(scheduler = %self.name, "Scheduler::stats: called");
        self.inner.lock().await.stats.clone()
    }

    /// Stop admissions, fail queued work, and wait for running jobs to finish
    pub async fn shutdown(&self) {
        info!(scheduler = %self.name, "Scheduler shutting down");
        let stranded: Vec<Arc<Job>> = {
            let mut inner = self.inner.lock().await;
            inner.accepting = false;
            inner
                .jobs
                .values()
                .filter(|tracked| matches!(tracked.slot, Slot::Waiting(_) | Slot::Ready | Slot::RetryWait))
                .map(|tracked| tracked.job.clone())
                .collect()
        };
        self.stopping.cancel();

        for job in stranded {
            if let Err(e) = self.fail_stranded(&job).await {
                error!(scheduler = %self.name, id = %job.id(), error = %e, "Scheduler::shutdown: failed to fail job");
            }
        }

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if let Err(e) = worker.await {
                error!(scheduler = %self.name, error = %e, "Scheduler::shutdown: worker task failed");
            }
        }
        self.halted.cancel();
        info!(scheduler = %self.name, "Scheduler stopped");
    }

    async fn fail_stranded(&self, job: &Job) -> Result<(), SchedulerError> {
        let id = job.id();
        let owner = LockOwner::next();
        let failed = self
            .locked(job, owner, |inner| {
                if !matches!(job.state(), JobState::Waiting | JobState::RetryWait) {
                    return Ok(false);
                }
                job.fail(owner, SchedulerError::ShuttingDown(self.name.clone()).to_string())?;
                inner.finish(id);
                inner.stats.total_failed += 1;
                Ok(true)
            })
            .await?;
        if failed {
            warn!(scheduler = %self.name, %id, "Job failed by shutdown");
            self.progress.increment();
        }
        Ok(())
    }

    async fn work(self: Arc<Self>, worker: usize) {
        let owner = LockOwner::next();
        debug!(scheduler = %self.name, worker, %owner, "Scheduler::work: started");

        loop {
            let pass = tokio::select! {
                biased;
                _ = self.stopping.cancelled() => break,
                pass = self.dispatch.enter() => pass,
            };

            let idle = self.work.notified();
            let next = self.inner.lock().await.take_next(&self.config);
            match next {
                Some((job, cx)) => {
                    let span = cx.span(&self.name, job.id());
                    self.execute(job, cx, owner).instrument(span).await;
                    drop(pass);
                }
                None => {
                    drop(pass);
                    tokio::select! {
                        biased;
                        _ = self.stopping.cancelled() => break,
                        _ = idle => {}
                    }
                }
            }
        }

        debug!(scheduler = %self.name, worker, "Scheduler::work: stopped");
    }

    async fn execute(&self, job: Arc<Job>, cx: DiagnosticContext, owner: LockOwner) {
        let id = job.id();
        debug!(%id, attempt = job.retry_count() + 1, "Scheduler::execute: called");

        match self.start(&job, owner).await {
            Ok(true) => {}
            Ok(false) => {
                self.work.notify_waiters();
                return;
            }
            Err(e) => {
                error!(%id, error = %e, "Scheduler::execute: could not start job");
                return;
            }
        }

        let outcome = self.run_body(&job, cx.clone(), owner).await;
        if let Err(e) = self.commit(&job, cx, owner, outcome).await {
            error!(%id, error = %e, "Scheduler::execute: could not commit outcome");
        }
        self.progress.increment();
        self.work.notify_waiters();
    }

    /// WAITING -> RUNNING; false when the job left WAITING before the worker got to it
    async fn start(&self, job: &Job, owner: LockOwner) -> Result<bool, SchedulerError> {
        let id = job.id();
        let expired = self
            .locked(job, owner, |inner| {
                let state = job.state();
                if state != JobState::Waiting {
                    debug!(%id, %state, "Scheduler::start: job left the queue");
                    return Ok(None);
                }
                if job.is_expired() {
                    job.fail(owner, "lifetime exceeded before dispatch")?;
                    inner.finish(id);
                    inner.stats.total_failed += 1;
                    inner.stats.total_timed_out += 1;
                    return Ok(Some(true));
                }
                job.transition(owner, JobState::Running)?;
                inner.move_to(id, Slot::Running);
                Ok(Some(false))
            })
            .await?;

        match expired {
            None => Ok(false),
            Some(true) => {
                warn!(%id, "Job lifetime exceeded before dispatch");
                self.progress.increment();
                Ok(false)
            }
            Some(false) => Ok(true),
        }
    }

    /// Run the body in its own task so a panic fails the job instead of the worker
    async fn run_body(&self, job: &Arc<Job>, cx: DiagnosticContext, owner: LockOwner) -> Result<(), JobFailure> {
        let id = job.id();
        let remaining = job.remaining_lifetime().unwrap_or_default();
        let rc = RunContext::new(job.clone(), cx, owner);
        let body = self.body.clone();

        self.load.worker_started();
        let mut run = tokio::spawn(async move { body.run(&rc).await }.in_current_span());
        let outcome = match tokio::time::timeout(remaining, &mut run).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(%id, panic = %message, "Job body panicked");
                Err(JobFailure::Terminal(format!("operation panicked: {message}")))
            }
            Ok(Err(e)) => Err(JobFailure::Terminal(e.to_string())),
            Err(_) => {
                run.abort();
                warn!(%id, ?remaining, "Job lifetime exceeded while running");
                Err(JobFailure::TimedOut)
            }
        };
        if let Err(e) = self.load.worker_finished() {
            error!(%id, error = %e, "Scheduler::run_body: load observer out of balance");
        }
        outcome
    }

    /// RUNNING -> DONE | FAILED | CANCELED | RETRY_WAIT
    async fn commit(
        &self,
        job: &Job,
        cx: DiagnosticContext,
        owner: LockOwner,
        outcome: Result<(), JobFailure>,
    ) -> Result<(), SchedulerError> {
        let id = job.id();
        let outcome = match outcome {
            Err(JobFailure::Transient(_)) if job.is_cancel_requested() => Err(JobFailure::Canceled),
            other => other,
        };

        self.locked(job, owner, |inner| {
            match outcome {
                Ok(()) => {
                    job.transition(owner, JobState::Done)?;
                    inner.stats.total_completed += 1;
                    debug!(%id, "Scheduler::commit: done");
                }
                Err(JobFailure::Canceled) => {
                    job.transition(owner, JobState::Canceled)?;
                    inner.stats.total_canceled += 1;
                    info!(%id, "Job canceled while running");
                }
                Err(JobFailure::TimedOut) => {
                    job.fail(owner, "lifetime exceeded")?;
                    inner.stats.total_failed += 1;
                    inner.stats.total_timed_out += 1;
                }
                Err(JobFailure::Terminal(message)) => {
                    warn!(%id, error = %message, "Job failed");
                    job.fail(owner, message)?;
                    inner.stats.total_failed += 1;
                }
                Err(JobFailure::Transient(message)) => {
                    if !inner.accepting {
                        job.fail(owner, format!("{message} ({})", SchedulerError::ShuttingDown(self.name.clone())))?;
                        inner.stats.total_failed += 1;
                    } else if job.retry_count() >= self.config.max_retries {
                        warn!(%id, retries = job.retry_count(), error = %message, "Job failed, retries exhausted");
                        job.fail(owner, message)?;
                        inner.stats.total_failed += 1;
                    } else {
                        let retries = job.retry(owner, message)?;
                        let delay = self.policy.retry_delay(job, self.config.retry_timeout());
                        let target: Weak<dyn RetryTarget> = self.this.clone();
                        match self.retry.schedule(id, delay, cx, target) {
                            Ok(()) => {
                                debug!(%id, retries, ?delay, "Scheduler::commit: retry scheduled");
                                inner.move_to(id, Slot::RetryWait);
                                inner.stats.total_retried += 1;
                                return Ok(());
                            }
                            Err(e) => {
                                error!(%id, error = %e, "Scheduler::commit: cannot schedule retry");
                                job.fail(owner, e.to_string())?;
                                inner.stats.total_failed += 1;
                            }
                        }
                    }
                }
            }
            inner.finish(id);
            Ok(())
        })
        .await
    }

    /// RETRY_WAIT -> WAITING; expired jobs fail instead
    async fn readmit_job(&self, id: JobId, cx: DiagnosticContext) -> Result<(), SchedulerError> {
        let Some(job) = self.job(id).await else {
            debug!(%id, "Scheduler::readmit: job forgotten");
            return Ok(());
        };

        let owner = LockOwner::next();
        let readmitted = self
            .locked(&job, owner, |inner| {
                if job.state() != JobState::RetryWait {
                    debug!(%id, state = %job.state(), "Scheduler::readmit: no longer waiting to retry");
                    return Ok(None);
                }
                if job.is_expired() {
                    job.fail(owner, "lifetime exceeded during retry wait")?;
                    inner.finish(id);
                    inner.stats.total_failed += 1;
                    inner.stats.total_timed_out += 1;
                    return Ok(Some(false));
                }
                job.transition(owner, JobState::Waiting)?;
                let policy_cx = inner.policy_context(job.owner(), self.load.current_load());
                let priority = self.policy.evaluate(&job, &policy_cx);
                job.set_priority(owner, priority)?;
                let key = inner.next_key(priority, id);
                if let Some(tracked) = inner.jobs.get_mut(&id) {
                    tracked.cx = cx;
                }
                inner.move_to(id, Slot::Waiting(key));
                Ok(Some(true))
            })
            .await?;

        match readmitted {
            Some(true) => {
                debug!(%id, attempt = job.retry_count() + 1, "Scheduler::readmit: back in the queue");
                self.work.notify_waiters();
            }
            Some(false) => {
                warn!(%id, "Job lifetime exceeded during retry wait");
                self.progress.increment();
            }
            None => {}
        }
        Ok(())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .unwrap_or_else(|| "unknown panic".to_string()),
    }
}

#[async_trait]
impl RetryTarget for Scheduler {
    async fn readmit(&self, job: JobId, cx: DiagnosticContext) {
        if let Err(e) = self.readmit_job(job, cx).await {
            error!(scheduler = %self.name, %job, error = %e, "Scheduler::readmit: failed");
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
