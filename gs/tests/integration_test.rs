//! Integration tests for Gridsched
//!
//! These tests drive the registry end to end: config in, jobs through every
//! scheduler, shutdown out.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use gridsched::config::Config;
use gridsched::domain::{IdAllocator, JobKind, JobState};
use gridsched::scheduler::{JobBody, JobFailure, RunContext, SchedulerConfig, SchedulerError, SchedulerRegistry};
use gridsched::transport::{DeliveryError, Endpoint, deliver_with_timeout};
use gridsched::{DiagnosticContext, ErrorKind};
use tokio::time::Instant;

// =============================================================================
// Fixtures
// =============================================================================

/// Tape system that is offline for the first `offline` requests
struct TapeSystem {
    offline: u32,
    calls: AtomicU32,
}

#[async_trait]
impl Endpoint for TapeSystem {
    type Request = String;
    type Reply = ();

    async fn deliver(&self, _path: String) -> Result<(), DeliveryError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.offline {
            return Err(DeliveryError::NoRoute("tape".to_string()));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "tape"
    }
}

/// Stages a file through the tape endpoint
struct Stage {
    tape: TapeSystem,
    seen_requests: Mutex<Vec<Option<i64>>>,
}

#[async_trait]
impl JobBody for Stage {
    async fn run(&self, cx: &RunContext) -> Result<(), JobFailure> {
        cx.checkpoint()?;
        self.seen_requests
            .lock()
            .unwrap()
            .push(cx.diagnostic().request().map(|r| r.as_i64()));
        let path = format!("/pnfs/data/{}", cx.job().id());
        deliver_with_timeout(&self.tape, path, Duration::from_secs(1)).await?;
        Ok(())
    }
}

/// Directory listing that never fails
struct List;

#[async_trait]
impl JobBody for List {
    async fn run(&self, _cx: &RunContext) -> Result<(), JobFailure> {
        Ok(())
    }
}

/// Read that waits until canceled
struct Hang;

#[async_trait]
impl JobBody for Hang {
    async fn run(&self, cx: &RunContext) -> Result<(), JobFailure> {
        cx.until_cancelled().await;
        Err(JobFailure::Canceled)
    }
}

fn config() -> Config {
    let fast = SchedulerConfig {
        thread_pool_size: 2,
        retry_timeout_ms: 10,
        max_retries: 3,
        ..Default::default()
    };
    let mut schedulers = std::collections::BTreeMap::new();
    schedulers.insert(JobKind::Ls, fast.clone());
    schedulers.insert(JobKind::BringOnline, fast.clone());
    schedulers.insert(
        JobKind::Get,
        SchedulerConfig {
            thread_pool_size: 1,
            max_running_by_owner: 1,
            ..fast
        },
    );
    Config {
        log_level: "debug".to_string(),
        schedulers,
    }
}

fn stage(offline: u32) -> Arc<Stage> {
    Arc::new(Stage {
        tape: TapeSystem {
            offline,
            calls: AtomicU32::new(0),
        },
        seen_requests: Mutex::new(Vec::new()),
    })
}

fn bodies(stage: Arc<Stage>) -> HashMap<JobKind, Arc<dyn JobBody>> {
    let mut bodies: HashMap<JobKind, Arc<dyn JobBody>> = HashMap::new();
    bodies.insert(JobKind::Ls, Arc::new(List));
    bodies.insert(JobKind::BringOnline, stage);
    bodies.insert(JobKind::Get, Arc::new(Hang));
    bodies
}

fn soon() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

// =============================================================================
// Registry Tests
// =============================================================================

#[tokio::test]
async fn test_registry_runs_jobs_of_each_kind() {
    let stage = stage(0);
    let registry = SchedulerRegistry::spawn(&config(), bodies(stage.clone())).expect("registry should start");

    let listing = registry.create_job("alice", JobKind::Ls, None).unwrap();
    let staging = registry.create_job("alice", JobKind::BringOnline, None).unwrap();
    let ls_id = registry.submit(listing, DiagnosticContext::new()).await.unwrap();
    let stage_id = registry.submit(staging, DiagnosticContext::new()).await.unwrap();

    let ls = registry.get(JobKind::Ls).unwrap();
    let bring_online = registry.get(JobKind::BringOnline).unwrap();
    assert_eq!(ls.await_terminal(ls_id, soon()).await.unwrap(), JobState::Done);
    assert_eq!(
        bring_online.await_terminal(stage_id, soon()).await.unwrap(),
        JobState::Done
    );
    assert_eq!(ls.stats().await.total_completed, 1);
    assert_eq!(bring_online.stats().await.total_completed, 1);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_transient_delivery_failures_are_retried() {
    let stage = stage(2);
    let registry = SchedulerRegistry::spawn(&config(), bodies(stage.clone())).unwrap();

    let job = registry.create_job("bob", JobKind::BringOnline, None).unwrap();
    let id = registry.submit(job.clone(), DiagnosticContext::new()).await.unwrap();

    let scheduler = registry.get(JobKind::BringOnline).unwrap();
    assert_eq!(scheduler.await_terminal(id, soon()).await.unwrap(), JobState::Done);
    assert_eq!(job.retry_count(), 2);
    assert_eq!(stage.tape.calls.load(Ordering::SeqCst), 3);
    assert_eq!(scheduler.stats().await.total_retried, 2);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_exhausted_retries_fail_with_last_error() {
    let stage = stage(u32::MAX);
    let registry = SchedulerRegistry::spawn(&config(), bodies(stage.clone())).unwrap();

    let job = registry.create_job("bob", JobKind::BringOnline, None).unwrap();
    let id = registry.submit(job.clone(), DiagnosticContext::new()).await.unwrap();

    let scheduler = registry.get(JobKind::BringOnline).unwrap();
    assert_eq!(scheduler.await_terminal(id, soon()).await.unwrap(), JobState::Failed);
    assert_eq!(job.retry_count(), 3);
    assert_eq!(job.last_error().as_deref(), Some("No route to tape"));

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_compound_request_members_carry_request_context() {
    let stage = stage(0);
    let registry = SchedulerRegistry::spawn_with_ids(
        &config(),
        bodies(stage.clone()),
        IdAllocator::starting_at(i64::MAX - 2),
    )
    .unwrap();

    let mut request = registry.create_request();
    let mut ids = Vec::new();
    for _ in 0..4 {
        let job = registry
            .create_request_job(&mut request, "carol", JobKind::BringOnline, None)
            .unwrap();
        ids.push(registry.submit(job, DiagnosticContext::new()).await.unwrap());
    }

    // Member ids wrap past i64::MAX, ordinals still follow allocation order
    assert!(ids.iter().any(|id| id.as_i64() < 0));
    for (index, id) in ids.iter().enumerate() {
        assert_eq!(request.ordinal(*id).unwrap(), index + 1);
    }

    let scheduler = registry.get(JobKind::BringOnline).unwrap();
    for id in &ids {
        assert_eq!(scheduler.await_terminal(*id, soon()).await.unwrap(), JobState::Done);
    }
    let seen = stage.seen_requests.lock().unwrap().clone();
    assert_eq!(seen.len(), 4);
    assert!(seen.iter().all(|r| *r == Some(request.id().as_i64())));

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_owner_limit_then_cancel_frees_capacity() {
    let registry = SchedulerRegistry::spawn(&config(), bodies(stage(0))).unwrap();
    let get = registry.get(JobKind::Get).unwrap();

    let first = registry.create_job("dave", JobKind::Get, None).unwrap();
    let first_id = registry.submit(first, DiagnosticContext::new()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while get.job_state(first_id).await.unwrap() != JobState::Running {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();

    let second = registry.create_job("dave", JobKind::Get, None).unwrap();
    let err = registry.submit(second.clone(), DiagnosticContext::new()).await.unwrap_err();
    assert!(matches!(err, SchedulerError::CapacityExceeded { .. }));
    assert_eq!(err.kind(), ErrorKind::Capacity);
    assert_eq!(second.state(), JobState::Queued);

    // Canceling the running read lets the waiting submit through
    let waiter = {
        let get = get.clone();
        let second = second.clone();
        tokio::spawn(async move { get.submit_wait(second, DiagnosticContext::new(), soon()).await })
    };
    registry.cancel(JobKind::Get, first_id).await.unwrap();
    assert_eq!(get.await_terminal(first_id, soon()).await.unwrap(), JobState::Canceled);
    assert_eq!(waiter.await.unwrap().unwrap(), second.id());

    registry.cancel(JobKind::Get, second.id()).await.unwrap();
    registry.shutdown_all().await;
    assert!(second.state().is_terminal());
}

#[tokio::test]
async fn test_shutdown_refuses_new_work() {
    let registry = SchedulerRegistry::spawn(&config(), bodies(stage(0))).unwrap();
    registry.shutdown_all().await;

    let job = registry.create_job("erin", JobKind::Ls, None).unwrap();
    let err = registry.submit(job, DiagnosticContext::new()).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ShuttingDown(_)));
}

// =============================================================================
// Config Tests
// =============================================================================

#[tokio::test]
async fn test_registry_from_yaml_config() {
    let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
    writeln!(
        file,
        "log-level: info\nschedulers:\n  LS:\n    thread-pool-size: 1\n    priority-policy: fair-share"
    )
    .unwrap();

    let config = Config::load(Some(file.path())).expect("config should load");
    assert_eq!(config.schedulers.len(), 1);

    let mut bodies: HashMap<JobKind, Arc<dyn JobBody>> = HashMap::new();
    bodies.insert(JobKind::Ls, Arc::new(List));
    let registry = SchedulerRegistry::spawn(&config, bodies).unwrap();

    let job = registry.create_job("frank", JobKind::Ls, Some(Duration::from_secs(30))).unwrap();
    assert_eq!(job.lifetime(), Duration::from_secs(30));
    let id = registry.submit(job, DiagnosticContext::new()).await.unwrap();

    let ls = registry.get(JobKind::Ls).unwrap();
    assert_eq!(ls.await_terminal(id, soon()).await.unwrap(), JobState::Done);
    assert!(matches!(
        registry.get(JobKind::Put),
        Err(SchedulerError::UnknownKind(JobKind::Put))
    ));

    registry.shutdown_all().await;
}
