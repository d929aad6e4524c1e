//! SchedulerRegistry - one scheduler per job kind, built at startup
//!
//! The registry is an ordinary value owned by whoever starts the engine and
//! passed by reference to request-handling code. It owns the shared retry
//! timer and the id allocator used for jobs and compound requests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::context::DiagnosticContext;
use crate::domain::{CompoundRequest, IdAllocator, Job, JobId, JobKind};

use super::body::JobBody;
use super::core::Scheduler;
use super::error::SchedulerError;
use super::retry::RetryTimer;

pub struct SchedulerRegistry {
    schedulers: BTreeMap<JobKind, Arc<Scheduler>>,
    ids: IdAllocator,
    retry: RetryTimer,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SchedulerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerRegistry")
            .field("kinds", &self.schedulers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SchedulerRegistry {
    /// Start a scheduler for every kind in `config`
    ///
    /// Every configured kind needs a body, and every section must validate,
    /// before any scheduler is started.
    pub fn spawn(config: &Config, bodies: HashMap<JobKind, Arc<dyn JobBody>>) -> Result<Self, SchedulerError> {
        Self::spawn_with_ids(config, bodies, IdAllocator::default())
    }

    /// Like [`Self::spawn`], resuming id allocation from a persisted allocator
    pub fn spawn_with_ids(
        config: &Config,
        mut bodies: HashMap<JobKind, Arc<dyn JobBody>>,
        ids: IdAllocator,
    ) -> Result<Self, SchedulerError> {
        debug!(kinds = config.schedulers.len(), "SchedulerRegistry::spawn: called");
        let mut plan = Vec::with_capacity(config.schedulers.len());
        for (kind, scheduler_config) in &config.schedulers {
            let name = kind.as_str().to_lowercase();
            scheduler_config
                .validate()
                .map_err(|reason| SchedulerError::InvalidConfig {
                    scheduler: name.clone(),
                    reason,
                })?;
            let body = bodies.remove(kind).ok_or(SchedulerError::NoBody(*kind))?;
            plan.push((name, *kind, scheduler_config.clone(), body));
        }

        let (retry, retry_task) = RetryTimer::spawn();
        let mut schedulers = BTreeMap::new();
        for (name, kind, scheduler_config, body) in plan {
            let scheduler = Scheduler::spawn(name, kind, scheduler_config, body, retry.clone())?;
            schedulers.insert(kind, scheduler);
        }

        info!(kinds = schedulers.len(), "SchedulerRegistry started");
        Ok(Self {
            schedulers,
            ids,
            retry,
            retry_task: Mutex::new(Some(retry_task)),
        })
    }

    pub fn get(&self, kind: JobKind) -> Result<&Arc<Scheduler>, SchedulerError> {
        self.schedulers.get(&kind).ok_or(SchedulerError::UnknownKind(kind))
    }

    pub fn kinds(&self) -> impl Iterator<Item = JobKind> + '_ {
        self.schedulers.keys().copied()
    }

    pub fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    pub fn retry_timer(&self) -> &RetryTimer {
        &self.retry
    }

    /// New job with a fresh id; `lifetime` defaults to the kind's configured lifetime
    pub fn create_job(
        &self,
        owner: impl Into<String>,
        kind: JobKind,
        lifetime: Option<Duration>,
    ) -> Result<Arc<Job>, SchedulerError> {
        let scheduler = self.get(kind)?;
        let lifetime = lifetime.unwrap_or_else(|| scheduler.config().default_lifetime());
        Ok(Arc::new(Job::new(self.ids.next_job_id(), owner, kind, lifetime)))
    }

    pub fn create_request(&self) -> CompoundRequest {
        CompoundRequest::new(self.ids.next_request_id())
    }

    /// New job registered as a member of `request`
    pub fn create_request_job(
        &self,
        request: &mut CompoundRequest,
        owner: impl Into<String>,
        kind: JobKind,
        lifetime: Option<Duration>,
    ) -> Result<Arc<Job>, SchedulerError> {
        let scheduler = self.get(kind)?;
        let lifetime = lifetime.unwrap_or_else(|| scheduler.config().default_lifetime());
        let job = Job::new(self.ids.next_job_id(), owner, kind, lifetime).with_request(request.id());
        request.add_member(job.id());
        Ok(Arc::new(job))
    }

    /// Submit to the scheduler for the job's kind
    pub async fn submit(&self, job: Arc<Job>, cx: DiagnosticContext) -> Result<JobId, SchedulerError> {
        let scheduler = self.get(job.kind())?;
        let cx = match job.request() {
            Some(request) if cx.request().is_none() => cx.with_request(request),
            _ => cx,
        };
        scheduler.submit_with_context(job, cx).await
    }

    pub async fn cancel(&self, kind: JobKind, id: JobId) -> Result<(), SchedulerError> {
        self.get(kind)?.cancel(id).await
    }

    /// Shut every scheduler down, then the retry timer
    pub async fn shutdown_all(&self) {
        info!("SchedulerRegistry shutting down");
        for scheduler in self.schedulers.values() {
            scheduler.shutdown().await;
        }
        self.retry.shutdown();

        let task = self.retry_task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(error = %e, "SchedulerRegistry::shutdown_all: retry timer task failed");
        }
        info!("SchedulerRegistry stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{JobFailure, RunContext, SchedulerConfig};
    use async_trait::async_trait;

    struct Succeed;

    #[async_trait]
    impl JobBody for Succeed {
        async fn run(&self, _cx: &RunContext) -> Result<(), JobFailure> {
            Ok(())
        }
    }

    fn config(kinds: &[JobKind]) -> Config {
        Config {
            log_level: "info".to_string(),
            schedulers: kinds.iter().map(|kind| (*kind, SchedulerConfig::default())).collect(),
        }
    }

    fn bodies(kinds: &[JobKind]) -> HashMap<JobKind, Arc<dyn JobBody>> {
        kinds
            .iter()
            .map(|kind| (*kind, Arc::new(Succeed) as Arc<dyn JobBody>))
            .collect()
    }

    #[tokio::test]
    async fn test_missing_body_is_refused() {
        let result = SchedulerRegistry::spawn(&config(&[JobKind::Get, JobKind::Put]), bodies(&[JobKind::Get]));
        assert!(matches!(result, Err(SchedulerError::NoBody(JobKind::Put))));
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let registry = SchedulerRegistry::spawn(&config(&[JobKind::Get]), bodies(&[JobKind::Get])).unwrap();
        assert!(matches!(
            registry.create_job("alice", JobKind::Copy, None),
            Err(SchedulerError::UnknownKind(JobKind::Copy))
        ));
        assert_eq!(registry.kinds().collect::<Vec<_>>(), vec![JobKind::Get]);
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_request_jobs_share_request_id() {
        let registry = SchedulerRegistry::spawn_with_ids(
            &config(&[JobKind::Get]),
            bodies(&[JobKind::Get]),
            IdAllocator::starting_at(i64::MAX - 1),
        )
        .unwrap();

        let mut request = registry.create_request();
        let jobs: Vec<_> = (0..3)
            .map(|_| {
                registry
                    .create_request_job(&mut request, "alice", JobKind::Get, None)
                    .unwrap()
            })
            .collect();

        assert_eq!(request.id().as_i64(), i64::MAX - 1);
        for (index, job) in jobs.iter().enumerate() {
            assert_eq!(job.request(), Some(request.id()));
            assert_eq!(request.ordinal(job.id()).unwrap(), index + 1);
            assert_eq!(job.lifetime(), SchedulerConfig::default().default_lifetime());
        }
        registry.shutdown_all().await;
    }
}
