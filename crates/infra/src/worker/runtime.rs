//! Worker runtime: claim, dispatch, heartbeat, settle.
//!
//! Each worker task loops: claim a job (bounded by `claim_timeout`), resolve
//! its handler, renew the lease every `lease_heartbeat_period` while the
//! handler runs, then record the outcome. A failed lease renewal means the row
//! left `running` (canceled, or reclaimed) and cancels the handler's context.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courseforge_core::{CoreConfig, CoreError, JobId};

use super::handler::{HandlerError, HandlerOutcome, JobContext};
use super::registry::HandlerRegistry;
use crate::jobs::{JobQueue, JobRun, Lease, ProgressSink};
use crate::store::Store;

/// What one `run_once` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing was claimable.
    Idle,
    Succeeded(JobId),
    Failed { job_id: JobId, retryable: bool },
    /// The row left `running` while the handler ran.
    Canceled(JobId),
    /// The handler persisted the next state itself.
    Settled(JobId),
}

/// Runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_canceled: u64,
    pub jobs_settled: u64,
    pub claim_errors: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Idle => return,
            RunOutcome::Succeeded(_) => self.jobs_succeeded += 1,
            RunOutcome::Failed { .. } => self.jobs_failed += 1,
            RunOutcome::Canceled(_) => self.jobs_canceled += 1,
            RunOutcome::Settled(_) => self.jobs_settled += 1,
        }
        self.jobs_processed += 1;
    }
}

/// Handle to a set of running worker tasks.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: CancellationToken,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop claiming and wait for in-flight jobs to finish.
    pub async fn shutdown(self) -> WorkerStats {
        self.shutdown.cancel();
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "worker task panicked");
            }
        }
        lock_stats(&self.stats).clone()
    }

    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }
}

fn lock_stats(stats: &Mutex<WorkerStats>) -> std::sync::MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Claims jobs and dispatches them to registered handlers.
pub struct Worker<S: Store> {
    name: String,
    queue: JobQueue<S>,
    registry: Arc<HandlerRegistry>,
    config: CoreConfig,
}

impl<S: Store> Clone for Worker<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            queue: self.queue.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: Store> Worker<S> {
    pub fn new(queue: JobQueue<S>, registry: HandlerRegistry, config: CoreConfig) -> Self {
        Self {
            name: "courseforge-worker".to_string(),
            queue,
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Claim and run at most one job.
    pub async fn run_once(&self) -> Result<RunOutcome, CoreError> {
        let claimed = tokio::time::timeout(self.config.claim_timeout, self.queue.claim())
            .await
            .map_err(|_| CoreError::transient("claim timed out"))??;
        match claimed {
            Some(job) => self.execute(job).await,
            None => Ok(RunOutcome::Idle),
        }
    }

    async fn execute(&self, job: JobRun) -> Result<RunOutcome, CoreError> {
        let job_id = job.id;
        let lease = job
            .lease()
            .ok_or_else(|| CoreError::state(format!("claimed job {job_id} carries no lease")))?;

        let Some(resolved) = self.registry.resolve(&job.job_type, self.config.retry_policy()) else {
            let err = CoreError::config(format!("no handler registered for job type {}", job.job_type));
            warn!(worker = %self.name, job_id = %job_id, error = %err, "no handler for job");
            self.queue.fail(&lease, &err.to_string(), false).await?;
            return Ok(RunOutcome::Failed {
                job_id,
                retryable: false,
            });
        };

        let cancel = CancellationToken::new();
        let stop_heartbeat = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.queue.clone(),
            lease,
            self.config.lease_heartbeat_period,
            cancel.clone(),
            stop_heartbeat.clone(),
        ));

        let progress: Arc<dyn ProgressSink> = Arc::new(self.queue.clone());
        let ctx = JobContext::new(job, lease, resolved.retry, cancel.clone(), progress);
        let result = resolved.handler.handle(ctx).await;

        stop_heartbeat.cancel();
        if let Err(err) = heartbeat.await {
            warn!(job_id = %job_id, error = %err, "heartbeat task ended abnormally");
        }

        let outcome = match result {
            Ok(HandlerOutcome::Succeeded(value)) => match self.queue.complete(&lease, value).await? {
                Some(_) => RunOutcome::Succeeded(job_id),
                None => RunOutcome::Canceled(job_id),
            },
            Ok(HandlerOutcome::Settled) => {
                debug!(job_id = %job_id, "handler settled the job");
                RunOutcome::Settled(job_id)
            }
            Err(HandlerError::Transient(msg)) => {
                let retryable = resolved.retry.should_retry(lease.attempt.max(0) as u32);
                self.settle_failure(&lease, &msg, retryable).await?
            }
            Err(HandlerError::Fatal(msg)) => self.settle_failure(&lease, &msg, false).await?,
            Err(HandlerError::Canceled) => {
                if cancel.is_cancelled() {
                    info!(job_id = %job_id, "handler stopped after cancellation");
                }
                // Harmless when the row already left `running`.
                self.settle_failure(&lease, "canceled", false).await?
            }
        };
        Ok(outcome)
    }

    async fn settle_failure(&self, lease: &Lease, msg: &str, retryable: bool) -> Result<RunOutcome, CoreError> {
        match self.queue.fail(lease, msg, retryable).await? {
            Some(_) => Ok(RunOutcome::Failed {
                job_id: lease.job_id,
                retryable,
            }),
            None => Ok(RunOutcome::Canceled(lease.job_id)),
        }
    }

    /// Start `worker_count` worker tasks on the current tokio runtime.
    pub fn spawn(&self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let started = Instant::now();

        let joins = (0..self.config.worker_count)
            .map(|i| {
                let worker = self.clone().with_name(format!("{}-{i}", self.name));
                let shutdown = shutdown.clone();
                let stats = stats.clone();
                tokio::spawn(async move { worker.run_loop(shutdown, stats, started).await })
            })
            .collect();

        WorkerHandle { shutdown, joins, stats }
    }

    async fn run_loop(self, shutdown: CancellationToken, stats: Arc<Mutex<WorkerStats>>, started: Instant) {
        info!(worker = %self.name, "worker started");

        while !shutdown.is_cancelled() {
            lock_stats(&stats).uptime_secs = started.elapsed().as_secs();

            lock_stats(&stats).current_running += 1;
            let result = self.run_once().await;
            {
                let mut s = lock_stats(&stats);
                s.current_running = s.current_running.saturating_sub(1);
                match &result {
                    Ok(outcome) => s.record(outcome),
                    Err(_) => s.claim_errors += 1,
                }
            }

            let idle = match result {
                Ok(RunOutcome::Idle) => true,
                Ok(outcome) => {
                    debug!(worker = %self.name, outcome = ?outcome, "job processed");
                    false
                }
                Err(err) => {
                    error!(worker = %self.name, error = %err, "failed to process job");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(worker = %self.name, "worker stopped");
    }
}

async fn heartbeat_loop<S: Store>(
    queue: JobQueue<S>,
    lease: Lease,
    period: std::time::Duration,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
        match queue.renew_lease(&lease).await {
            Ok(true) => debug!(job_id = %lease.job_id, "lease renewed"),
            Ok(false) => {
                info!(job_id = %lease.job_id, attempt = lease.attempt, "lease lost; cancelling handler");
                cancel.cancel();
                return;
            }
            Err(err) => warn!(job_id = %lease.job_id, error = %err, "lease renewal failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use courseforge_core::{RequestContext, UserId};
    use courseforge_events::{BusNotifier, InMemoryEventBus, Notification, Notifier};

    use super::*;
    use crate::jobs::{JobService, JobStatus, NewJob};
    use crate::store::InMemoryStore;
    use crate::worker::handler::handler_fn;

    fn setup(registry: HandlerRegistry, config: CoreConfig) -> (JobService<InMemoryStore>, Worker<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let bus: Arc<InMemoryEventBus<Notification>> = Arc::new(InMemoryEventBus::new());
        let notifier: Arc<dyn Notifier> = Arc::new(BusNotifier::new(bus));
        let service = JobService::new(store.clone(), notifier.clone(), config.clone());
        let queue = JobQueue::new(store, notifier, &config);
        (service, Worker::new(queue, registry, config))
    }

    #[tokio::test]
    async fn unknown_job_type_fails_without_retry() {
        let (service, worker) = setup(HandlerRegistry::new(), CoreConfig::default());
        let ctx = RequestContext::new(UserId::new());
        let job = service.enqueue(NewJob::new(ctx.owner(), "mystery")).await.unwrap();

        let outcome = worker.run_once().await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed { job_id: job.id, retryable: false });
        let job = service.get(&ctx, job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.contains("configuration error"));
    }

    #[tokio::test]
    async fn transient_errors_respect_per_type_budget() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_with_max_attempts(
                "flaky",
                Arc::new(handler_fn(|_ctx| async { Err(HandlerError::transient("503")) })),
                1,
            )
            .unwrap();
        let (service, worker) = setup(registry, CoreConfig::default());
        let ctx = RequestContext::new(UserId::new());
        let job = service.enqueue(NewJob::new(ctx.owner(), "flaky")).await.unwrap();

        let outcome = worker.run_once().await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed { job_id: job.id, retryable: false });
    }

    #[tokio::test]
    async fn success_stores_handler_result() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "echo",
                Arc::new(handler_fn(|ctx: JobContext| async move {
                    ctx.report_progress(50, Some("echoing")).await?;
                    Ok(HandlerOutcome::Succeeded(Some(ctx.payload().clone())))
                })),
            )
            .unwrap();
        let (service, worker) = setup(registry, CoreConfig::default());
        let ctx = RequestContext::new(UserId::new());
        let job = service
            .enqueue(NewJob::new(ctx.owner(), "echo").with_payload(serde_json::json!({ "x": 1 })))
            .await
            .unwrap();

        assert_eq!(worker.run_once().await.unwrap(), RunOutcome::Succeeded(job.id));
        let job = service.get(&ctx, job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.stage, "echoing");
        assert_eq!(job.result, serde_json::json!({ "x": 1 }));
        assert_eq!(worker.run_once().await.unwrap(), RunOutcome::Idle);
    }

    #[tokio::test]
    async fn cancel_mid_run_stops_the_handler_through_the_heartbeat() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "long",
                Arc::new(handler_fn(|ctx: JobContext| async move {
                    ctx.cancel_token().cancelled().await;
                    Err(HandlerError::Canceled)
                })),
            )
            .unwrap();
        let mut config = CoreConfig::default();
        config.lease_heartbeat_period = Duration::from_millis(20);
        let (service, worker) = setup(registry, config);
        let ctx = RequestContext::new(UserId::new());
        let job = service.enqueue(NewJob::new(ctx.owner(), "long")).await.unwrap();

        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run_once().await }
        });
        for _ in 0..200 {
            if service.get(&ctx, job.id).await.unwrap().status == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        service.cancel(&ctx, job.id).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("handler never observed the cancellation")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, RunOutcome::Canceled(job.id));
        let row = service.get(&ctx, job.id).await.unwrap();
        assert_eq!(row.status, JobStatus::Canceled);
        assert!(row.locked_at.is_none());
    }

    #[tokio::test]
    async fn spawned_workers_drain_the_queue() {
        let processed = Arc::new(AtomicU32::new(0));
        let counter = processed.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "count",
                Arc::new(handler_fn(move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(HandlerOutcome::Succeeded(None))
                    }
                })),
            )
            .unwrap();
        let config = CoreConfig::default()
            .with_worker_count(3)
            .with_poll_interval(Duration::from_millis(5));
        let (service, worker) = setup(registry, config);
        let owner = UserId::new();
        for _ in 0..10 {
            service.enqueue(NewJob::new(owner, "count")).await.unwrap();
        }

        let handle = worker.spawn();
        for _ in 0..200 {
            if processed.load(Ordering::SeqCst) == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = handle.shutdown().await;

        assert_eq!(processed.load(Ordering::SeqCst), 10);
        assert_eq!(stats.jobs_succeeded, 10);
        assert_eq!(stats.current_running, 0);
    }
}
