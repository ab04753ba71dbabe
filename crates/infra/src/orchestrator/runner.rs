//! Orchestrated root jobs.
//!
//! The [`Orchestrator`] is the job handler of a pipeline's root job type. On
//! every claim it reloads the stages map from `JobRun.result`, reconciles
//! stages left `running` by a crash or by a delegated child, then runs
//! runnable stages in declaration order. Each stage transition is one store
//! transaction: compare-and-set on the root being `running`, the new stages
//! map, progress and heartbeat, plus any compensations the stage recorded.
//! Every transaction is fenced by the lease of the claim; a root that was
//! canceled or reclaimed by another worker stops the run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use courseforge_core::{CoreConfig, CoreError, UserId};
use courseforge_events::{EventKind, Notifier};

use super::pipeline::{Pipeline, StageContext, StageOutcome, StageSpec};
use super::state::{FailureMarker, OrchestratorState, StageStatus};
use crate::jobs::service::notify_job;
use crate::jobs::{JobPatch, JobQueue, JobRun, JobStatus, Lease, NewJob, ProgressSink, Stamp, enqueue_in};
use crate::saga::{Compensation, SagaEngine, SagaStatus, append_compensation_in, create_or_get_in};
use crate::store::{JobTx, SagaTx, Store, StoreTx};
use crate::worker::{HandlerError, HandlerOutcome, HandlerRegistry, JobContext, JobHandler};

/// One persisted change of the stages map.
#[derive(Debug)]
enum Step {
    Start { stage: String },
    Complete { stage: String, artifacts: JsonValue },
    /// Stage waits for a decision; the root keeps running other stages.
    Await { stage: String, prompt: JsonValue },
    /// Stage goes back to pending; the root is requeued after `delay`.
    Retry { stage: String, error: String, delay: Duration },
    Delegate { stage: String, child: NewJob },
    /// Requeue the root to check on delegated children later.
    Poll,
    /// Park the root on the waiting stage.
    Park { stage: String },
    Fail { stage: String, error: String, compensate: bool },
    Finish,
}

struct Committed {
    job: JobRun,
    /// Child job created by a `Delegate` step.
    child: Option<JobRun>,
}

/// Stage failure surfaced while reconciling a delegated child.
struct ChildFailure {
    stage: String,
    error: String,
}

fn at_offset(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1))
}

fn requeue_at(at: DateTime<Utc>) -> JobPatch {
    JobPatch::new()
        .status(JobStatus::Queued)
        .locked_at(Stamp::Clear)
        .scheduled_at(Stamp::At(at))
}

/// Store errors during a stage transition are worth retrying when they are
/// contention, fatal otherwise.
fn to_handler_error(err: CoreError) -> HandlerError {
    if err.is_conflict() {
        return HandlerError::transient(err.to_string());
    }
    HandlerError::from(err)
}

/// Job handler driving one [`Pipeline`].
pub struct Orchestrator<S: Store> {
    pipeline: Arc<Pipeline>,
    store: Arc<S>,
    notifier: Arc<dyn Notifier>,
    saga: SagaEngine<S>,
    progress: Arc<dyn ProgressSink>,
    config: CoreConfig,
}

impl<S: Store> Orchestrator<S> {
    pub fn new(
        pipeline: Pipeline,
        store: Arc<S>,
        notifier: Arc<dyn Notifier>,
        saga: SagaEngine<S>,
        config: CoreConfig,
    ) -> Result<Self, CoreError> {
        pipeline.validate()?;
        let progress: Arc<dyn ProgressSink> =
            Arc::new(JobQueue::new(store.clone(), notifier.clone(), &config));
        Ok(Self {
            pipeline: Arc::new(pipeline),
            store,
            notifier,
            saga,
            progress,
            config,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Register as the handler of the pipeline's root job type.
    pub fn register(self, registry: &mut HandlerRegistry) -> Result<(), CoreError> {
        let job_type = self.pipeline.job_type().to_string();
        registry.register(job_type, Arc::new(self))
    }

    fn stage_spec(&self, name: &str) -> Result<StageSpec, HandlerError> {
        self.pipeline
            .get(name)
            .map(|s| s.spec.clone())
            .ok_or_else(|| HandlerError::fatal(format!("stage {name} is not declared")))
    }

    /// Lock the root, decode and complete its state, make sure the saga
    /// exists and reconcile stages left `running`. `None` when `lease` no
    /// longer holds the root.
    async fn load(&self, lease: &Lease) -> Result<Option<(JobRun, OrchestratorState, Vec<ChildFailure>)>, CoreError> {
        let owner = lease.owner;
        let mut tx = self.store.begin().await?;
        let Some(mut row) = tx.lock_job(owner, lease.job_id).await? else {
            return Ok(None);
        };
        if !lease.holds(&row) {
            return Ok(None);
        }
        let now = tx.now();

        let mut state = OrchestratorState::from_result(&row.result)?.unwrap_or_default();
        for spec in self.pipeline.specs() {
            state.stage_mut(spec.name());
        }
        if state.saga_id.is_none() {
            let saga = create_or_get_in(&mut tx, owner, row.id).await?;
            state.saga_id = Some(saga.id);
        }

        let mut failures = Vec::new();
        let running: Vec<String> = self
            .pipeline
            .specs()
            .filter(|spec| {
                state
                    .stage(spec.name())
                    .is_some_and(|s| s.status == StageStatus::Running)
            })
            .map(|spec| spec.name().to_string())
            .collect();

        for name in running {
            let stage = state.stage_mut(&name);
            let Some(child_id) = stage.child_job_id else {
                debug!(job_id = %row.id, stage = %name, "resetting interrupted stage");
                stage.status = StageStatus::Pending;
                continue;
            };
            match tx.get_job(owner, child_id).await? {
                None => {
                    warn!(job_id = %row.id, stage = %name, child_job_id = %child_id, "delegated child job is gone");
                    let stage = state.stage_mut(&name);
                    stage.status = StageStatus::Pending;
                    stage.child_job_id = None;
                    stage.wait_until = None;
                }
                Some(child) if child.status == JobStatus::Succeeded => {
                    info!(job_id = %row.id, stage = %name, child_job_id = %child.id, "delegated stage succeeded");
                    let stage = state.stage_mut(&name);
                    stage.status = StageStatus::Succeeded;
                    stage.artifacts = Some(child.result.clone());
                    stage.finished_at = Some(now);
                    stage.wait_until = None;
                    stage.last_error = None;
                }
                Some(child)
                    if child.status == JobStatus::Canceled
                        || (child.status == JobStatus::Failed && !child.retryable) =>
                {
                    let error = if child.error.is_empty() {
                        format!("child job {} {}", child.id, child.status)
                    } else {
                        format!("child job {} {}: {}", child.id, child.status, child.error)
                    };
                    failures.push(ChildFailure { stage: name, error });
                }
                Some(_) => {}
            }
        }

        let prev = row.status;
        JobPatch::new()
            .progress(self.pipeline.progress(&state))
            .heartbeat()
            .result(state.to_value())
            .apply(&mut row, now);
        if !tx.update_job(&row, Some(prev)).await? {
            return Ok(None);
        }
        tx.commit().await?;
        Ok(Some((row, state, failures)))
    }

    /// Apply `step` to the stages map and persist it with the root row in
    /// one transaction. `None` when `lease` no longer holds the root.
    async fn persist(
        &self,
        lease: &Lease,
        state: &mut OrchestratorState,
        step: Step,
        compensations: &[Compensation],
    ) -> Result<Option<Committed>, CoreError> {
        let owner = lease.owner;
        let mut tx = self.store.begin().await?;
        let Some(mut row) = tx.lock_job(owner, lease.job_id).await? else {
            return Ok(None);
        };
        if !lease.holds(&row) {
            debug!(
                job_id = %lease.job_id,
                status = %row.status,
                attempt = lease.attempt,
                current_attempt = row.attempts,
                "root lease lost; step dropped"
            );
            return Ok(None);
        }
        let now = tx.now();

        if !compensations.is_empty() {
            let saga_id = state
                .saga_id
                .ok_or_else(|| CoreError::fatal("orchestrated job has no saga"))?;
            for compensation in compensations {
                append_compensation_in(&mut tx, owner, saga_id, compensation).await?;
            }
        }

        let mut child = None;
        let mut saga_target = None;
        let patch = match step {
            Step::Start { stage } => {
                let st = state.stage_mut(&stage);
                st.status = StageStatus::Running;
                st.attempts += 1;
                st.started_at = Some(now);
                st.finished_at = None;
                st.child_job_id = None;
                st.wait_until = None;
                JobPatch::new().stage(stage).heartbeat()
            }
            Step::Complete { stage, artifacts } => {
                let st = state.stage_mut(&stage);
                st.status = StageStatus::Succeeded;
                st.artifacts = Some(artifacts);
                st.finished_at = Some(now);
                st.last_error = None;
                st.wait_until = None;
                JobPatch::new()
                    .stage(stage)
                    .progress(self.pipeline.progress(state))
                    .heartbeat()
            }
            Step::Await { stage, prompt } => {
                let st = state.stage_mut(&stage);
                st.status = StageStatus::WaitingUser;
                st.prompt = Some(prompt);
                st.decision = None;
                JobPatch::new().stage(stage).heartbeat()
            }
            Step::Retry { stage, error, delay } => {
                let st = state.stage_mut(&stage);
                st.status = StageStatus::Pending;
                st.last_error = Some(error.clone());
                st.child_job_id = None;
                st.wait_until = None;
                requeue_at(at_offset(now, delay))
                    .stage(stage)
                    .error(error)
                    .last_error_at(Stamp::Now)
            }
            Step::Delegate { stage, child: new } => {
                let (job, created) = adopt_or_enqueue(&mut tx, &new).await?;
                let wait_until = at_offset(now, self.config.orchestrator_poll_interval);
                let st = state.stage_mut(&stage);
                st.status = StageStatus::Running;
                st.child_job_id = Some(job.id);
                st.wait_until = Some(wait_until);
                if created {
                    child = Some(job);
                }
                requeue_at(wait_until).stage(stage)
            }
            Step::Poll => {
                let at = at_offset(now, self.config.orchestrator_poll_interval);
                for st in state.stages.values_mut() {
                    if st.status == StageStatus::Running && st.child_job_id.is_some() {
                        st.wait_until = Some(at);
                    }
                }
                requeue_at(at)
            }
            Step::Park { stage } => JobPatch::new()
                .status(JobStatus::WaitingUser)
                .stage(stage)
                .locked_at(Stamp::Clear),
            Step::Fail {
                stage,
                error,
                compensate,
            } => {
                let st = state.stage_mut(&stage);
                st.status = StageStatus::Failed;
                st.last_error = Some(error.clone());
                st.finished_at = Some(now);
                state.failure = Some(FailureMarker {
                    stage: stage.clone(),
                    error: error.clone(),
                    compensate,
                    at: now,
                });
                // A compensating failure moves the saga on through `compensate`.
                if !compensate {
                    saga_target = Some(SagaStatus::Failed);
                }
                JobPatch::new()
                    .status(JobStatus::Failed)
                    .stage(stage)
                    .error(error)
                    .retryable(false)
                    .locked_at(Stamp::Clear)
                    .last_error_at(Stamp::Now)
            }
            Step::Finish => {
                saga_target = Some(SagaStatus::Succeeded);
                JobPatch::new()
                    .status(JobStatus::Succeeded)
                    .stage(JobStatus::Succeeded.as_str())
                    .progress(100)
                    .error("")
                    .retryable(false)
                    .locked_at(Stamp::Clear)
            }
        };

        if let (Some(target), Some(saga_id)) = (saga_target, state.saga_id) {
            if let Some(saga) = tx.lock_saga(owner, saga_id).await? {
                if saga.status != target && saga.status.can_transition_to(target) {
                    tx.update_saga_status(owner, saga_id, target).await?;
                }
            }
        }

        patch.result(state.to_value()).apply(&mut row, now);
        if !tx.update_job(&row, Some(JobStatus::Running)).await? {
            return Ok(None);
        }
        tx.commit().await?;
        Ok(Some(Committed { job: row, child }))
    }

    async fn persist_or_cancel(
        &self,
        root: &JobRun,
        state: &mut OrchestratorState,
        step: Step,
        compensations: &[Compensation],
    ) -> Result<Committed, HandlerError> {
        // `root` is the row last written under the claim, so it still carries its lease.
        let lease = root.lease().ok_or(HandlerError::Canceled)?;
        self.persist(&lease, state, step, compensations)
            .await
            .map_err(to_handler_error)?
            .ok_or(HandlerError::Canceled)
    }

    /// Keep the compensations of a stage interrupted by cancellation.
    async fn record_compensations(&self, owner: UserId, state: &OrchestratorState, compensations: &[Compensation]) {
        let Some(saga_id) = state.saga_id else {
            return;
        };
        if compensations.is_empty() {
            return;
        }
        let result = async {
            let mut tx = self.store.begin().await?;
            for compensation in compensations {
                append_compensation_in(&mut tx, owner, saga_id, compensation).await?;
            }
            tx.commit().await?;
            Ok::<(), CoreError>(())
        }
        .await;
        if let Err(err) = result {
            warn!(saga_id = %saga_id, error = %err, "failed to record compensations of a canceled stage");
        }
    }

    #[instrument(skip(self, ctx, root, state, spec), fields(job_id = %root.id, stage = %spec.name()))]
    async fn run_stage(
        &self,
        ctx: &JobContext,
        root: &mut JobRun,
        state: &mut OrchestratorState,
        spec: &StageSpec,
    ) -> Result<Option<HandlerOutcome>, HandlerError> {
        let name = spec.name().to_string();
        let handler = self
            .pipeline
            .get(&name)
            .map(|s| s.handler.clone())
            .ok_or_else(|| HandlerError::fatal(format!("stage {name} is not declared")))?;

        *root = self
            .persist_or_cancel(root, state, Step::Start { stage: name.clone() }, &[])
            .await?
            .job;

        let mut stage_ctx = StageContext::new(
            root.clone(),
            *ctx.lease(),
            &name,
            state.clone(),
            ctx.cancel_token().clone(),
            self.progress.clone(),
            self.pipeline.progress_range(state, &name),
        );
        info!(attempt = stage_ctx.attempt(), "stage started");
        let result = stage_ctx_run(handler.as_ref(), &mut stage_ctx).await;
        let compensations = stage_ctx.take_compensations();

        match result {
            Ok(StageOutcome::Completed(artifacts)) => {
                let step = Step::Complete {
                    stage: name,
                    artifacts,
                };
                *root = self.persist_or_cancel(root, state, step, &compensations).await?.job;
                info!(progress = root.progress, "stage succeeded");
                notify_job(self.notifier.as_ref(), EventKind::JobProgress, root);
                Ok(None)
            }
            Ok(StageOutcome::Wait { prompt }) => {
                let step = Step::Await { stage: name, prompt };
                *root = self.persist_or_cancel(root, state, step, &compensations).await?.job;
                info!("stage waiting for a decision");
                Ok(None)
            }
            Ok(StageOutcome::Delegate(child)) => {
                if child.owner_user_id != root.owner_user_id {
                    let err = HandlerError::fatal("delegated job must belong to the root's owner");
                    return self.stage_failed(root, state, spec, err, compensations).await.map(Some);
                }
                let step = Step::Delegate { stage: name, child };
                let committed = self.persist_or_cancel(root, state, step, &compensations).await?;
                *root = committed.job;
                if let Some(child) = &committed.child {
                    info!(child_job_id = %child.id, child_job_type = %child.job_type, "stage delegated to child job");
                    notify_job(self.notifier.as_ref(), EventKind::JobCreated, child);
                }
                notify_job(self.notifier.as_ref(), EventKind::JobProgress, root);
                Ok(Some(HandlerOutcome::Settled))
            }
            Err(err) => self.stage_failed(root, state, spec, err, compensations).await.map(Some),
        }
    }

    /// Retry the stage within its budget, otherwise fail the root and, for
    /// compensating stages, compensate the saga.
    async fn stage_failed(
        &self,
        root: &mut JobRun,
        state: &mut OrchestratorState,
        spec: &StageSpec,
        err: HandlerError,
        compensations: Vec<Compensation>,
    ) -> Result<HandlerOutcome, HandlerError> {
        let name = spec.name().to_string();
        let attempts = state.stage(&name).map(|s| s.attempts).unwrap_or(0);
        let budget = spec.max_attempts().unwrap_or(self.config.max_attempts);

        let (error, retry) = match err {
            HandlerError::Canceled => {
                self.record_compensations(root.owner_user_id, state, &compensations).await;
                return Err(HandlerError::Canceled);
            }
            HandlerError::Transient(msg) => (msg, attempts < budget),
            HandlerError::Fatal(msg) => (msg, false),
        };

        if retry {
            let delay = self.config.retry_policy().delay_for_attempt(attempts);
            let step = Step::Retry {
                stage: name.clone(),
                error: error.clone(),
                delay,
            };
            *root = self.persist_or_cancel(root, state, step, &compensations).await?.job;
            warn!(job_id = %root.id, stage = %name, attempts, error = %error, "stage failed; retrying");
            notify_job(self.notifier.as_ref(), EventKind::JobProgress, root);
            return Ok(HandlerOutcome::Settled);
        }

        let compensate = spec.is_compensating() && self.config.compensation_on_fatal;
        self.fail_root(root, state, name, error, compensate, &compensations).await
    }

    async fn fail_root(
        &self,
        root: &mut JobRun,
        state: &mut OrchestratorState,
        stage: String,
        error: String,
        compensate: bool,
        compensations: &[Compensation],
    ) -> Result<HandlerOutcome, HandlerError> {
        let step = Step::Fail {
            stage: stage.clone(),
            error: error.clone(),
            compensate,
        };
        *root = self.persist_or_cancel(root, state, step, compensations).await?.job;
        warn!(job_id = %root.id, stage = %stage, error = %error, compensate, "orchestrated job failed");
        notify_job(self.notifier.as_ref(), EventKind::JobFailed, root);

        if compensate {
            if let Some(saga_id) = state.saga_id {
                match self.saga.compensate(root.owner_user_id, saga_id).await {
                    Ok(report) => info!(
                        job_id = %root.id,
                        saga_id = %saga_id,
                        done = report.done.len(),
                        failed = report.failed.len(),
                        "saga compensated after stage failure"
                    ),
                    Err(err) => warn!(job_id = %root.id, saga_id = %saga_id, error = %err, "saga compensation failed"),
                }
            }
        }
        Ok(HandlerOutcome::Settled)
    }

    /// Nothing is runnable: finish, wait for children, or park.
    async fn conclude(&self, root: &mut JobRun, state: &mut OrchestratorState) -> Result<HandlerOutcome, HandlerError> {
        if self.pipeline.all_succeeded(state) {
            *root = self.persist_or_cancel(root, state, Step::Finish, &[]).await?.job;
            info!(job_id = %root.id, "orchestrated job succeeded");
            notify_job(self.notifier.as_ref(), EventKind::JobDone, root);
            return Ok(HandlerOutcome::Settled);
        }

        let delegated = self.pipeline.specs().any(|spec| {
            state
                .stage(spec.name())
                .is_some_and(|s| s.status == StageStatus::Running && s.child_job_id.is_some())
        });
        if delegated {
            *root = self.persist_or_cancel(root, state, Step::Poll, &[]).await?.job;
            debug!(job_id = %root.id, "waiting on delegated child jobs");
            return Ok(HandlerOutcome::Settled);
        }

        if let Some(stage) = state.waiting_stage().map(str::to_string) {
            *root = self
                .persist_or_cancel(root, state, Step::Park { stage: stage.clone() }, &[])
                .await?
                .job;
            info!(job_id = %root.id, stage = %stage, "orchestrated job waiting for a decision");
            notify_job(self.notifier.as_ref(), EventKind::JobWaiting, root);
            return Ok(HandlerOutcome::Settled);
        }

        let stalled = self
            .pipeline
            .specs()
            .find(|spec| !state.stage(spec.name()).is_some_and(|s| s.is_succeeded()))
            .map(|spec| spec.name().to_string())
            .unwrap_or_default();
        self.fail_root(root, state, stalled, "no runnable stage".to_string(), false, &[])
            .await
    }
}

async fn stage_ctx_run(
    handler: &dyn super::pipeline::StageHandler,
    ctx: &mut StageContext,
) -> Result<StageOutcome, HandlerError> {
    ctx.check_canceled()?;
    handler.run(ctx).await
}

/// Reuse the runnable job occupying the child's slot, if any.
async fn adopt_or_enqueue<T>(tx: &mut T, new: &NewJob) -> Result<(JobRun, bool), CoreError>
where
    T: JobTx + ?Sized,
{
    if new.entity_id.is_some() {
        if let Some(existing) = tx
            .find_runnable_for_entity(new.owner_user_id, &new.entity_type, new.entity_id, &new.job_type)
            .await?
        {
            return Ok((existing, false));
        }
    }
    enqueue_in(tx, new).await
}

#[async_trait]
impl<S: Store> JobHandler for Orchestrator<S> {
    async fn handle(&self, ctx: JobContext) -> Result<HandlerOutcome, HandlerError> {
        let Some((mut root, mut state, failures)) = self.load(ctx.lease()).await.map_err(to_handler_error)? else {
            return Err(HandlerError::Canceled);
        };

        if let Some(failure) = failures.into_iter().next() {
            let spec = self.stage_spec(&failure.stage)?;
            let err = HandlerError::Transient(failure.error);
            return self.stage_failed(&mut root, &mut state, &spec, err, Vec::new()).await;
        }

        loop {
            ctx.check_canceled()?;
            let Some(spec) = self.pipeline.next_runnable(&state).cloned() else {
                break;
            };
            if let Some(outcome) = self.run_stage(&ctx, &mut root, &mut state, &spec).await? {
                return Ok(outcome);
            }
        }

        self.conclude(&mut root, &mut state).await
    }
}
