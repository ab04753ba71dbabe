//! Job control plane: enqueue, cancel, restart and queries.
//!
//! All state changes happen in one store transaction; notifications are sent
//! after commit from the committed row.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use courseforge_core::{CoreConfig, CoreError, EntityId, JobId, RequestContext, UserId};
use courseforge_events::{EventKind, Notifier, user_channel};

use super::types::{IdempotencyRecord, JobPatch, JobRun, JobStatus, NewJob, Stamp};
use crate::orchestrator::OrchestratorState;
use crate::saga::SagaStatus;
use crate::store::{JobTx, SagaTx, Store, StoreTx};

/// Default page size of [`JobService::list_active`].
pub const DEFAULT_ACTIVE_LIMIT: i64 = 100;

/// Create a job inside an open transaction.
///
/// Returns the row and whether it was created; an idempotency key that was
/// already used yields the original row with `false`.
pub async fn enqueue_in<T>(tx: &mut T, new: &NewJob) -> Result<(JobRun, bool), CoreError>
where
    T: JobTx + ?Sized,
{
    new.validate()?;

    if let Some(key) = &new.idempotency {
        let prior = tx
            .get_idempotency(new.owner_user_id, new.entity_id, &key.operation, &key.key)
            .await?;
        if let Some(target) = prior {
            let job = tx
                .get_job(new.owner_user_id, JobId::from_uuid(target))
                .await?
                .ok_or_else(|| CoreError::conflict("idempotency key refers to a missing job"))?;
            return Ok((job, false));
        }
    }

    let job = JobRun::from_new(new, tx.now());
    tx.insert_job(&job).await?;

    if let Some(key) = &new.idempotency {
        let record = IdempotencyRecord {
            owner_user_id: new.owner_user_id,
            entity_id: new.entity_id,
            operation: key.operation.clone(),
            key: key.key.clone(),
            target_id: *job.id.as_uuid(),
            created_at: job.created_at,
        };
        if tx.insert_idempotency(&record).await?.is_some() {
            // Lost a race against a concurrent enqueue with the same key.
            return Err(CoreError::conflict("idempotency key already used"));
        }
    }

    Ok((job, true))
}

/// Debounced create: `None` when a runnable job already occupies the slot.
pub async fn enqueue_if_needed_in<T>(tx: &mut T, new: &NewJob) -> Result<Option<JobRun>, CoreError>
where
    T: JobTx + ?Sized,
{
    new.validate()?;
    let existing = tx
        .find_runnable_for_entity(new.owner_user_id, &new.entity_type, new.entity_id, &new.job_type)
        .await?;
    if existing.is_some() {
        return Ok(None);
    }
    let (job, created) = enqueue_in(tx, new).await?;
    Ok(created.then_some(job))
}

pub(crate) fn notify_job(notifier: &dyn Notifier, kind: EventKind, job: &JobRun) {
    notifier.notify(&user_channel(job.owner_user_id), kind, job.to_payload());
}

/// Public job operations.
pub struct JobService<S: Store> {
    store: Arc<S>,
    notifier: Arc<dyn Notifier>,
    config: CoreConfig,
}

impl<S: Store> Clone for JobService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: Store> JobService<S> {
    pub fn new(store: Arc<S>, notifier: Arc<dyn Notifier>, config: CoreConfig) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Create a queued job and fire `job_created`.
    pub async fn enqueue(&self, new: NewJob) -> Result<JobRun, CoreError> {
        let mut tx = self.store.begin().await?;
        match enqueue_in(&mut tx, &new).await {
            Ok((job, created)) => {
                tx.commit().await?;
                if created {
                    info!(job_id = %job.id, job_type = %job.job_type, "job enqueued");
                    notify_job(self.notifier.as_ref(), EventKind::JobCreated, &job);
                } else {
                    debug!(job_id = %job.id, "idempotent enqueue replayed");
                }
                Ok(job)
            }
            Err(err) if err.is_conflict() && new.idempotency.is_some() => {
                drop(tx);
                // A concurrent call with the same key may have won; return its row.
                self.replay_idempotent(&new).await?.ok_or(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn replay_idempotent(&self, new: &NewJob) -> Result<Option<JobRun>, CoreError> {
        let Some(key) = &new.idempotency else {
            return Ok(None);
        };
        let mut tx = self.store.begin().await?;
        let target = tx
            .get_idempotency(new.owner_user_id, new.entity_id, &key.operation, &key.key)
            .await?;
        let job = match target {
            Some(id) => tx.get_job(new.owner_user_id, JobId::from_uuid(id)).await?,
            None => None,
        };
        tx.rollback().await?;
        Ok(job)
    }

    /// Create the job unless a runnable one already exists for the same
    /// `(owner, entity_type, entity_id, job_type)`.
    pub async fn enqueue_if_needed(&self, new: NewJob) -> Result<(Option<JobRun>, bool), CoreError> {
        let mut tx = self.store.begin().await?;
        match enqueue_if_needed_in(&mut tx, &new).await {
            Ok(Some(job)) => {
                tx.commit().await?;
                info!(job_id = %job.id, job_type = %job.job_type, "job enqueued");
                notify_job(self.notifier.as_ref(), EventKind::JobCreated, &job);
                Ok((Some(job), true))
            }
            Ok(None) => {
                debug!(job_type = %new.job_type, "runnable job already exists; enqueue skipped");
                Ok((None, false))
            }
            Err(err) if err.is_conflict() => {
                debug!(job_type = %new.job_type, "concurrent enqueue won; enqueue skipped");
                Ok((None, false))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get(&self, ctx: &RequestContext, id: JobId) -> Result<JobRun, CoreError> {
        let mut tx = self.store.begin().await?;
        let job = tx.get_job(ctx.owner(), id).await?;
        tx.rollback().await?;
        job.ok_or(CoreError::NotFound)
    }

    /// Rows owned by the caller, in `(created_at, id)` order. Unknown ids are skipped.
    pub async fn get_many(&self, ctx: &RequestContext, ids: &[JobId]) -> Result<Vec<JobRun>, CoreError> {
        let mut tx = self.store.begin().await?;
        let jobs = tx.get_jobs(ctx.owner(), ids).await?;
        tx.rollback().await?;
        Ok(jobs)
    }

    pub async fn get_latest_for_entity(
        &self,
        ctx: &RequestContext,
        entity_type: &str,
        entity_id: Option<EntityId>,
        job_type: &str,
    ) -> Result<Option<JobRun>, CoreError> {
        let mut tx = self.store.begin().await?;
        let job = tx
            .latest_for_entity(ctx.owner(), entity_type, entity_id, job_type)
            .await?;
        tx.rollback().await?;
        Ok(job)
    }

    pub async fn has_runnable_for_entity(
        &self,
        ctx: &RequestContext,
        entity_type: &str,
        entity_id: Option<EntityId>,
        job_type: &str,
    ) -> Result<bool, CoreError> {
        let mut tx = self.store.begin().await?;
        let job = tx
            .find_runnable_for_entity(ctx.owner(), entity_type, entity_id, job_type)
            .await?;
        tx.rollback().await?;
        Ok(job.is_some())
    }

    /// Non-terminal jobs of the caller, oldest first.
    pub async fn list_active(&self, ctx: &RequestContext) -> Result<Vec<JobRun>, CoreError> {
        let mut tx = self.store.begin().await?;
        let jobs = tx.list_active(ctx.owner(), DEFAULT_ACTIVE_LIMIT).await?;
        tx.rollback().await?;
        Ok(jobs)
    }

    /// Apply a partial update. With `expect_status` set this is a compare-and-set;
    /// a mismatch is a `StateViolation`. Terminal rows accept no status change.
    pub async fn update_fields(
        &self,
        ctx: &RequestContext,
        id: JobId,
        patch: JobPatch,
    ) -> Result<JobRun, CoreError> {
        let mut tx = self.store.begin().await?;
        let mut job = tx.lock_job(ctx.owner(), id).await?.ok_or(CoreError::NotFound)?;
        if !patch.matches(&job) {
            return Err(CoreError::state(format!(
                "job {} is {}, expected {:?}",
                job.id, job.status, patch.expect_status
            )));
        }
        if job.status.is_terminal() && patch.status.is_some_and(|s| s != job.status) {
            return Err(CoreError::state(format!("job {} is already {}", job.id, job.status)));
        }
        if patch.status == Some(JobStatus::Running) && job.status != JobStatus::Running {
            return Err(CoreError::state("jobs only become running through a claim"));
        }

        let prev = job.status;
        patch.apply(&mut job, tx.now());
        if !tx.update_job(&job, Some(prev)).await? {
            return Err(CoreError::state(format!("job {} changed concurrently", job.id)));
        }
        tx.commit().await?;
        notify_job(self.notifier.as_ref(), EventKind::JobProgress, &job);
        Ok(job)
    }

    /// Cancel a job and, for orchestrated roots, its delegated children.
    ///
    /// Terminal rows are returned unchanged, except that a failed row awaiting
    /// retry stops being retryable.
    pub async fn cancel(&self, ctx: &RequestContext, id: JobId) -> Result<JobRun, CoreError> {
        let owner = ctx.owner();
        let (job, changed) = self.cancel_one(owner, id).await?;
        if !changed {
            return Ok(job);
        }
        info!(job_id = %job.id, "job canceled");
        self.cascade_cancel(owner, &job).await;
        Ok(job)
    }

    async fn cancel_one(&self, owner: UserId, id: JobId) -> Result<(JobRun, bool), CoreError> {
        let mut tx = self.store.begin().await?;
        let mut job = tx.lock_job(owner, id).await?.ok_or(CoreError::NotFound)?;

        if job.status.is_terminal() {
            if job.status == JobStatus::Failed && job.retryable {
                let prev = job.status;
                JobPatch::new().retryable(false).apply(&mut job, tx.now());
                tx.update_job(&job, Some(prev)).await?;
                tx.commit().await?;
            }
            return Ok((job, false));
        }

        let prev = job.status;
        let mut patch = JobPatch::new()
            .expect(prev)
            .status(JobStatus::Canceled)
            .locked_at(Stamp::Clear)
            .retryable(false)
            .heartbeat();
        patch.scheduled_at = Some(Stamp::Clear);
        patch.apply(&mut job, tx.now());
        if !tx.update_job(&job, Some(prev)).await? {
            return Err(CoreError::state(format!("job {} changed concurrently", job.id)));
        }
        tx.commit().await?;

        notify_job(self.notifier.as_ref(), EventKind::JobCanceled, &job);
        Ok((job, true))
    }

    /// Best-effort cancel of delegated children, breadth-first.
    async fn cascade_cancel(&self, owner: UserId, root: &JobRun) {
        let mut seen: HashSet<JobId> = HashSet::from([root.id]);
        let mut pending = children_of(root);

        while let Some(child_id) = pending.pop() {
            if !seen.insert(child_id) {
                continue;
            }
            match self.cancel_one(owner, child_id).await {
                Ok((child, changed)) => {
                    if changed {
                        info!(job_id = %child.id, root_job_id = %root.id, "child job canceled");
                    }
                    pending.extend(children_of(&child));
                }
                Err(CoreError::NotFound) => {
                    debug!(job_id = %child_id, "child job not found during cascade cancel");
                }
                Err(err) => {
                    warn!(job_id = %child_id, root_job_id = %root.id, error = %err, "cascade cancel failed");
                }
            }
        }
    }

    /// Put a failed or canceled job back in the queue.
    ///
    /// Orchestrated roots keep their succeeded stages; every other stage is
    /// reset to pending. The attempt counter starts over.
    pub async fn restart(&self, ctx: &RequestContext, id: JobId) -> Result<JobRun, CoreError> {
        let owner = ctx.owner();
        let mut tx = self.store.begin().await?;
        let mut job = tx.lock_job(owner, id).await?.ok_or(CoreError::NotFound)?;
        if !job.status.is_restartable() {
            return Err(CoreError::state(format!(
                "only failed or canceled jobs can be restarted; job {} is {}",
                job.id, job.status
            )));
        }

        let prev = job.status;
        let mut patch = JobPatch::new()
            .status(JobStatus::Queued)
            .stage(JobStatus::Queued.as_str())
            .progress(0)
            .error("")
            .retryable(false)
            .locked_at(Stamp::Clear)
            .last_error_at(Stamp::Clear)
            .scheduled_at(Stamp::Clear);
        patch.heartbeat_at = Some(Stamp::Clear);
        patch.apply(&mut job, tx.now());
        job.attempts = 0;

        if let Some(mut state) = OrchestratorState::from_result(&job.result)? {
            state.reset_for_restart();
            job.result = state.to_value();
        }

        if !tx.update_job(&job, Some(prev)).await? {
            return Err(CoreError::state(format!("job {} changed concurrently", job.id)));
        }

        if let Some(saga) = tx.saga_by_root_job(owner, job.id).await? {
            if saga.status.can_transition_to(SagaStatus::Running) {
                tx.update_saga_status(owner, saga.id, SagaStatus::Running).await?;
            }
        }
        tx.commit().await?;

        info!(job_id = %job.id, "job restarted");
        notify_job(self.notifier.as_ref(), EventKind::JobRestarted, &job);
        Ok(job)
    }
}

fn children_of(job: &JobRun) -> Vec<JobId> {
    match OrchestratorState::from_result(&job.result) {
        Ok(Some(state)) => state.child_job_ids(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use courseforge_events::{EventBus, InMemoryEventBus, Notification, BusNotifier};

    use super::*;
    use crate::jobs::IdempotencyKey;
    use crate::store::InMemoryStore;

    fn service() -> (JobService<InMemoryStore>, Arc<InMemoryEventBus<Notification>>) {
        let bus = Arc::new(InMemoryEventBus::new());
        let notifier: Arc<dyn Notifier> = Arc::new(BusNotifier::new(bus.clone()));
        let svc = JobService::new(Arc::new(InMemoryStore::new()), notifier, CoreConfig::default());
        (svc, bus)
    }

    #[tokio::test]
    async fn enqueue_creates_queued_job_and_notifies() {
        let (svc, bus) = service();
        let sub = bus.subscribe();
        let ctx = RequestContext::new(UserId::new());

        let job = svc.enqueue(NewJob::new(ctx.owner(), "build")).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.progress, 0);

        let n = sub.try_recv().unwrap();
        assert_eq!(n.kind(), EventKind::JobCreated);
        assert_eq!(n.job_id(), Some(*job.id.as_uuid()));
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_type() {
        let (svc, _) = service();
        let err = svc.enqueue(NewJob::new(UserId::new(), "")).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn idempotent_enqueue_returns_original_row() {
        let (svc, _) = service();
        let owner = UserId::new();
        let entity = EntityId::new();
        let new = NewJob::new(owner, "ingest")
            .for_entity("material", entity)
            .with_idempotency(IdempotencyKey::new("upload", "abc"));

        let first = svc.enqueue(new.clone()).await.unwrap();
        let second = svc.enqueue(new).await.unwrap();
        assert_eq!(first.id, second.id);
        let active = svc.list_active(&RequestContext::new(owner)).await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn enqueue_if_needed_debounces() {
        let (svc, _) = service();
        let owner = UserId::new();
        let entity = EntityId::new();
        let new = NewJob::new(owner, "rebuild").for_entity("course", entity);

        let (job, created) = svc.enqueue_if_needed(new.clone()).await.unwrap();
        assert!(created && job.is_some());
        let (job, created) = svc.enqueue_if_needed(new).await.unwrap();
        assert!(!created && job.is_none());
    }

    #[tokio::test]
    async fn restart_requires_terminal_failure() {
        let (svc, _) = service();
        let ctx = RequestContext::new(UserId::new());
        let job = svc.enqueue(NewJob::new(ctx.owner(), "build")).await.unwrap();

        let err = svc.restart(&ctx, job.id).await.unwrap_err();
        assert!(matches!(err, CoreError::StateViolation(_)));

        let canceled = svc.cancel(&ctx, job.id).await.unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);
        let restarted = svc.restart(&ctx, job.id).await.unwrap();
        assert_eq!(restarted.status, JobStatus::Queued);
        assert_eq!(restarted.stage, "queued");
        assert!(restarted.version > canceled.version);
    }

    #[tokio::test]
    async fn restart_resumes_a_saga_left_compensating() {
        let (svc, _) = service();
        let ctx = RequestContext::new(UserId::new());
        let owner = ctx.owner();
        let job = svc.enqueue(NewJob::new(owner, "build")).await.unwrap();
        svc.cancel(&ctx, job.id).await.unwrap();

        // A crash between `compensating` and `compensated` leaves the saga here.
        let mut tx = svc.store.begin().await.unwrap();
        let saga = crate::saga::create_or_get_in(&mut tx, owner, job.id).await.unwrap();
        tx.update_saga_status(owner, saga.id, SagaStatus::Compensating).await.unwrap();
        tx.commit().await.unwrap();

        svc.restart(&ctx, job.id).await.unwrap();

        let mut tx = svc.store.begin().await.unwrap();
        let resumed = tx.saga_by_root_job(owner, job.id).await.unwrap().unwrap();
        assert_eq!(resumed.status, SagaStatus::Running);
        let compensation = crate::saga::Compensation::VectorDeleteIds {
            namespace: "course".into(),
            ids: vec!["v1".into()],
        };
        let action = crate::saga::append_compensation_in(&mut tx, owner, saga.id, &compensation)
            .await
            .unwrap();
        assert_eq!(action.seq, 1);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_of_terminal_job_is_a_no_op() {
        let (svc, _) = service();
        let ctx = RequestContext::new(UserId::new());
        let job = svc.enqueue(NewJob::new(ctx.owner(), "build")).await.unwrap();
        let canceled = svc.cancel(&ctx, job.id).await.unwrap();
        let again = svc.cancel(&ctx, job.id).await.unwrap();
        assert_eq!(canceled, again);
    }

    #[tokio::test]
    async fn other_owners_see_not_found() {
        let (svc, _) = service();
        let job = svc.enqueue(NewJob::new(UserId::new(), "build")).await.unwrap();
        let stranger = RequestContext::new(UserId::new());
        assert!(matches!(svc.get(&stranger, job.id).await, Err(CoreError::NotFound)));
        assert!(matches!(svc.cancel(&stranger, job.id).await, Err(CoreError::NotFound)));
    }

    #[tokio::test]
    async fn update_fields_is_compare_and_set() {
        let (svc, _) = service();
        let ctx = RequestContext::new(UserId::new());
        let job = svc.enqueue(NewJob::new(ctx.owner(), "build")).await.unwrap();

        let err = svc
            .update_fields(&ctx, job.id, JobPatch::new().expect(JobStatus::Running).progress(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::StateViolation(_)));

        let updated = svc
            .update_fields(&ctx, job.id, JobPatch::new().expect(JobStatus::Queued).stage("prep"))
            .await
            .unwrap();
        assert_eq!(updated.stage, "prep");
    }
}
