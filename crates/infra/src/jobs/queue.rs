//! Claimer and worker-side job transitions.
//!
//! The queue hands out leased rows and records how their execution ended.
//! Every worker-side write is fenced by the [`Lease`] of the claim: a row that
//! was canceled, or reclaimed by another worker after a stale lease, no longer
//! matches and is left alone.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument};

use courseforge_core::{CoreConfig, CoreError};
use courseforge_events::{EventKind, Notifier};

use super::service::notify_job;
use super::types::{JobPatch, JobRun, JobStatus, Lease, Stamp};
use crate::store::{ClaimParams, JobTx, Store, StoreTx};

/// Where handlers report in-stage progress.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Returns false when `lease` no longer holds the job.
    async fn report_progress(
        &self,
        lease: &Lease,
        progress: i32,
        stage: Option<&str>,
    ) -> Result<bool, CoreError>;
}

pub struct JobQueue<S: Store> {
    store: Arc<S>,
    notifier: Arc<dyn Notifier>,
    params: ClaimParams,
}

impl<S: Store> Clone for JobQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            params: self.params,
        }
    }
}

impl<S: Store> JobQueue<S> {
    pub fn new(store: Arc<S>, notifier: Arc<dyn Notifier>, config: &CoreConfig) -> Self {
        Self {
            store,
            notifier,
            params: ClaimParams::from_config(config),
        }
    }

    pub fn params(&self) -> &ClaimParams {
        &self.params
    }

    /// Lease the next runnable job, if any.
    #[instrument(skip(self), err)]
    pub async fn claim(&self) -> Result<Option<JobRun>, CoreError> {
        let mut tx = self.store.begin().await?;
        let claimed = tx.claim_next_runnable(&self.params).await?;
        tx.commit().await?;

        match &claimed {
            Some(job) => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    "job claimed"
                );
                notify_job(self.notifier.as_ref(), EventKind::JobProgress, job);
            }
            None => debug!("no runnable job"),
        }
        Ok(claimed)
    }

    /// Write `heartbeat_at = now`. Returns false once `lease` lost the row.
    pub async fn renew_lease(&self, lease: &Lease) -> Result<bool, CoreError> {
        let mut tx = self.store.begin().await?;
        let renewed = tx.touch_heartbeat(lease).await?;
        tx.commit().await?;
        Ok(renewed)
    }

    /// Mark a running job succeeded. `None` when `lease` no longer holds it.
    #[instrument(skip(self, result), fields(job_id = %lease.job_id, attempt = lease.attempt), err)]
    pub async fn complete(
        &self,
        lease: &Lease,
        result: Option<JsonValue>,
    ) -> Result<Option<JobRun>, CoreError> {
        let mut patch = JobPatch::new()
            .expect(JobStatus::Running)
            .status(JobStatus::Succeeded)
            .progress(100)
            .error("")
            .retryable(false)
            .locked_at(Stamp::Clear);
        if let Some(result) = result {
            patch = patch.result(result);
        }

        let done = self.transition(lease, patch).await?;
        if let Some(job) = &done {
            info!(job_id = %job.id, attempts = job.attempts, "job succeeded");
            notify_job(self.notifier.as_ref(), EventKind::JobDone, job);
        }
        Ok(done)
    }

    /// Mark a running job failed. A retryable failure stays claimable after
    /// backoff; otherwise the row is final.
    #[instrument(skip(self, error), fields(job_id = %lease.job_id, attempt = lease.attempt), err)]
    pub async fn fail(
        &self,
        lease: &Lease,
        error: &str,
        retryable: bool,
    ) -> Result<Option<JobRun>, CoreError> {
        let patch = JobPatch::new()
            .expect(JobStatus::Running)
            .status(JobStatus::Failed)
            .error(error)
            .retryable(retryable)
            .locked_at(Stamp::Clear)
            .last_error_at(Stamp::Now);

        let failed = self.transition(lease, patch).await?;
        if let Some(job) = &failed {
            info!(
                job_id = %job.id,
                attempts = job.attempts,
                retryable,
                error,
                "job failed"
            );
            notify_job(self.notifier.as_ref(), EventKind::JobFailed, job);
        }
        Ok(failed)
    }

    async fn transition(&self, lease: &Lease, patch: JobPatch) -> Result<Option<JobRun>, CoreError> {
        let patch = patch.held_by(*lease);
        let mut tx = self.store.begin().await?;
        let Some(mut job) = tx.lock_job(lease.owner, lease.job_id).await? else {
            return Ok(None);
        };
        if !patch.matches(&job) {
            debug!(
                job_id = %lease.job_id,
                status = %job.status,
                attempt = lease.attempt,
                current_attempt = job.attempts,
                "lease no longer holds the job; transition skipped"
            );
            return Ok(None);
        }
        let prev = job.status;
        patch.apply(&mut job, tx.now());
        if !tx.update_job(&job, Some(prev)).await? {
            return Ok(None);
        }
        tx.commit().await?;
        Ok(Some(job))
    }
}

#[async_trait]
impl<S: Store> ProgressSink for JobQueue<S> {
    async fn report_progress(
        &self,
        lease: &Lease,
        progress: i32,
        stage: Option<&str>,
    ) -> Result<bool, CoreError> {
        let mut patch = JobPatch::new()
            .expect(JobStatus::Running)
            .progress(progress)
            .heartbeat();
        if let Some(stage) = stage {
            patch = patch.stage(stage);
        }
        match self.transition(lease, patch).await? {
            Some(job) => {
                notify_job(self.notifier.as_ref(), EventKind::JobProgress, &job);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
