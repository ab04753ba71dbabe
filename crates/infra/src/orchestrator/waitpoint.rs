//! Waitpoints: stages parked until an external decision arrives.
//!
//! A stage asks for a decision by returning `StageOutcome::Wait`; the runner
//! stores the prompt in `result.stages[name].prompt` and parks the root in
//! `waiting_user`. [`WaitpointController::resume`] records the decision and
//! hands the root back to the claimer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use courseforge_core::{CoreError, JobId, RequestContext};
use courseforge_events::{EventKind, Notifier};

use super::state::{OrchestratorState, StageStatus};
use crate::jobs::service::notify_job;
use crate::jobs::{JobPatch, JobRun, JobStatus, Stamp};
use crate::store::{JobTx, Store, StoreTx};

/// The decision a parked job is waiting for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDecision {
    pub job_id: JobId,
    pub stage: String,
    pub prompt: JsonValue,
}

pub struct WaitpointController<S: Store> {
    store: Arc<S>,
    notifier: Arc<dyn Notifier>,
}

impl<S: Store> Clone for WaitpointController<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

impl<S: Store> WaitpointController<S> {
    pub fn new(store: Arc<S>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// The open waitpoint of a job, if it is parked on one.
    pub async fn pending(&self, ctx: &RequestContext, job_id: JobId) -> Result<Option<PendingDecision>, CoreError> {
        let mut tx = self.store.begin().await?;
        let job = tx.get_job(ctx.owner(), job_id).await?.ok_or(CoreError::NotFound)?;
        tx.rollback().await?;

        if job.status != JobStatus::WaitingUser {
            return Ok(None);
        }
        let Some(state) = OrchestratorState::from_result(&job.result)? else {
            return Ok(None);
        };
        Ok(state.waiting_stage().map(|stage| PendingDecision {
            job_id,
            stage: stage.to_string(),
            prompt: state
                .stage(stage)
                .and_then(|s| s.prompt.clone())
                .unwrap_or(JsonValue::Null),
        }))
    }

    /// Record `decision` for the waiting `stage` and requeue the job.
    ///
    /// Fails with `StateViolation` unless the job is `waiting_user` on
    /// exactly that stage.
    pub async fn resume(
        &self,
        ctx: &RequestContext,
        job_id: JobId,
        stage: &str,
        decision: JsonValue,
    ) -> Result<JobRun, CoreError> {
        let mut tx = self.store.begin().await?;
        let mut job = tx.lock_job(ctx.owner(), job_id).await?.ok_or(CoreError::NotFound)?;
        if job.status != JobStatus::WaitingUser {
            return Err(CoreError::state(format!(
                "job {} is {}, not waiting for a decision",
                job.id, job.status
            )));
        }

        let mut state = OrchestratorState::from_result(&job.result)?
            .ok_or_else(|| CoreError::state(format!("job {} has no stages", job.id)))?;
        let waiting = state
            .stages
            .get_mut(stage)
            .filter(|s| s.status == StageStatus::WaitingUser)
            .ok_or_else(|| {
                CoreError::state(format!("stage {stage} of job {job_id} is not waiting for a decision"))
            })?;
        waiting.status = StageStatus::Pending;
        waiting.decision = Some(decision);

        JobPatch::new()
            .expect(JobStatus::WaitingUser)
            .status(JobStatus::Queued)
            .locked_at(Stamp::Clear)
            .scheduled_at(Stamp::Clear)
            .heartbeat()
            .result(state.to_value())
            .apply(&mut job, tx.now());
        if !tx.update_job(&job, Some(JobStatus::WaitingUser)).await? {
            return Err(CoreError::state(format!("job {} changed concurrently", job.id)));
        }
        tx.commit().await?;

        info!(job_id = %job.id, stage, "waitpoint resolved");
        notify_job(self.notifier.as_ref(), EventKind::JobRestarted, &job);
        Ok(job)
    }
}
