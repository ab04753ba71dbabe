//! Saga engine: records compensating actions and executes them in reverse.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use courseforge_core::{CoreError, JobId, SagaActionId, SagaId, UserId};

use super::types::{ActionStatus, Compensation, SagaAction, SagaRun, SagaStatus};
use crate::adapters::{AdapterError, ObjectStore, VectorStore};
use crate::store::{SagaTx, Store, StoreTx};

/// Look up the saga of `root_job_id`, creating it if needed.
pub async fn create_or_get_in<T>(tx: &mut T, owner: UserId, root_job_id: JobId) -> Result<SagaRun, CoreError>
where
    T: SagaTx + ?Sized,
{
    if let Some(saga) = tx.saga_by_root_job(owner, root_job_id).await? {
        return Ok(saga);
    }
    let saga = SagaRun::new(owner, root_job_id, tx.now());
    tx.insert_saga(&saga).await?;
    Ok(saga)
}

/// Append a typed compensation under a row lock on the saga.
pub async fn append_compensation_in<T>(
    tx: &mut T,
    owner: UserId,
    saga_id: SagaId,
    compensation: &Compensation,
) -> Result<SagaAction, CoreError>
where
    T: SagaTx + ?Sized,
{
    let saga = tx.lock_saga(owner, saga_id).await?.ok_or(CoreError::NotFound)?;
    if saga.status != SagaStatus::Running {
        return Err(CoreError::state(format!(
            "cannot append to saga {} in status {}",
            saga.id,
            saga.status.as_str()
        )));
    }

    let seq = tx.max_action_seq(saga_id).await? + 1;
    let now = tx.now();
    let action = SagaAction {
        id: SagaActionId::new(),
        saga_id,
        seq,
        kind: compensation.kind().to_string(),
        payload: compensation.payload(),
        status: ActionStatus::Pending,
        created_at: now,
        updated_at: now,
    };
    tx.insert_action(&action).await?;
    debug!(saga_id = %saga_id, seq, kind = %action.kind, "saga action appended");
    Ok(action)
}

/// Append an action given as `(kind, payload)`. Legacy kind names are
/// normalized; unknown kinds and malformed payloads are rejected.
pub async fn append_action_in<T>(
    tx: &mut T,
    owner: UserId,
    saga_id: SagaId,
    kind: &str,
    payload: &JsonValue,
) -> Result<SagaAction, CoreError>
where
    T: SagaTx + ?Sized,
{
    let compensation = Compensation::from_parts(kind, payload).map_err(|e| match e {
        CoreError::Fatal(msg) => CoreError::InvalidArgument(msg),
        other => other,
    })?;
    append_compensation_in(tx, owner, saga_id, &compensation).await
}

/// Outcome of one `compensate` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    pub saga_id: Option<SagaId>,
    /// Actions whose inverse ran (or whose target was already gone).
    pub done: Vec<i64>,
    /// Actions whose inverse failed.
    pub failed: Vec<i64>,
    /// Actions that were already `done` or `failed` before this call.
    pub skipped: Vec<i64>,
}

pub struct SagaEngine<S: Store> {
    store: Arc<S>,
    objects: Arc<dyn ObjectStore>,
    vectors: Arc<dyn VectorStore>,
}

impl<S: Store> Clone for SagaEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            objects: self.objects.clone(),
            vectors: self.vectors.clone(),
        }
    }
}

impl<S: Store> SagaEngine<S> {
    pub fn new(store: Arc<S>, objects: Arc<dyn ObjectStore>, vectors: Arc<dyn VectorStore>) -> Self {
        Self {
            store,
            objects,
            vectors,
        }
    }

    /// Idempotent: returns the existing saga of the root job if there is one.
    pub async fn create_or_get(&self, owner: UserId, root_job_id: JobId) -> Result<SagaRun, CoreError> {
        let mut tx = self.store.begin().await?;
        match create_or_get_in(&mut tx, owner, root_job_id).await {
            Ok(saga) => {
                tx.commit().await?;
                Ok(saga)
            }
            Err(CoreError::Conflict(_)) => {
                drop(tx);
                let mut tx = self.store.begin().await?;
                let saga = tx.saga_by_root_job(owner, root_job_id).await?;
                tx.rollback().await?;
                saga.ok_or(CoreError::NotFound)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn append_action(
        &self,
        owner: UserId,
        saga_id: SagaId,
        kind: &str,
        payload: &JsonValue,
    ) -> Result<SagaAction, CoreError> {
        let mut tx = self.store.begin().await?;
        let action = append_action_in(&mut tx, owner, saga_id, kind, payload).await?;
        tx.commit().await?;
        Ok(action)
    }

    pub async fn get_by_root_job(&self, owner: UserId, root_job_id: JobId) -> Result<Option<SagaRun>, CoreError> {
        let mut tx = self.store.begin().await?;
        let saga = tx.saga_by_root_job(owner, root_job_id).await?;
        tx.rollback().await?;
        Ok(saga)
    }

    /// Actions of a saga, highest seq first.
    pub async fn list_actions(&self, owner: UserId, saga_id: SagaId) -> Result<Vec<SagaAction>, CoreError> {
        let mut tx = self.store.begin().await?;
        if tx.get_saga(owner, saga_id).await?.is_none() {
            return Err(CoreError::NotFound);
        }
        let actions = tx.list_actions_desc(saga_id).await?;
        tx.rollback().await?;
        Ok(actions)
    }

    /// Explicit lifecycle move, validated against the saga state machine.
    pub async fn transition_status(
        &self,
        owner: UserId,
        saga_id: SagaId,
        status: SagaStatus,
    ) -> Result<SagaRun, CoreError> {
        let mut tx = self.store.begin().await?;
        let mut saga = tx.lock_saga(owner, saga_id).await?.ok_or(CoreError::NotFound)?;
        if saga.status != status {
            if !saga.status.can_transition_to(status) {
                return Err(CoreError::state(format!(
                    "saga {} cannot move from {} to {}",
                    saga.id,
                    saga.status.as_str(),
                    status.as_str()
                )));
            }
            tx.update_saga_status(owner, saga_id, status).await?;
            saga.status = status;
            saga.updated_at = tx.now();
        }
        tx.commit().await?;
        Ok(saga)
    }

    /// Run the inverse of every pending action, highest seq first.
    ///
    /// Each action is settled in its own transaction, so a crash mid-way
    /// resumes where it stopped. Failures are recorded and the walk goes on.
    /// Safe to call again: settled actions are skipped.
    pub async fn compensate(&self, owner: UserId, saga_id: SagaId) -> Result<CompensationReport, CoreError> {
        self.transition_status(owner, saga_id, SagaStatus::Compensating).await?;
        info!(saga_id = %saga_id, "saga compensation started");

        let actions = {
            let mut tx = self.store.begin().await?;
            let actions = tx.list_actions_desc(saga_id).await?;
            tx.rollback().await?;
            actions
        };

        let mut report = CompensationReport {
            saga_id: Some(saga_id),
            ..Default::default()
        };

        for action in actions {
            if action.status != ActionStatus::Pending {
                report.skipped.push(action.seq);
                continue;
            }

            let outcome = match action.compensation() {
                Ok(compensation) => self.execute(&compensation).await.map_err(CoreError::from),
                Err(err) => Err(err),
            };
            let to = match &outcome {
                Ok(()) => ActionStatus::Done,
                Err(err) => {
                    warn!(
                        saga_id = %saga_id,
                        seq = action.seq,
                        kind = %action.kind,
                        error = %err,
                        "compensating action failed"
                    );
                    ActionStatus::Failed
                }
            };

            let mut tx = self.store.begin().await?;
            tx.update_action_status(action.id, ActionStatus::Pending, to).await?;
            tx.commit().await?;

            match to {
                ActionStatus::Done => report.done.push(action.seq),
                _ => report.failed.push(action.seq),
            }
        }

        self.transition_status(owner, saga_id, SagaStatus::Compensated).await?;
        info!(
            saga_id = %saga_id,
            done = report.done.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "saga compensated"
        );
        Ok(report)
    }

    /// Missing targets count as compensated.
    async fn execute(&self, compensation: &Compensation) -> Result<(), AdapterError> {
        let result = match compensation {
            Compensation::ObjectDeleteKey { category, key } => self.objects.delete(*category, key).await,
            Compensation::ObjectDeletePrefix { category, prefix } => {
                self.objects.delete_prefix(*category, prefix).await
            }
            Compensation::VectorDeleteIds { namespace, ids } => {
                self.vectors.delete_ids(namespace, ids).await
            }
        };
        match result {
            Err(err) if err.is_not_found() => {
                debug!(kind = compensation.kind(), "compensation target already absent");
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::adapters::{InMemoryObjectStore, InMemoryVectorStore, ObjectCategory};
    use crate::store::InMemoryStore;

    fn engine() -> (SagaEngine<InMemoryStore>, Arc<InMemoryObjectStore>, Arc<InMemoryVectorStore>) {
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let objects = Arc::new(InMemoryObjectStore::new().with_call_log(calls.clone()));
        let vectors = Arc::new(InMemoryVectorStore::new().with_call_log(calls));
        let engine = SagaEngine::new(Arc::new(InMemoryStore::new()), objects.clone(), vectors.clone());
        (engine, objects, vectors)
    }

    #[tokio::test]
    async fn create_or_get_is_idempotent() {
        let (engine, _, _) = engine();
        let owner = UserId::new();
        let root = JobId::new();
        let a = engine.create_or_get(owner, root).await.unwrap();
        let b = engine.create_or_get(owner, root).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.status, SagaStatus::Running);
    }

    #[tokio::test]
    async fn unknown_kinds_are_rejected_at_append() {
        let (engine, _, _) = engine();
        let owner = UserId::new();
        let saga = engine.create_or_get(owner, JobId::new()).await.unwrap();
        let err = engine
            .append_action(owner, saga.id, "email_user", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn legacy_kind_is_stored_canonically() {
        let (engine, _, _) = engine();
        let owner = UserId::new();
        let saga = engine.create_or_get(owner, JobId::new()).await.unwrap();
        let action = engine
            .append_action(
                owner,
                saga.id,
                "pinecone_delete_ids",
                &serde_json::json!({ "namespace": "n", "ids": ["a"] }),
            )
            .await
            .unwrap();
        assert_eq!(action.kind, "vector_delete_ids");
        assert_eq!(action.seq, 1);
    }

    #[tokio::test]
    async fn compensation_runs_in_reverse_and_is_reentrant() {
        let (engine, objects, vectors) = engine();
        let owner = UserId::new();
        let saga = engine.create_or_get(owner, JobId::new()).await.unwrap();

        objects.upload(ObjectCategory::Material, "k1", vec![1]).await.unwrap();
        engine
            .append_action(owner, saga.id, "object_delete_key", &serde_json::json!({ "category": "material", "key": "k1" }))
            .await
            .unwrap();
        // Target never existed: not-found counts as success.
        engine
            .append_action(owner, saga.id, "object_delete_key", &serde_json::json!({ "category": "avatar", "key": "gone" }))
            .await
            .unwrap();
        engine
            .append_action(owner, saga.id, "vector_delete_ids", &serde_json::json!({ "namespace": "n", "ids": ["v1"] }))
            .await
            .unwrap();

        let report = engine.compensate(owner, saga.id).await.unwrap();
        assert_eq!(report.done, vec![3, 2, 1]);
        assert!(report.failed.is_empty());
        assert!(!objects.contains(ObjectCategory::Material, "k1"));
        assert_eq!(
            vectors.calls(),
            vec![
                "object.upload(material,k1)".to_string(),
                "vector.delete_ids(n,[v1])".to_string(),
                "object.delete(avatar,gone)".to_string(),
                "object.delete(material,k1)".to_string(),
            ]
        );

        let again = engine.compensate(owner, saga.id).await.unwrap();
        assert!(again.done.is_empty());
        assert_eq!(again.skipped, vec![3, 2, 1]);

        let saga = engine.get_by_root_job(owner, saga.root_job_id).await.unwrap().unwrap();
        assert_eq!(saga.status, SagaStatus::Compensated);
    }

    #[tokio::test]
    async fn succeeded_sagas_cannot_be_compensated() {
        let (engine, _, _) = engine();
        let owner = UserId::new();
        let saga = engine.create_or_get(owner, JobId::new()).await.unwrap();
        engine.transition_status(owner, saga.id, SagaStatus::Succeeded).await.unwrap();
        let err = engine.compensate(owner, saga.id).await.unwrap_err();
        assert!(matches!(err, CoreError::StateViolation(_)));
    }

    proptest! {
        /// Property: appended seqs form the gap-free sequence 1..=N.
        #[test]
        fn saga_seq_is_gap_free(n in 1usize..20) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (engine, _, _) = engine();
                let owner = UserId::new();
                let saga = engine.create_or_get(owner, JobId::new()).await.unwrap();
                for i in 0..n {
                    engine
                        .append_action(owner, saga.id, "object_delete_prefix", &serde_json::json!({ "category": "material", "prefix": format!("p{i}/") }))
                        .await
                        .unwrap();
                }
                let mut seqs: Vec<i64> = engine
                    .list_actions(owner, saga.id)
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|a| a.seq)
                    .collect();
                seqs.reverse();
                let expected: Vec<i64> = (1..=n as i64).collect();
                assert_eq!(seqs, expected);
            });
        }
    }
}
