//! In-memory store for tests and development.
//!
//! All tables sit behind one async mutex. A transaction holds the lock for its
//! whole lifetime and works on a copy of the tables, which replaces the shared
//! state on commit. This gives serializable isolation; row locks are implied.
//!
//! Do not begin a second transaction on the same task while one is open: the
//! second `begin` waits for the first to finish.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use courseforge_core::{
    Clock, EntityId, JobId, MessageId, SagaActionId, SagaId, SystemClock, ThreadId, TurnId, UserId,
};

use super::{ChatTx, ClaimParams, JobTx, SagaTx, Store, StoreError, StoreTx};
use crate::chat::{ChatMessage, ChatThread, ChatTurn, MessageRole};
use crate::jobs::{IdempotencyRecord, JobRun, JobStatus, Lease};
use crate::saga::{ActionStatus, SagaAction, SagaRun, SagaStatus};

type IdempotencyScope = (UserId, Option<EntityId>, String, String);

#[derive(Debug, Default, Clone)]
struct Tables {
    jobs: HashMap<JobId, JobRun>,
    idempotency: HashMap<IdempotencyScope, IdempotencyRecord>,
    sagas: HashMap<SagaId, SagaRun>,
    actions: HashMap<SagaActionId, SagaAction>,
    threads: HashMap<ThreadId, ChatThread>,
    messages: HashMap<MessageId, ChatMessage>,
    turns: HashMap<TurnId, ChatTurn>,
}

impl Tables {
    /// Mirror of the partial unique index on non-terminal rows.
    fn check_singleton(&self, job: &JobRun) -> Result<(), StoreError> {
        if job.entity_id.is_none() || !job.is_runnable() {
            return Ok(());
        }
        let clash = self
            .jobs
            .values()
            .any(|other| other.id != job.id && other.is_runnable() && other.same_slot(job));
        if clash {
            return Err(StoreError::Conflict(format!(
                "a runnable {} job already exists for {} {:?}",
                job.job_type, job.entity_type, job.entity_id
            )));
        }
        Ok(())
    }

    fn has_runnable_sibling(&self, job: &JobRun) -> bool {
        job.entity_id.is_some()
            && self
                .jobs
                .values()
                .any(|other| other.id != job.id && other.is_runnable() && other.same_slot(job))
    }

    fn entity_jobs<'a>(
        &'a self,
        owner: UserId,
        entity_type: &'a str,
        entity_id: Option<EntityId>,
        job_type: &'a str,
    ) -> impl Iterator<Item = &'a JobRun> + 'a {
        self.jobs.values().filter(move |j| {
            j.owner_user_id == owner
                && j.entity_type == entity_type
                && j.entity_id == entity_id
                && j.job_type == job_type
                && j.deleted_at.is_none()
        })
    }

    fn check_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        for other in self.messages.values() {
            if other.id == message.id || other.thread_id != message.thread_id {
                continue;
            }
            if other.seq == message.seq {
                return Err(StoreError::Conflict(format!(
                    "message seq {} already used in thread {}",
                    message.seq, message.thread_id
                )));
            }
            let same_key = message.role == MessageRole::User
                && other.role == MessageRole::User
                && !message.is_deleted()
                && !other.is_deleted()
                && message.idempotency_key.is_some()
                && other.idempotency_key == message.idempotency_key;
            if same_key {
                return Err(StoreError::Conflict("duplicate message idempotency key".to_string()));
            }
        }
        Ok(())
    }
}

/// Store backed by process memory.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` as the store's time source.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            clock,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Number of job rows, deleted ones included.
    pub async fn job_count(&self) -> usize {
        self.tables.lock().await.jobs.len()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let guard = self.tables.clone().lock_owned().await;
        let work = guard.clone();
        Ok(InMemoryTx {
            guard,
            work,
            now: self.clock.now(),
        })
    }
}

/// Transaction over an [`InMemoryStore`].
pub struct InMemoryTx {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
    now: DateTime<Utc>,
}

impl std::fmt::Debug for InMemoryTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTx").field("now", &self.now).finish()
    }
}

#[async_trait]
impl StoreTx for InMemoryTx {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    async fn commit(self) -> Result<(), StoreError> {
        let InMemoryTx { mut guard, work, .. } = self;
        *guard = work;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl JobTx for InMemoryTx {
    async fn insert_job(&mut self, job: &JobRun) -> Result<(), StoreError> {
        if self.work.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }
        self.work.check_singleton(job)?;
        self.work.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&mut self, owner: UserId, id: JobId) -> Result<Option<JobRun>, StoreError> {
        Ok(self
            .work
            .jobs
            .get(&id)
            .filter(|j| j.owner_user_id == owner && j.deleted_at.is_none())
            .cloned())
    }

    async fn get_jobs(&mut self, owner: UserId, ids: &[JobId]) -> Result<Vec<JobRun>, StoreError> {
        let mut jobs: Vec<JobRun> = ids
            .iter()
            .filter_map(|id| self.work.jobs.get(id))
            .filter(|j| j.owner_user_id == owner && j.deleted_at.is_none())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs.dedup_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn lock_job(&mut self, owner: UserId, id: JobId) -> Result<Option<JobRun>, StoreError> {
        self.get_job(owner, id).await
    }

    async fn update_job(&mut self, job: &JobRun, expected: Option<JobStatus>) -> Result<bool, StoreError> {
        let Some(current) = self.work.jobs.get(&job.id) else {
            return Ok(false);
        };
        if current.owner_user_id != job.owner_user_id {
            return Ok(false);
        }
        if expected.is_some_and(|s| s != current.status) {
            return Ok(false);
        }
        self.work.check_singleton(job)?;
        self.work.jobs.insert(job.id, job.clone());
        Ok(true)
    }

    async fn claim_next_runnable(&mut self, params: &ClaimParams) -> Result<Option<JobRun>, StoreError> {
        let now = self.now;
        let mut candidates: Vec<&JobRun> = self
            .work
            .jobs
            .values()
            .filter(|j| params.is_claimable(j, now))
            .filter(|j| j.status != JobStatus::Failed || !self.work.has_runnable_sibling(j))
            .collect();
        candidates.sort_by_key(|j| (j.created_at, j.id));

        let Some(picked) = candidates.first() else {
            return Ok(None);
        };

        let mut job = (*picked).clone();
        if job.status == JobStatus::Failed {
            job.error.clear();
        }
        job.status = JobStatus::Running;
        job.locked_at = Some(now);
        job.heartbeat_at = Some(now);
        job.scheduled_at = None;
        job.attempts += 1;
        job.touch(now);
        self.work.jobs.insert(job.id, job.clone());
        Ok(Some(job))
    }

    async fn touch_heartbeat(&mut self, lease: &Lease) -> Result<bool, StoreError> {
        let now = self.now;
        match self.work.jobs.get_mut(&lease.job_id) {
            Some(job) if lease.holds(job) => {
                job.heartbeat_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_runnable_for_entity(
        &mut self,
        owner: UserId,
        entity_type: &str,
        entity_id: Option<EntityId>,
        job_type: &str,
    ) -> Result<Option<JobRun>, StoreError> {
        Ok(self
            .work
            .entity_jobs(owner, entity_type, entity_id, job_type)
            .filter(|j| !j.status.is_terminal())
            .min_by_key(|j| (j.created_at, j.id))
            .cloned())
    }

    async fn latest_for_entity(
        &mut self,
        owner: UserId,
        entity_type: &str,
        entity_id: Option<EntityId>,
        job_type: &str,
    ) -> Result<Option<JobRun>, StoreError> {
        Ok(self
            .work
            .entity_jobs(owner, entity_type, entity_id, job_type)
            .max_by_key(|j| (j.created_at, j.id))
            .cloned())
    }

    async fn list_active(&mut self, owner: UserId, limit: i64) -> Result<Vec<JobRun>, StoreError> {
        let mut jobs: Vec<JobRun> = self
            .work
            .jobs
            .values()
            .filter(|j| j.owner_user_id == owner && j.is_runnable())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn insert_idempotency(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<Option<uuid::Uuid>, StoreError> {
        let scope = (
            record.owner_user_id,
            record.entity_id,
            record.operation.clone(),
            record.key.clone(),
        );
        if let Some(existing) = self.work.idempotency.get(&scope) {
            return Ok(Some(existing.target_id));
        }
        self.work.idempotency.insert(scope, record.clone());
        Ok(None)
    }

    async fn get_idempotency(
        &mut self,
        owner: UserId,
        entity_id: Option<EntityId>,
        operation: &str,
        key: &str,
    ) -> Result<Option<uuid::Uuid>, StoreError> {
        let scope = (owner, entity_id, operation.to_string(), key.to_string());
        Ok(self.work.idempotency.get(&scope).map(|r| r.target_id))
    }
}

#[async_trait]
impl SagaTx for InMemoryTx {
    async fn insert_saga(&mut self, saga: &SagaRun) -> Result<(), StoreError> {
        if self
            .work
            .sagas
            .values()
            .any(|s| s.id == saga.id || s.root_job_id == saga.root_job_id)
        {
            return Err(StoreError::Conflict(format!(
                "saga already exists for root job {}",
                saga.root_job_id
            )));
        }
        self.work.sagas.insert(saga.id, saga.clone());
        Ok(())
    }

    async fn saga_by_root_job(&mut self, owner: UserId, root_job_id: JobId) -> Result<Option<SagaRun>, StoreError> {
        Ok(self
            .work
            .sagas
            .values()
            .find(|s| s.owner_user_id == owner && s.root_job_id == root_job_id)
            .cloned())
    }

    async fn get_saga(&mut self, owner: UserId, id: SagaId) -> Result<Option<SagaRun>, StoreError> {
        Ok(self
            .work
            .sagas
            .get(&id)
            .filter(|s| s.owner_user_id == owner)
            .cloned())
    }

    async fn lock_saga(&mut self, owner: UserId, id: SagaId) -> Result<Option<SagaRun>, StoreError> {
        self.get_saga(owner, id).await
    }

    async fn update_saga_status(
        &mut self,
        owner: UserId,
        id: SagaId,
        status: SagaStatus,
    ) -> Result<bool, StoreError> {
        let now = self.now;
        match self.work.sagas.get_mut(&id) {
            Some(saga) if saga.owner_user_id == owner => {
                saga.status = status;
                saga.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn max_action_seq(&mut self, saga_id: SagaId) -> Result<i64, StoreError> {
        Ok(self
            .work
            .actions
            .values()
            .filter(|a| a.saga_id == saga_id)
            .map(|a| a.seq)
            .max()
            .unwrap_or(0))
    }

    async fn insert_action(&mut self, action: &SagaAction) -> Result<(), StoreError> {
        let clash = self
            .work
            .actions
            .values()
            .any(|a| a.id == action.id || (a.saga_id == action.saga_id && a.seq == action.seq));
        if clash {
            return Err(StoreError::Conflict(format!(
                "saga action seq {} already exists",
                action.seq
            )));
        }
        if !self.work.sagas.contains_key(&action.saga_id) {
            return Err(StoreError::NotFound(format!("saga {}", action.saga_id)));
        }
        self.work.actions.insert(action.id, action.clone());
        Ok(())
    }

    async fn list_actions_desc(&mut self, saga_id: SagaId) -> Result<Vec<SagaAction>, StoreError> {
        let mut actions: Vec<SagaAction> = self
            .work
            .actions
            .values()
            .filter(|a| a.saga_id == saga_id)
            .cloned()
            .collect();
        actions.sort_by(|a, b| b.seq.cmp(&a.seq));
        Ok(actions)
    }

    async fn update_action_status(
        &mut self,
        id: SagaActionId,
        from: ActionStatus,
        to: ActionStatus,
    ) -> Result<bool, StoreError> {
        let now = self.now;
        match self.work.actions.get_mut(&id) {
            Some(action) if action.status == from => {
                action.status = to;
                action.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ChatTx for InMemoryTx {
    async fn insert_thread(&mut self, thread: &ChatThread) -> Result<(), StoreError> {
        if self.work.threads.contains_key(&thread.id) {
            return Err(StoreError::Conflict(format!("thread {} already exists", thread.id)));
        }
        self.work.threads.insert(thread.id, thread.clone());
        Ok(())
    }

    async fn lock_thread(&mut self, owner: UserId, id: ThreadId) -> Result<Option<ChatThread>, StoreError> {
        Ok(self
            .work
            .threads
            .get(&id)
            .filter(|t| t.owner_user_id == owner)
            .cloned())
    }

    async fn set_thread_next_seq(&mut self, owner: UserId, id: ThreadId, next_seq: i64) -> Result<(), StoreError> {
        let now = self.now;
        match self.work.threads.get_mut(&id) {
            Some(thread) if thread.owner_user_id == owner => {
                thread.next_seq = next_seq;
                thread.updated_at = now;
                Ok(())
            }
            _ => Err(StoreError::NotFound(format!("thread {id}"))),
        }
    }

    async fn insert_message(&mut self, message: &ChatMessage) -> Result<(), StoreError> {
        if self.work.messages.contains_key(&message.id) {
            return Err(StoreError::Conflict(format!("message {} already exists", message.id)));
        }
        self.work.check_message(message)?;
        self.work.messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn get_message(&mut self, owner: UserId, id: MessageId) -> Result<Option<ChatMessage>, StoreError> {
        Ok(self
            .work
            .messages
            .get(&id)
            .filter(|m| m.owner_user_id == owner)
            .cloned())
    }

    async fn find_user_message_by_key(
        &mut self,
        owner: UserId,
        thread_id: ThreadId,
        key: &str,
    ) -> Result<Option<ChatMessage>, StoreError> {
        Ok(self
            .work
            .messages
            .values()
            .find(|m| {
                m.owner_user_id == owner
                    && m.thread_id == thread_id
                    && m.role == MessageRole::User
                    && !m.is_deleted()
                    && m.idempotency_key.as_deref() == Some(key)
            })
            .cloned())
    }

    async fn update_message(&mut self, message: &ChatMessage) -> Result<bool, StoreError> {
        match self.work.messages.get(&message.id) {
            Some(current) if current.owner_user_id == message.owner_user_id => {}
            _ => return Ok(false),
        }
        self.work.check_message(message)?;
        self.work.messages.insert(message.id, message.clone());
        Ok(true)
    }

    async fn list_messages(&mut self, owner: UserId, thread_id: ThreadId) -> Result<Vec<ChatMessage>, StoreError> {
        let mut messages: Vec<ChatMessage> = self
            .work
            .messages
            .values()
            .filter(|m| m.owner_user_id == owner && m.thread_id == thread_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.seq);
        Ok(messages)
    }

    async fn insert_turn(&mut self, turn: &ChatTurn) -> Result<(), StoreError> {
        let clash = self.work.turns.values().any(|t| {
            t.id == turn.id
                || t.user_message_id == turn.user_message_id
                || t.assistant_message_id == turn.assistant_message_id
        });
        if clash {
            return Err(StoreError::Conflict("turn already exists for message".to_string()));
        }
        self.work.turns.insert(turn.id, turn.clone());
        Ok(())
    }

    async fn turn_by_user_message(
        &mut self,
        owner: UserId,
        user_message_id: MessageId,
    ) -> Result<Option<ChatTurn>, StoreError> {
        Ok(self
            .work
            .turns
            .values()
            .find(|t| t.owner_user_id == owner && t.user_message_id == user_message_id)
            .cloned())
    }

    async fn turn_by_job(&mut self, owner: UserId, job_id: JobId) -> Result<Option<ChatTurn>, StoreError> {
        Ok(self
            .work
            .turns
            .values()
            .find(|t| t.owner_user_id == owner && t.job_id == job_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courseforge_core::{CoreConfig, ManualClock};

    use super::*;
    use crate::jobs::{JobPatch, NewJob};

    fn store_with_clock() -> (InMemoryStore, ManualClock) {
        let clock = ManualClock::default();
        (InMemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    fn params() -> ClaimParams {
        ClaimParams::from_config(&CoreConfig::default())
    }

    #[tokio::test]
    async fn uncommitted_writes_are_discarded() {
        let store = InMemoryStore::new();
        let owner = UserId::new();
        {
            let mut tx = store.begin().await.unwrap();
            let job = JobRun::from_new(&NewJob::new(owner, "build"), tx.now());
            tx.insert_job(&job).await.unwrap();
        }
        assert_eq!(store.job_count().await, 0);
    }

    #[tokio::test]
    async fn second_runnable_job_for_same_entity_conflicts() {
        let store = InMemoryStore::new();
        let owner = UserId::new();
        let entity = EntityId::new();
        let new = NewJob::new(owner, "build").for_entity("material", entity);

        let mut tx = store.begin().await.unwrap();
        let first = JobRun::from_new(&new, tx.now());
        tx.insert_job(&first).await.unwrap();
        let second = JobRun::from_new(&new, tx.now());
        let err = tx.insert_job(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Other job types on the same entity are unaffected.
        let other = JobRun::from_new(&NewJob::new(owner, "embed").for_entity("material", entity), tx.now());
        tx.insert_job(&other).await.unwrap();
    }

    #[tokio::test]
    async fn claim_is_fifo_and_honours_scheduled_at() {
        let (store, clock) = store_with_clock();
        let owner = UserId::new();

        let mut tx = store.begin().await.unwrap();
        let now = tx.now();
        let later = JobRun::from_new(
            &NewJob::new(owner, "a").scheduled_at(now + chrono::Duration::seconds(30)),
            now,
        );
        let first = JobRun::from_new(&NewJob::new(owner, "b"), now + chrono::Duration::milliseconds(1));
        let second = JobRun::from_new(&NewJob::new(owner, "c"), now + chrono::Duration::milliseconds(2));
        for job in [&later, &first, &second] {
            tx.insert_job(job).await.unwrap();
        }
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let claimed = tx.claim_next_runnable(&params()).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.locked_at, Some(tx.now()));
        let claimed = tx.claim_next_runnable(&params()).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
        assert!(tx.claim_next_runnable(&params()).await.unwrap().is_none());
        tx.commit().await.unwrap();

        clock.advance_std(Duration::from_secs(31));
        let mut tx = store.begin().await.unwrap();
        let claimed = tx.claim_next_runnable(&params()).await.unwrap().unwrap();
        assert_eq!(claimed.id, later.id);
    }

    #[tokio::test]
    async fn failed_rows_wait_for_backoff() {
        let (store, clock) = store_with_clock();
        let owner = UserId::new();

        let mut tx = store.begin().await.unwrap();
        let mut job = JobRun::from_new(&NewJob::new(owner, "build"), tx.now());
        job.status = JobStatus::Failed;
        job.attempts = 2;
        job.retryable = true;
        job.error = "boom".into();
        job.last_error_at = Some(tx.now());
        tx.insert_job(&job).await.unwrap();
        tx.commit().await.unwrap();

        // Two attempts so far: 1.5 s backoff.
        clock.advance_std(Duration::from_millis(1400));
        let mut tx = store.begin().await.unwrap();
        assert!(tx.claim_next_runnable(&params()).await.unwrap().is_none());
        drop(tx);

        clock.advance_std(Duration::from_millis(200));
        let mut tx = store.begin().await.unwrap();
        let claimed = tx.claim_next_runnable(&params()).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 3);
        assert!(claimed.error.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_only_renews_running_rows() {
        let store = InMemoryStore::new();
        let owner = UserId::new();

        let mut tx = store.begin().await.unwrap();
        let job = JobRun::from_new(&NewJob::new(owner, "build"), tx.now());
        tx.insert_job(&job).await.unwrap();
        assert!(job.lease().is_none());
        let claimed = tx.claim_next_runnable(&params()).await.unwrap().unwrap();
        let lease = claimed.lease().unwrap();
        assert!(tx.touch_heartbeat(&lease).await.unwrap());
        assert!(!tx.touch_heartbeat(&Lease { owner: UserId::new(), ..lease }).await.unwrap());
        assert!(!tx.touch_heartbeat(&Lease { attempt: lease.attempt + 1, ..lease }).await.unwrap());

        let mut done = claimed.clone();
        JobPatch::new().status(JobStatus::Succeeded).apply(&mut done, tx.now());
        tx.update_job(&done, None).await.unwrap();
        assert!(!tx.touch_heartbeat(&lease).await.unwrap());
    }

    #[tokio::test]
    async fn rows_of_other_owners_are_invisible() {
        let store = InMemoryStore::new();
        let owner = UserId::new();
        let mut tx = store.begin().await.unwrap();
        let job = JobRun::from_new(&NewJob::new(owner, "build"), tx.now());
        tx.insert_job(&job).await.unwrap();

        assert!(tx.get_job(owner, job.id).await.unwrap().is_some());
        assert!(tx.get_job(UserId::new(), job.id).await.unwrap().is_none());
        assert!(tx.get_jobs(UserId::new(), &[job.id]).await.unwrap().is_empty());
    }
}
