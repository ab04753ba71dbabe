//! Durable storage contract.
//!
//! Every mutation happens inside a transaction obtained from [`Store::begin`].
//! A transaction exposes the store's clock via [`StoreTx::now`]; lease and
//! backoff decisions are always taken against that time, never the worker's.
//!
//! Reads and writes are scoped by owner. A row owned by somebody else is
//! indistinguishable from a missing row.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryStore;
pub use postgres::PgStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use courseforge_core::{
    CoreConfig, CoreError, EntityId, JobId, MessageId, RetryPolicy, SagaActionId, SagaId, ThreadId,
    UserId,
};

use crate::chat::{ChatMessage, ChatThread, ChatTurn};
use crate::jobs::{IdempotencyRecord, JobRun, JobStatus, Lease};
use crate::saga::{ActionStatus, SagaAction, SagaRun, SagaStatus};

/// Store-level failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Contention, serialization failure or connectivity; retrying may succeed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A persisted row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for CoreError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(msg) => CoreError::Conflict(msg),
            StoreError::NotFound(_) => CoreError::NotFound,
            StoreError::Unavailable(msg) => CoreError::Transient(msg),
            StoreError::Corrupt(msg) => CoreError::Fatal(msg),
        }
    }
}

/// Parameters of one claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimParams {
    pub retry: RetryPolicy,
    pub stale_lease: Duration,
}

impl ClaimParams {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            retry: config.retry_policy(),
            stale_lease: config.stale_lease,
        }
    }

    /// Backoff required after `attempts` claims before a failed row is eligible again.
    pub fn retry_delay(&self, attempts: i32) -> chrono::Duration {
        let d = self.retry.delay_for_attempt(attempts.max(0) as u32);
        chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
    }

    pub fn stale_lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stale_lease).unwrap_or(chrono::Duration::MAX)
    }

    /// Row-local claim predicate. Does not cover the sibling check on retries,
    /// which needs the rest of the table.
    pub fn is_claimable(&self, job: &JobRun, now: DateTime<Utc>) -> bool {
        if job.deleted_at.is_some() {
            return false;
        }
        match job.status {
            JobStatus::Queued => job.scheduled_at.is_none_or(|at| at <= now),
            JobStatus::Running => job
                .heartbeat_at
                .is_none_or(|hb| hb + self.stale_lease() < now),
            JobStatus::Failed => {
                job.retryable
                    && (job.attempts.max(0) as u32) < self.retry.max_attempts
                    && job
                        .last_error_at
                        .is_none_or(|at| at + self.retry_delay(job.attempts) <= now)
            }
            _ => false,
        }
    }
}

/// Handle to a transactional store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: JobTx + SagaTx + ChatTx + Send;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// One open transaction. Dropping it without commit rolls it back.
#[async_trait]
pub trait StoreTx: Send {
    /// The store's current time, fixed for the lifetime of the transaction.
    fn now(&self) -> DateTime<Utc>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait JobTx: StoreTx {
    /// Insert a new row. Fails with `Conflict` when the row would be a second
    /// non-terminal job for the same `(owner, entity_type, entity_id, job_type)`.
    async fn insert_job(&mut self, job: &JobRun) -> Result<(), StoreError>;

    async fn get_job(&mut self, owner: UserId, id: JobId) -> Result<Option<JobRun>, StoreError>;

    async fn get_jobs(&mut self, owner: UserId, ids: &[JobId]) -> Result<Vec<JobRun>, StoreError>;

    /// Read with a row-level exclusive lock held until the transaction ends.
    async fn lock_job(&mut self, owner: UserId, id: JobId) -> Result<Option<JobRun>, StoreError>;

    /// Write every mutable column of `job`. With `expected` set the write only
    /// happens when the stored status still equals it. Returns whether a row changed.
    async fn update_job(&mut self, job: &JobRun, expected: Option<JobStatus>) -> Result<bool, StoreError>;

    /// Atomically pick and lease the oldest claimable row.
    async fn claim_next_runnable(&mut self, params: &ClaimParams) -> Result<Option<JobRun>, StoreError>;

    /// Renew the lease. Returns false when the row is no longer held by `lease`.
    async fn touch_heartbeat(&mut self, lease: &Lease) -> Result<bool, StoreError>;

    async fn find_runnable_for_entity(
        &mut self,
        owner: UserId,
        entity_type: &str,
        entity_id: Option<EntityId>,
        job_type: &str,
    ) -> Result<Option<JobRun>, StoreError>;

    /// Newest row regardless of status, by `created_at DESC, id DESC`.
    async fn latest_for_entity(
        &mut self,
        owner: UserId,
        entity_type: &str,
        entity_id: Option<EntityId>,
        job_type: &str,
    ) -> Result<Option<JobRun>, StoreError>;

    /// Non-terminal rows of `owner`, oldest first.
    async fn list_active(&mut self, owner: UserId, limit: i64) -> Result<Vec<JobRun>, StoreError>;

    /// Insert-or-nothing. Returns the previously stored target id on conflict.
    async fn insert_idempotency(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<Option<uuid::Uuid>, StoreError>;

    async fn get_idempotency(
        &mut self,
        owner: UserId,
        entity_id: Option<EntityId>,
        operation: &str,
        key: &str,
    ) -> Result<Option<uuid::Uuid>, StoreError>;
}

#[async_trait]
pub trait SagaTx: StoreTx {
    /// Fails with `Conflict` when a saga already exists for the root job.
    async fn insert_saga(&mut self, saga: &SagaRun) -> Result<(), StoreError>;

    async fn saga_by_root_job(&mut self, owner: UserId, root_job_id: JobId) -> Result<Option<SagaRun>, StoreError>;

    async fn get_saga(&mut self, owner: UserId, id: SagaId) -> Result<Option<SagaRun>, StoreError>;

    /// Row lock on the saga; serializes seq assignment.
    async fn lock_saga(&mut self, owner: UserId, id: SagaId) -> Result<Option<SagaRun>, StoreError>;

    async fn update_saga_status(
        &mut self,
        owner: UserId,
        id: SagaId,
        status: SagaStatus,
    ) -> Result<bool, StoreError>;

    /// 0 when the saga has no actions.
    async fn max_action_seq(&mut self, saga_id: SagaId) -> Result<i64, StoreError>;

    async fn insert_action(&mut self, action: &SagaAction) -> Result<(), StoreError>;

    async fn list_actions_desc(&mut self, saga_id: SagaId) -> Result<Vec<SagaAction>, StoreError>;

    /// Compare-and-set on action status.
    async fn update_action_status(
        &mut self,
        id: SagaActionId,
        from: ActionStatus,
        to: ActionStatus,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait ChatTx: StoreTx {
    async fn insert_thread(&mut self, thread: &ChatThread) -> Result<(), StoreError>;

    /// Row lock on the thread; serializes seq assignment.
    async fn lock_thread(&mut self, owner: UserId, id: ThreadId) -> Result<Option<ChatThread>, StoreError>;

    async fn set_thread_next_seq(&mut self, owner: UserId, id: ThreadId, next_seq: i64) -> Result<(), StoreError>;

    /// Fails with `Conflict` on a duplicate `(thread, seq)` or user idempotency key.
    async fn insert_message(&mut self, message: &ChatMessage) -> Result<(), StoreError>;

    async fn get_message(&mut self, owner: UserId, id: MessageId) -> Result<Option<ChatMessage>, StoreError>;

    /// Live user message of `thread` carrying `key`.
    async fn find_user_message_by_key(
        &mut self,
        owner: UserId,
        thread_id: ThreadId,
        key: &str,
    ) -> Result<Option<ChatMessage>, StoreError>;

    async fn update_message(&mut self, message: &ChatMessage) -> Result<bool, StoreError>;

    /// Messages of a thread by seq, soft-deleted ones included.
    async fn list_messages(&mut self, owner: UserId, thread_id: ThreadId) -> Result<Vec<ChatMessage>, StoreError>;

    async fn insert_turn(&mut self, turn: &ChatTurn) -> Result<(), StoreError>;

    async fn turn_by_user_message(
        &mut self,
        owner: UserId,
        user_message_id: MessageId,
    ) -> Result<Option<ChatTurn>, StoreError>;

    async fn turn_by_job(&mut self, owner: UserId, job_id: JobId) -> Result<Option<ChatTurn>, StoreError>;
}
