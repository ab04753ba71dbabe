//! Postgres-backed store.
//!
//! ## Error mapping
//!
//! | SQLx error | SQLSTATE | StoreError |
//! |---|---|---|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Unavailable` |
//! | Database (other) | any | `Unavailable` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` |
//! | ColumnDecode / Decode | N/A | `Corrupt` |
//!
//! ## Locking
//!
//! `lock_*` methods read with `SELECT ... FOR UPDATE`. The claimer uses
//! `FOR UPDATE SKIP LOCKED` so competing workers never block on each other.
//! The singleton-runnable invariant is the partial unique index
//! `job_run_singleton_runnable_idx`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use courseforge_core::{
    EntityId, JobId, MessageId, SagaActionId, SagaId, ThreadId, TurnId, UserId,
};

use super::{ChatTx, ClaimParams, JobTx, SagaTx, Store, StoreError, StoreTx};
use crate::chat::{ChatMessage, ChatThread, ChatTurn};
use crate::jobs::{IdempotencyRecord, JobRun, JobStatus, Lease};
use crate::saga::{ActionStatus, SagaAction, SagaRun, SagaStatus};

const SCHEMA: &str = include_str!("../../migrations/0001_core.sql");

const JOB_COLUMNS: &str = "id, owner_user_id, job_type, entity_type, entity_id, status, stage, \
     progress, attempts, error, retryable, locked_at, heartbeat_at, last_error_at, scheduled_at, \
     payload, result, version, created_at, updated_at, deleted_at";

const MESSAGE_COLUMNS: &str = "id, thread_id, owner_user_id, seq, role, content, status, \
     idempotency_key, created_at, updated_at, deleted_at";

/// Store backed by a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("apply_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        // Transaction start time: stable for the whole transaction.
        let now: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(PgTx { tx, now })
    }
}

/// Open Postgres transaction.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
    now: DateTime<Utc>,
}

impl std::fmt::Debug for PgTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTx").field("now", &self.now).finish()
    }
}

#[async_trait]
impl StoreTx for PgTx {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
    }
}

#[async_trait]
impl JobTx for PgTx {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    async fn insert_job(&mut self, job: &JobRun) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO job_run ({JOB_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)"
        );
        sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(job.owner_user_id.as_uuid())
            .bind(&job.job_type)
            .bind(&job.entity_type)
            .bind(job.entity_id.map(|e| *e.as_uuid()))
            .bind(job.status.as_str())
            .bind(&job.stage)
            .bind(job.progress)
            .bind(job.attempts)
            .bind(&job.error)
            .bind(job.retryable)
            .bind(job.locked_at)
            .bind(job.heartbeat_at)
            .bind(job.last_error_at)
            .bind(job.scheduled_at)
            .bind(&job.payload)
            .bind(&job.result)
            .bind(job.version)
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.deleted_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(())
    }

    async fn get_job(&mut self, owner: UserId, id: JobId) -> Result<Option<JobRun>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_run \
             WHERE id = $1 AND owner_user_id = $2 AND deleted_at IS NULL"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(owner.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_jobs(&mut self, owner: UserId, ids: &[JobId]) -> Result<Vec<JobRun>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_run \
             WHERE id = ANY($1) AND owner_user_id = $2 AND deleted_at IS NULL \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(&ids)
            .bind(owner.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("get_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn lock_job(&mut self, owner: UserId, id: JobId) -> Result<Option<JobRun>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_run \
             WHERE id = $1 AND owner_user_id = $2 AND deleted_at IS NULL \
             FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(owner.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status, expected = ?expected), err)]
    async fn update_job(&mut self, job: &JobRun, expected: Option<JobStatus>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_run SET
                status = $3,
                stage = $4,
                progress = $5,
                attempts = $6,
                error = $7,
                retryable = $8,
                locked_at = $9,
                heartbeat_at = $10,
                last_error_at = $11,
                scheduled_at = $12,
                payload = $13,
                result = $14,
                version = $15,
                updated_at = $16,
                deleted_at = $17
            WHERE id = $1 AND owner_user_id = $2
              AND ($18::text IS NULL OR status = $18)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.owner_user_id.as_uuid())
        .bind(job.status.as_str())
        .bind(&job.stage)
        .bind(job.progress)
        .bind(job.attempts)
        .bind(&job.error)
        .bind(job.retryable)
        .bind(job.locked_at)
        .bind(job.heartbeat_at)
        .bind(job.last_error_at)
        .bind(job.scheduled_at)
        .bind(&job.payload)
        .bind(&job.result)
        .bind(job.version)
        .bind(job.updated_at)
        .bind(job.deleted_at)
        .bind(expected.map(|s| s.as_str()))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, params), err)]
    async fn claim_next_runnable(&mut self, params: &ClaimParams) -> Result<Option<JobRun>, StoreError> {
        let returning = JOB_COLUMNS
            .split(", ")
            .map(|c| format!("j.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            WITH candidate AS (
                SELECT c.id
                FROM job_run c
                WHERE c.deleted_at IS NULL
                  AND (
                        (c.status = 'queued' AND (c.scheduled_at IS NULL OR c.scheduled_at <= $1))
                     OR (c.status = 'running'
                         AND (c.heartbeat_at IS NULL OR c.heartbeat_at < $1 - make_interval(secs => $2)))
                     OR (c.status = 'failed'
                         AND c.retryable
                         AND c.attempts < $3
                         AND (c.last_error_at IS NULL OR c.last_error_at + make_interval(secs =>
                                CASE WHEN c.attempts <= 0 THEN 0
                                     ELSE LEAST($4 * power(2, c.attempts - 1), $5) END) <= $1)
                         AND NOT EXISTS (
                             SELECT 1 FROM job_run s
                             WHERE s.id <> c.id
                               AND s.owner_user_id = c.owner_user_id
                               AND s.entity_type = c.entity_type
                               AND s.entity_id = c.entity_id
                               AND s.job_type = c.job_type
                               AND s.status IN ('queued', 'running', 'waiting_user')
                               AND s.deleted_at IS NULL))
                  )
                ORDER BY c.created_at ASC, c.id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job_run j SET
                status = 'running',
                locked_at = $1,
                heartbeat_at = $1,
                scheduled_at = NULL,
                attempts = j.attempts + 1,
                error = CASE WHEN j.status = 'failed' THEN '' ELSE j.error END,
                version = j.version + 1,
                updated_at = $1
            FROM candidate
            WHERE j.id = candidate.id
            RETURNING {returning}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(self.now)
            .bind(params.stale_lease.as_secs_f64())
            .bind(params.retry.max_attempts as i32)
            .bind(params.retry.base_delay.as_secs_f64())
            .bind(params.retry.max_delay.as_secs_f64())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("claim_next_runnable", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn touch_heartbeat(&mut self, lease: &Lease) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE job_run SET heartbeat_at = $3, updated_at = $3 \
             WHERE id = $1 AND owner_user_id = $2 AND status = 'running' \
             AND attempts = $4 AND locked_at = $5",
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.owner.as_uuid())
        .bind(self.now)
        .bind(lease.attempt)
        .bind(lease.locked_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("touch_heartbeat", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_runnable_for_entity(
        &mut self,
        owner: UserId,
        entity_type: &str,
        entity_id: Option<EntityId>,
        job_type: &str,
    ) -> Result<Option<JobRun>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_run \
             WHERE owner_user_id = $1 AND entity_type = $2 \
               AND entity_id IS NOT DISTINCT FROM $3 AND job_type = $4 \
               AND status IN ('queued', 'running', 'waiting_user') AND deleted_at IS NULL \
             ORDER BY created_at ASC, id ASC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(owner.as_uuid())
            .bind(entity_type)
            .bind(entity_id.map(|e| *e.as_uuid()))
            .bind(job_type)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("find_runnable_for_entity", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn latest_for_entity(
        &mut self,
        owner: UserId,
        entity_type: &str,
        entity_id: Option<EntityId>,
        job_type: &str,
    ) -> Result<Option<JobRun>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_run \
             WHERE owner_user_id = $1 AND entity_type = $2 \
               AND entity_id IS NOT DISTINCT FROM $3 AND job_type = $4 AND deleted_at IS NULL \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(owner.as_uuid())
            .bind(entity_type)
            .bind(entity_id.map(|e| *e.as_uuid()))
            .bind(job_type)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("latest_for_entity", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_active(&mut self, owner: UserId, limit: i64) -> Result<Vec<JobRun>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_run \
             WHERE owner_user_id = $1 AND status IN ('queued', 'running', 'waiting_user') \
               AND deleted_at IS NULL \
             ORDER BY created_at ASC, id ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(owner.as_uuid())
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("list_active", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn insert_idempotency(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<Option<Uuid>, StoreError> {
        let entity = record.entity_id.map(|e| *e.as_uuid()).unwrap_or(Uuid::nil());
        let inserted = sqlx::query(
            "INSERT INTO idempotency_key (owner_user_id, entity_id, operation, key, target_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING",
        )
        .bind(record.owner_user_id.as_uuid())
        .bind(entity)
        .bind(&record.operation)
        .bind(&record.key)
        .bind(record.target_id)
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_idempotency", e))?;

        if inserted.rows_affected() == 1 {
            return Ok(None);
        }
        self.get_idempotency(record.owner_user_id, record.entity_id, &record.operation, &record.key)
            .await
    }

    async fn get_idempotency(
        &mut self,
        owner: UserId,
        entity_id: Option<EntityId>,
        operation: &str,
        key: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        let entity = entity_id.map(|e| *e.as_uuid()).unwrap_or(Uuid::nil());
        sqlx::query_scalar(
            "SELECT target_id FROM idempotency_key \
             WHERE owner_user_id = $1 AND entity_id = $2 AND operation = $3 AND key = $4",
        )
        .bind(owner.as_uuid())
        .bind(entity)
        .bind(operation)
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("get_idempotency", e))
    }
}

#[async_trait]
impl SagaTx for PgTx {
    #[instrument(skip(self, saga), fields(saga_id = %saga.id, root_job_id = %saga.root_job_id), err)]
    async fn insert_saga(&mut self, saga: &SagaRun) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO saga_run (id, owner_user_id, root_job_id, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(saga.id.as_uuid())
        .bind(saga.owner_user_id.as_uuid())
        .bind(saga.root_job_id.as_uuid())
        .bind(saga.status.as_str())
        .bind(saga.created_at)
        .bind(saga.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_saga", e))?;
        Ok(())
    }

    async fn saga_by_root_job(&mut self, owner: UserId, root_job_id: JobId) -> Result<Option<SagaRun>, StoreError> {
        let row = sqlx::query(
            "SELECT id, owner_user_id, root_job_id, status, created_at, updated_at FROM saga_run \
             WHERE owner_user_id = $1 AND root_job_id = $2",
        )
        .bind(owner.as_uuid())
        .bind(root_job_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("saga_by_root_job", e))?;
        row.as_ref().map(saga_from_row).transpose()
    }

    async fn get_saga(&mut self, owner: UserId, id: SagaId) -> Result<Option<SagaRun>, StoreError> {
        let row = sqlx::query(
            "SELECT id, owner_user_id, root_job_id, status, created_at, updated_at FROM saga_run \
             WHERE owner_user_id = $1 AND id = $2",
        )
        .bind(owner.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("get_saga", e))?;
        row.as_ref().map(saga_from_row).transpose()
    }

    async fn lock_saga(&mut self, owner: UserId, id: SagaId) -> Result<Option<SagaRun>, StoreError> {
        let row = sqlx::query(
            "SELECT id, owner_user_id, root_job_id, status, created_at, updated_at FROM saga_run \
             WHERE owner_user_id = $1 AND id = $2 FOR UPDATE",
        )
        .bind(owner.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_saga", e))?;
        row.as_ref().map(saga_from_row).transpose()
    }

    async fn update_saga_status(
        &mut self,
        owner: UserId,
        id: SagaId,
        status: SagaStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE saga_run SET status = $3, updated_at = $4 WHERE owner_user_id = $1 AND id = $2",
        )
        .bind(owner.as_uuid())
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(self.now)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_saga_status", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn max_action_seq(&mut self, saga_id: SagaId) -> Result<i64, StoreError> {
        sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0)::BIGINT FROM saga_action WHERE saga_id = $1")
            .bind(saga_id.as_uuid())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("max_action_seq", e))
    }

    #[instrument(skip(self, action), fields(saga_id = %action.saga_id, seq = action.seq, kind = %action.kind), err)]
    async fn insert_action(&mut self, action: &SagaAction) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO saga_action (id, saga_id, seq, kind, payload, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(action.id.as_uuid())
        .bind(action.saga_id.as_uuid())
        .bind(action.seq)
        .bind(&action.kind)
        .bind(&action.payload)
        .bind(action.status.as_str())
        .bind(action.created_at)
        .bind(action.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_action", e))?;
        Ok(())
    }

    async fn list_actions_desc(&mut self, saga_id: SagaId) -> Result<Vec<SagaAction>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, saga_id, seq, kind, payload, status, created_at, updated_at FROM saga_action \
             WHERE saga_id = $1 ORDER BY seq DESC",
        )
        .bind(saga_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_actions_desc", e))?;
        rows.iter().map(action_from_row).collect()
    }

    async fn update_action_status(
        &mut self,
        id: SagaActionId,
        from: ActionStatus,
        to: ActionStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE saga_action SET status = $3, updated_at = $4 WHERE id = $1 AND status = $2",
        )
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(self.now)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_action_status", e))?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl ChatTx for PgTx {
    async fn insert_thread(&mut self, thread: &ChatThread) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO chat_thread (id, owner_user_id, title, next_seq, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(thread.id.as_uuid())
        .bind(thread.owner_user_id.as_uuid())
        .bind(&thread.title)
        .bind(thread.next_seq)
        .bind(thread.created_at)
        .bind(thread.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_thread", e))?;
        Ok(())
    }

    async fn lock_thread(&mut self, owner: UserId, id: ThreadId) -> Result<Option<ChatThread>, StoreError> {
        let row = sqlx::query(
            "SELECT id, owner_user_id, title, next_seq, created_at, updated_at FROM chat_thread \
             WHERE owner_user_id = $1 AND id = $2 FOR UPDATE",
        )
        .bind(owner.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_thread", e))?;
        row.as_ref().map(thread_from_row).transpose()
    }

    async fn set_thread_next_seq(&mut self, owner: UserId, id: ThreadId, next_seq: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE chat_thread SET next_seq = $3, updated_at = $4 WHERE owner_user_id = $1 AND id = $2",
        )
        .bind(owner.as_uuid())
        .bind(id.as_uuid())
        .bind(next_seq)
        .bind(self.now)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("set_thread_next_seq", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("thread {id}")));
        }
        Ok(())
    }

    async fn insert_message(&mut self, message: &ChatMessage) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO chat_message ({MESSAGE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        );
        sqlx::query(&sql)
            .bind(message.id.as_uuid())
            .bind(message.thread_id.as_uuid())
            .bind(message.owner_user_id.as_uuid())
            .bind(message.seq)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(message.status.as_str())
            .bind(&message.idempotency_key)
            .bind(message.created_at)
            .bind(message.updated_at)
            .bind(message.deleted_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_message", e))?;
        Ok(())
    }

    async fn get_message(&mut self, owner: UserId, id: MessageId) -> Result<Option<ChatMessage>, StoreError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM chat_message WHERE owner_user_id = $1 AND id = $2");
        let row = sqlx::query(&sql)
            .bind(owner.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("get_message", e))?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn find_user_message_by_key(
        &mut self,
        owner: UserId,
        thread_id: ThreadId,
        key: &str,
    ) -> Result<Option<ChatMessage>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_message \
             WHERE owner_user_id = $1 AND thread_id = $2 AND role = 'user' \
               AND idempotency_key = $3 AND deleted_at IS NULL"
        );
        let row = sqlx::query(&sql)
            .bind(owner.as_uuid())
            .bind(thread_id.as_uuid())
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("find_user_message_by_key", e))?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn update_message(&mut self, message: &ChatMessage) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE chat_message SET content = $3, status = $4, updated_at = $5, deleted_at = $6 \
             WHERE owner_user_id = $1 AND id = $2",
        )
        .bind(message.owner_user_id.as_uuid())
        .bind(message.id.as_uuid())
        .bind(&message.content)
        .bind(message.status.as_str())
        .bind(message.updated_at)
        .bind(message.deleted_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_message", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_messages(&mut self, owner: UserId, thread_id: ThreadId) -> Result<Vec<ChatMessage>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_message \
             WHERE owner_user_id = $1 AND thread_id = $2 ORDER BY seq ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(owner.as_uuid())
            .bind(thread_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("list_messages", e))?;
        rows.iter().map(message_from_row).collect()
    }

    async fn insert_turn(&mut self, turn: &ChatTurn) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO chat_turn (id, thread_id, owner_user_id, user_message_id, assistant_message_id, job_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(turn.id.as_uuid())
        .bind(turn.thread_id.as_uuid())
        .bind(turn.owner_user_id.as_uuid())
        .bind(turn.user_message_id.as_uuid())
        .bind(turn.assistant_message_id.as_uuid())
        .bind(turn.job_id.as_uuid())
        .bind(turn.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_turn", e))?;
        Ok(())
    }

    async fn turn_by_user_message(
        &mut self,
        owner: UserId,
        user_message_id: MessageId,
    ) -> Result<Option<ChatTurn>, StoreError> {
        let row = sqlx::query(
            "SELECT id, thread_id, owner_user_id, user_message_id, assistant_message_id, job_id, created_at \
             FROM chat_turn WHERE owner_user_id = $1 AND user_message_id = $2",
        )
        .bind(owner.as_uuid())
        .bind(user_message_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("turn_by_user_message", e))?;
        row.as_ref().map(turn_from_row).transpose()
    }

    async fn turn_by_job(&mut self, owner: UserId, job_id: JobId) -> Result<Option<ChatTurn>, StoreError> {
        let row = sqlx::query(
            "SELECT id, thread_id, owner_user_id, user_message_id, assistant_message_id, job_id, created_at \
             FROM chat_turn WHERE owner_user_id = $1 AND job_id = $2",
        )
        .bind(owner.as_uuid())
        .bind(job_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("turn_by_job", e))?;
        row.as_ref().map(turn_from_row).transpose()
    }
}

/// Map SQLx errors to `StoreError`, classifying by SQLSTATE.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation
                Some("23505") => StoreError::Conflict(msg),
                // Serialization failure / deadlock detected
                Some("40001") | Some("40P01") => StoreError::Unavailable(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("row not found in {operation}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(format!("failed to decode row in {operation}: {err}"))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

fn decode<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("invalid {what}: {value}")))
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Corrupt(format!("column {column}: {e}")))
}

// Row decoding

fn job_from_row(row: &PgRow) -> Result<JobRun, StoreError> {
    let status: String = get(row, "status")?;
    let entity_id: Option<Uuid> = get(row, "entity_id")?;
    Ok(JobRun {
        id: JobId::from_uuid(get(row, "id")?),
        owner_user_id: UserId::from_uuid(get(row, "owner_user_id")?),
        job_type: get(row, "job_type")?,
        entity_type: get(row, "entity_type")?,
        entity_id: entity_id.map(EntityId::from_uuid),
        status: decode::<JobStatus>(&status, "job status")?,
        stage: get(row, "stage")?,
        progress: get(row, "progress")?,
        attempts: get(row, "attempts")?,
        error: get(row, "error")?,
        retryable: get(row, "retryable")?,
        locked_at: get(row, "locked_at")?,
        heartbeat_at: get(row, "heartbeat_at")?,
        last_error_at: get(row, "last_error_at")?,
        scheduled_at: get(row, "scheduled_at")?,
        payload: get(row, "payload")?,
        result: get(row, "result")?,
        version: get(row, "version")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
        deleted_at: get(row, "deleted_at")?,
    })
}

fn saga_from_row(row: &PgRow) -> Result<SagaRun, StoreError> {
    let status: String = get(row, "status")?;
    Ok(SagaRun {
        id: SagaId::from_uuid(get(row, "id")?),
        owner_user_id: UserId::from_uuid(get(row, "owner_user_id")?),
        root_job_id: JobId::from_uuid(get(row, "root_job_id")?),
        status: decode::<SagaStatus>(&status, "saga status")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn action_from_row(row: &PgRow) -> Result<SagaAction, StoreError> {
    let status: String = get(row, "status")?;
    Ok(SagaAction {
        id: SagaActionId::from_uuid(get(row, "id")?),
        saga_id: SagaId::from_uuid(get(row, "saga_id")?),
        seq: get(row, "seq")?,
        kind: get(row, "kind")?,
        payload: get(row, "payload")?,
        status: decode::<ActionStatus>(&status, "saga action status")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn thread_from_row(row: &PgRow) -> Result<ChatThread, StoreError> {
    Ok(ChatThread {
        id: ThreadId::from_uuid(get(row, "id")?),
        owner_user_id: UserId::from_uuid(get(row, "owner_user_id")?),
        title: get(row, "title")?,
        next_seq: get(row, "next_seq")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<ChatMessage, StoreError> {
    let role: String = get(row, "role")?;
    let status: String = get(row, "status")?;
    Ok(ChatMessage {
        id: MessageId::from_uuid(get(row, "id")?),
        thread_id: ThreadId::from_uuid(get(row, "thread_id")?),
        owner_user_id: UserId::from_uuid(get(row, "owner_user_id")?),
        seq: get(row, "seq")?,
        role: decode(&role, "message role")?,
        content: get(row, "content")?,
        status: decode(&status, "message status")?,
        idempotency_key: get(row, "idempotency_key")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
        deleted_at: get(row, "deleted_at")?,
    })
}

fn turn_from_row(row: &PgRow) -> Result<ChatTurn, StoreError> {
    Ok(ChatTurn {
        id: TurnId::from_uuid(get(row, "id")?),
        thread_id: ThreadId::from_uuid(get(row, "thread_id")?),
        owner_user_id: UserId::from_uuid(get(row, "owner_user_id")?),
        user_message_id: MessageId::from_uuid(get(row, "user_message_id")?),
        assistant_message_id: MessageId::from_uuid(get(row, "assistant_message_id")?),
        job_id: JobId::from_uuid(get(row, "job_id")?),
        created_at: get(row, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    //! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`.

    use super::*;
    use crate::jobs::NewJob;
    use crate::saga::SagaRun;

    async fn store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres tests");
        let store = PgStore::connect(&url).await.unwrap();
        store.apply_schema().await.unwrap();
        store
    }

    #[tokio::test]
    #[ignore]
    async fn singleton_index_rejects_second_runnable_job() {
        let store = store().await;
        let owner = UserId::new();
        let new = NewJob::new(owner, "build").for_entity("material", EntityId::new());

        let mut tx = store.begin().await.unwrap();
        tx.insert_job(&JobRun::from_new(&new, tx.now())).await.unwrap();
        let err = tx.insert_job(&JobRun::from_new(&new, tx.now())).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    #[ignore]
    async fn claim_leases_the_oldest_queued_row() {
        let store = store().await;
        let owner = UserId::new();

        let mut tx = store.begin().await.unwrap();
        let job = JobRun::from_new(&NewJob::new(owner, "pg-claim-test"), tx.now());
        tx.insert_job(&job).await.unwrap();
        tx.commit().await.unwrap();

        let params = ClaimParams::from_config(&courseforge_core::CoreConfig::default());
        let mut tx = store.begin().await.unwrap();
        let mut claimed = None;
        while let Some(next) = tx.claim_next_runnable(&params).await.unwrap() {
            if next.id == job.id {
                claimed = Some(next);
                break;
            }
        }
        let claimed = claimed.expect("inserted job should be claimable");
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.locked_at.is_some());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn saga_seq_is_unique_per_saga() {
        let store = store().await;
        let owner = UserId::new();
        let mut tx = store.begin().await.unwrap();
        let saga = SagaRun::new(owner, JobId::new(), tx.now());
        tx.insert_saga(&saga).await.unwrap();
        assert_eq!(tx.max_action_seq(saga.id).await.unwrap(), 0);

        let dup = SagaRun::new(owner, saga.root_job_id, tx.now());
        assert!(matches!(tx.insert_saga(&dup).await, Err(StoreError::Conflict(_))));
    }
}
