//! Core job types: the persisted job row and the shapes used to create and patch it.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courseforge_core::{CoreError, EntityId, JobId, UserId};

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Queued,
    /// Claimed by a worker holding the lease.
    Running,
    /// Parked on a waitpoint until a decision is submitted.
    WaitingUser,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Statuses that make a row count as the singleton-runnable for its entity.
    pub const NON_TERMINAL: [JobStatus; 3] =
        [JobStatus::Queued, JobStatus::Running, JobStatus::WaitingUser];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Only canceled and failed jobs may be restarted.
    pub fn is_restartable(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::WaitingUser => "waiting_user",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "waiting_user" => Ok(JobStatus::WaitingUser),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(CoreError::invalid_argument(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of persistent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: JobId,
    pub owner_user_id: UserId,
    pub job_type: String,
    /// May be empty for jobs not tied to an entity.
    pub entity_type: String,
    pub entity_id: Option<EntityId>,
    pub status: JobStatus,
    pub stage: String,
    /// 0..=100.
    pub progress: i32,
    /// Incremented exactly once per claim.
    pub attempts: i32,
    pub error: String,
    /// Whether a `failed` row may be picked up again by the claimer.
    pub retryable: bool,
    /// Start of the current lease; set iff `status = running`.
    pub locked_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    /// A queued row is not claimable before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub payload: JsonValue,
    pub result: JsonValue,
    /// Bumped on every write; consumers dedupe notifications on `(id, version)`.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl JobRun {
    /// Build a fresh `queued` row from a creation request.
    pub fn from_new(new: &NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            owner_user_id: new.owner_user_id,
            job_type: new.job_type.clone(),
            entity_type: new.entity_type.clone(),
            entity_id: new.entity_id,
            status: JobStatus::Queued,
            stage: JobStatus::Queued.as_str().to_string(),
            progress: 0,
            attempts: 0,
            error: String::new(),
            retryable: false,
            locked_at: None,
            heartbeat_at: None,
            last_error_at: None,
            scheduled_at: new.scheduled_at,
            payload: new.payload.clone(),
            result: JsonValue::Null,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Whether this row occupies the singleton slot of `(owner, entity, job_type)`.
    pub fn is_runnable(&self) -> bool {
        !self.status.is_terminal() && self.deleted_at.is_none()
    }

    /// Whether `other` targets the same `(owner, entity_type, entity_id, job_type)` slot.
    pub fn same_slot(&self, other: &JobRun) -> bool {
        self.owner_user_id == other.owner_user_id
            && self.entity_type == other.entity_type
            && self.entity_id == other.entity_id
            && self.job_type == other.job_type
    }

    /// Record a write: bump the version and `updated_at`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }

    /// Serialized row used as notification payload.
    pub fn to_payload(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    /// The lease of the current claim, if the row is running under one.
    pub fn lease(&self) -> Option<Lease> {
        if self.status != JobStatus::Running {
            return None;
        }
        self.locked_at.map(|locked_at| Lease {
            owner: self.owner_user_id,
            job_id: self.id,
            attempt: self.attempts,
            locked_at,
        })
    }
}

/// Fencing token of one claim.
///
/// A reclaim after a stale lease bumps `attempts` and resets `locked_at`, so
/// the previous holder's lease stops matching the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: UserId,
    pub job_id: JobId,
    pub attempt: i32,
    pub locked_at: DateTime<Utc>,
}

impl Lease {
    /// Whether `job` is still running under this lease.
    pub fn holds(&self, job: &JobRun) -> bool {
        job.id == self.job_id
            && job.owner_user_id == self.owner
            && job.status == JobStatus::Running
            && job.attempts == self.attempt
            && job.locked_at == Some(self.locked_at)
    }
}

/// Caller-supplied idempotency key for an enqueue.
///
/// The full scope is `(owner, entity_id, operation, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub operation: String,
    pub key: String,
}

impl IdempotencyKey {
    pub fn new(operation: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            key: key.into(),
        }
    }
}

/// Persisted mapping from an idempotency scope to the id it originally produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub owner_user_id: UserId,
    pub entity_id: Option<EntityId>,
    pub operation: String,
    pub key: String,
    pub target_id: uuid::Uuid,
    pub created_at: DateTime<Utc>,
}

/// Request to create a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub owner_user_id: UserId,
    pub job_type: String,
    pub entity_type: String,
    pub entity_id: Option<EntityId>,
    pub payload: JsonValue,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub idempotency: Option<IdempotencyKey>,
}

impl NewJob {
    pub fn new(owner_user_id: UserId, job_type: impl Into<String>) -> Self {
        Self {
            owner_user_id,
            job_type: job_type.into(),
            entity_type: String::new(),
            entity_id: None,
            payload: JsonValue::Object(Default::default()),
            scheduled_at: None,
            idempotency: None,
        }
    }

    pub fn for_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<EntityId>) -> Self {
        self.entity_type = entity_type.into();
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_idempotency(mut self, key: IdempotencyKey) -> Self {
        self.idempotency = Some(key);
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.owner_user_id.as_uuid().is_nil() {
            return Err(CoreError::invalid_argument("owner is required"));
        }
        if self.job_type.trim().is_empty() {
            return Err(CoreError::invalid_argument("job_type is required"));
        }
        if self.entity_id.is_some() && self.entity_type.trim().is_empty() {
            return Err(CoreError::invalid_argument(
                "entity_type is required when entity_id is set",
            ));
        }
        if let Some(key) = &self.idempotency {
            if key.key.trim().is_empty() || key.operation.trim().is_empty() {
                return Err(CoreError::invalid_argument(
                    "idempotency operation and key must be non-empty",
                ));
            }
        }
        Ok(())
    }
}

/// Timestamp update carried by a [`JobPatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    /// The store's current time.
    Now,
    Clear,
    At(DateTime<Utc>),
}

impl Stamp {
    fn resolve(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Stamp::Now => Some(now),
            Stamp::Clear => None,
            Stamp::At(at) => Some(at),
        }
    }
}

/// Partial update of a job row (`update_fields`).
///
/// With `expect_status` set the update is a compare-and-set on `status`;
/// with `lease` set it only applies while that claim still holds the row.
/// Otherwise it applies unconditionally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub expect_status: Option<JobStatus>,
    pub lease: Option<Lease>,
    pub status: Option<JobStatus>,
    pub stage: Option<String>,
    pub progress: Option<i32>,
    pub error: Option<String>,
    pub retryable: Option<bool>,
    pub locked_at: Option<Stamp>,
    pub heartbeat_at: Option<Stamp>,
    pub last_error_at: Option<Stamp>,
    pub scheduled_at: Option<Stamp>,
    pub result: Option<JsonValue>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(mut self, status: JobStatus) -> Self {
        self.expect_status = Some(status);
        self
    }

    /// Require the row to still be held by `lease`.
    pub fn held_by(mut self, lease: Lease) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn progress(mut self, progress: i32) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn locked_at(mut self, stamp: Stamp) -> Self {
        self.locked_at = Some(stamp);
        self
    }

    pub fn heartbeat(mut self) -> Self {
        self.heartbeat_at = Some(Stamp::Now);
        self
    }

    pub fn last_error_at(mut self, stamp: Stamp) -> Self {
        self.last_error_at = Some(stamp);
        self
    }

    pub fn scheduled_at(mut self, stamp: Stamp) -> Self {
        self.scheduled_at = Some(stamp);
        self
    }

    pub fn result(mut self, result: JsonValue) -> Self {
        self.result = Some(result);
        self
    }

    /// Whether the patch may be applied to `job` (compare-and-set precondition).
    pub fn matches(&self, job: &JobRun) -> bool {
        self.expect_status.is_none_or(|s| s == job.status) && self.lease.is_none_or(|l| l.holds(job))
    }

    /// Apply the patch in place. Progress never moves backwards while the job
    /// stays `running`; it is clamped to 0..=100.
    pub fn apply(&self, job: &mut JobRun, now: DateTime<Utc>) {
        let was_running = job.status == JobStatus::Running;
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(stage) = &self.stage {
            job.stage = stage.clone();
        }
        if let Some(progress) = self.progress {
            let progress = progress.clamp(0, 100);
            job.progress = if was_running && job.status == JobStatus::Running {
                job.progress.max(progress)
            } else {
                progress
            };
        }
        if let Some(error) = &self.error {
            job.error = error.clone();
        }
        if let Some(retryable) = self.retryable {
            job.retryable = retryable;
        }
        if let Some(stamp) = self.locked_at {
            job.locked_at = stamp.resolve(now);
        }
        if let Some(stamp) = self.heartbeat_at {
            job.heartbeat_at = stamp.resolve(now);
        }
        if let Some(stamp) = self.last_error_at {
            job.last_error_at = stamp.resolve(now);
        }
        if let Some(stamp) = self.scheduled_at {
            job.scheduled_at = stamp.resolve(now);
        }
        if let Some(result) = &self.result {
            job.result = result.clone();
        }
        if job.status != JobStatus::Running {
            job.locked_at = None;
        }
        job.touch(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_job() -> JobRun {
        let now = Utc::now();
        let mut job = JobRun::from_new(&NewJob::new(UserId::new(), "build"), now);
        job.status = JobStatus::Running;
        job.locked_at = Some(now);
        job.heartbeat_at = Some(now);
        job.progress = 40;
        job
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::WaitingUser,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            assert_eq!(s.as_str().parse::<JobStatus>().unwrap(), s);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn new_job_requires_owner_and_type() {
        let blank_type = NewJob::new(UserId::new(), "  ");
        assert!(matches!(blank_type.validate(), Err(CoreError::InvalidArgument(_))));

        let nil_owner = NewJob::new(UserId::from_uuid(uuid::Uuid::nil()), "build");
        assert!(matches!(nil_owner.validate(), Err(CoreError::InvalidArgument(_))));

        assert!(NewJob::new(UserId::new(), "build").validate().is_ok());
    }

    #[test]
    fn progress_is_monotonic_while_running() {
        let mut job = running_job();
        let now = Utc::now();

        JobPatch::new().progress(20).apply(&mut job, now);
        assert_eq!(job.progress, 40);

        JobPatch::new().progress(75).apply(&mut job, now);
        assert_eq!(job.progress, 75);

        JobPatch::new().progress(250).apply(&mut job, now);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn leaving_running_clears_the_lease() {
        let mut job = running_job();
        let version = job.version;

        JobPatch::new()
            .expect(JobStatus::Running)
            .status(JobStatus::Canceled)
            .apply(&mut job, Utc::now());

        assert_eq!(job.status, JobStatus::Canceled);
        assert!(job.locked_at.is_none());
        assert_eq!(job.version, version + 1);
    }

    #[test]
    fn cas_precondition_checks_expected_status() {
        let job = running_job();
        assert!(JobPatch::new().expect(JobStatus::Running).matches(&job));
        assert!(!JobPatch::new().expect(JobStatus::Queued).matches(&job));
        assert!(JobPatch::new().matches(&job));
    }

    #[test]
    fn lease_only_holds_for_the_claim_that_took_it() {
        let mut job = running_job();
        job.attempts = 1;
        let lease = job.lease().unwrap();
        assert!(lease.holds(&job));
        assert!(JobPatch::new().held_by(lease).matches(&job));

        // Reclaimed after a stale lease: new attempt, new lock time.
        let mut reclaimed = job.clone();
        reclaimed.attempts = 2;
        reclaimed.locked_at = Some(lease.locked_at + chrono::Duration::seconds(121));
        assert!(!lease.holds(&reclaimed));
        assert!(!JobPatch::new().expect(JobStatus::Running).held_by(lease).matches(&reclaimed));

        let mut queued = job.clone();
        JobPatch::new().status(JobStatus::Queued).apply(&mut queued, Utc::now());
        assert!(queued.lease().is_none());
        assert!(!lease.holds(&queued));
    }
}
