//! Saga rows and the closed set of compensating action kinds.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courseforge_core::{CoreError, JobId, SagaActionId, SagaId, UserId};

use crate::adapters::ObjectCategory;

/// Saga lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Running,
    Succeeded,
    Failed,
    Compensating,
    Compensated,
}

impl SagaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Running => "running",
            SagaStatus::Succeeded => "succeeded",
            SagaStatus::Failed => "failed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
        }
    }

    /// Allowed lifecycle moves. Re-entering `compensating` from `compensated`
    /// is permitted so that compensation can be re-invoked safely. A restarted
    /// root job brings its saga back to `running` from `failed`, `compensated`,
    /// or `compensating` when a crash interrupted compensation.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (self, next),
            (Running, Succeeded)
                | (Running, Failed)
                | (Running, Compensating)
                | (Failed, Compensating)
                | (Compensating, Compensating)
                | (Compensating, Compensated)
                | (Compensated, Compensating)
                | (Failed, Running)
                | (Compensating, Running)
                | (Compensated, Running)
        )
    }
}

impl FromStr for SagaStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SagaStatus::Running),
            "succeeded" => Ok(SagaStatus::Succeeded),
            "failed" => Ok(SagaStatus::Failed),
            "compensating" => Ok(SagaStatus::Compensating),
            "compensated" => Ok(SagaStatus::Compensated),
            other => Err(CoreError::invalid_argument(format!(
                "unknown saga status: {other}"
            ))),
        }
    }
}

/// Compensation context bound to exactly one root job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaRun {
    pub id: SagaId,
    pub owner_user_id: UserId,
    pub root_job_id: JobId,
    pub status: SagaStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaRun {
    pub fn new(owner_user_id: UserId, root_job_id: JobId, now: DateTime<Utc>) -> Self {
        Self {
            id: SagaId::new(),
            owner_user_id,
            root_job_id,
            status: SagaStatus::Running,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Status of one compensating action. Moves only `pending -> done|failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Done,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Done => "done",
            ActionStatus::Failed => "failed",
        }
    }
}

impl FromStr for ActionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "done" => Ok(ActionStatus::Done),
            "failed" => Ok(ActionStatus::Failed),
            other => Err(CoreError::invalid_argument(format!(
                "unknown saga action status: {other}"
            ))),
        }
    }
}

/// A side-effect already performed, with the data needed to undo it.
///
/// Tagged on `kind`; the payload shape is determined by the kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Compensation {
    ObjectDeleteKey {
        category: ObjectCategory,
        key: String,
    },
    ObjectDeletePrefix {
        category: ObjectCategory,
        prefix: String,
    },
    VectorDeleteIds {
        namespace: String,
        ids: Vec<String>,
    },
}

impl Compensation {
    pub const OBJECT_DELETE_KEY: &'static str = "object_delete_key";
    pub const OBJECT_DELETE_PREFIX: &'static str = "object_delete_prefix";
    pub const VECTOR_DELETE_IDS: &'static str = "vector_delete_ids";

    /// Map legacy kind names onto the canonical ones. Unknown kinds pass through.
    pub fn normalize_kind(kind: &str) -> &str {
        match kind {
            "object_delete" => Self::OBJECT_DELETE_KEY,
            "pinecone_delete_ids" | "vector_delete" => Self::VECTOR_DELETE_IDS,
            other => other,
        }
    }

    /// Parse a persisted `(kind, payload)` pair. Unknown kinds and malformed
    /// payloads are fatal: the action can never be executed.
    pub fn from_parts(kind: &str, payload: &JsonValue) -> Result<Self, CoreError> {
        let kind = Self::normalize_kind(kind);
        match kind {
            Self::OBJECT_DELETE_KEY | Self::OBJECT_DELETE_PREFIX | Self::VECTOR_DELETE_IDS => {}
            other => {
                return Err(CoreError::fatal(format!(
                    "unknown saga action kind: {other}"
                )));
            }
        }

        let tagged = serde_json::json!({ "kind": kind, "payload": payload });
        let parsed: Compensation = serde_json::from_value(tagged).map_err(|e| {
            CoreError::fatal(format!("malformed payload for saga action {kind}: {e}"))
        })?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<(), CoreError> {
        let empty = match self {
            Compensation::ObjectDeleteKey { key, .. } => key.is_empty(),
            Compensation::ObjectDeletePrefix { prefix, .. } => prefix.is_empty(),
            Compensation::VectorDeleteIds { namespace, .. } => namespace.is_empty(),
        };
        if empty {
            return Err(CoreError::fatal(format!(
                "saga action {} has an empty target",
                self.kind()
            )));
        }
        Ok(())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Compensation::ObjectDeleteKey { .. } => Self::OBJECT_DELETE_KEY,
            Compensation::ObjectDeletePrefix { .. } => Self::OBJECT_DELETE_PREFIX,
            Compensation::VectorDeleteIds { .. } => Self::VECTOR_DELETE_IDS,
        }
    }

    /// The payload half of the tagged representation.
    pub fn payload(&self) -> JsonValue {
        match serde_json::to_value(self) {
            Ok(JsonValue::Object(mut map)) => map.remove("payload").unwrap_or(JsonValue::Null),
            _ => JsonValue::Null,
        }
    }
}

/// Append-only compensation log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaAction {
    pub id: SagaActionId,
    pub saga_id: SagaId,
    /// 1-based, gap-free within the saga.
    pub seq: i64,
    pub kind: String,
    pub payload: JsonValue,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaAction {
    pub fn compensation(&self) -> Result<Compensation, CoreError> {
        Compensation::from_parts(&self.kind, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_matches_documented_shape() {
        let c = Compensation::VectorDeleteIds {
            namespace: "N".into(),
            ids: vec!["v1".into(), "v2".into()],
        };
        assert_eq!(c.kind(), "vector_delete_ids");
        assert_eq!(c.payload(), serde_json::json!({ "namespace": "N", "ids": ["v1", "v2"] }));

        let o = Compensation::ObjectDeleteKey {
            category: ObjectCategory::Material,
            key: "K".into(),
        };
        assert_eq!(o.payload(), serde_json::json!({ "category": "material", "key": "K" }));
    }

    #[test]
    fn legacy_kinds_are_normalized() {
        let payload = serde_json::json!({ "namespace": "N", "ids": ["a"] });
        let c = Compensation::from_parts("pinecone_delete_ids", &payload).unwrap();
        assert_eq!(c.kind(), Compensation::VECTOR_DELETE_IDS);
    }

    #[test]
    fn unknown_kinds_are_fatal() {
        let err = Compensation::from_parts("drop_database", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, CoreError::Fatal(msg) if msg.contains("drop_database")));
    }

    #[test]
    fn malformed_payloads_are_fatal() {
        let err = Compensation::from_parts("object_delete_key", &serde_json::json!({ "key": 1 }))
            .unwrap_err();
        assert!(matches!(err, CoreError::Fatal(_)));
    }

    #[test]
    fn saga_transitions() {
        assert!(SagaStatus::Running.can_transition_to(SagaStatus::Compensating));
        assert!(SagaStatus::Compensating.can_transition_to(SagaStatus::Compensated));
        assert!(SagaStatus::Compensated.can_transition_to(SagaStatus::Compensating));
        assert!(!SagaStatus::Succeeded.can_transition_to(SagaStatus::Compensating));
        assert!(SagaStatus::Compensated.can_transition_to(SagaStatus::Running));
        assert!(SagaStatus::Compensating.can_transition_to(SagaStatus::Running));
        assert!(!SagaStatus::Succeeded.can_transition_to(SagaStatus::Running));
    }
}
