//! Orchestrator state persisted in `JobRun.result`.
//!
//! The stages map is the authoritative resume point after a crash. Unknown
//! top-level keys written by handlers are preserved.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use courseforge_core::{CoreError, JobId, SagaId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    WaitingUser,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::WaitingUser => "waiting_user",
        }
    }
}

impl FromStr for StageStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StageStatus::Pending),
            "running" => Ok(StageStatus::Running),
            "succeeded" => Ok(StageStatus::Succeeded),
            "failed" => Ok(StageStatus::Failed),
            "waiting_user" => Ok(StageStatus::WaitingUser),
            other => Err(CoreError::invalid_argument(format!("unknown stage status: {other}"))),
        }
    }
}

/// Per-stage sub-state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Earliest time the root re-checks this stage (delegated child polling).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until: Option<DateTime<Utc>>,
    /// Number of times the stage handler has been started.
    #[serde(default)]
    pub attempts: u32,
    /// References to whatever the stage produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<JsonValue>,
    /// Waitpoint prompt, opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<JsonValue>,
    /// Waitpoint decision, opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<JsonValue>,
}

impl StageState {
    pub fn is_succeeded(&self) -> bool {
        self.status == StageStatus::Succeeded
    }
}

/// Marker written when the root fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureMarker {
    pub stage: String,
    pub error: String,
    /// Whether compensation was requested for this failure.
    pub compensate: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorState {
    #[serde(default)]
    pub stages: BTreeMap<String, StageState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saga_id: Option<SagaId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureMarker>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl OrchestratorState {
    /// Decode the state from a job result. Results without a `stages` object
    /// do not belong to an orchestrated root and yield `None`.
    pub fn from_result(result: &JsonValue) -> Result<Option<Self>, CoreError> {
        let is_orchestrated = result
            .as_object()
            .and_then(|o| o.get("stages"))
            .is_some_and(JsonValue::is_object);
        if !is_orchestrated {
            return Ok(None);
        }
        serde_json::from_value(result.clone())
            .map(Some)
            .map_err(|e| CoreError::fatal(format!("corrupt orchestrator state: {e}")))
    }

    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    pub fn stage(&self, name: &str) -> Option<&StageState> {
        self.stages.get(name)
    }

    /// Stage entry, created as `pending` if absent.
    pub fn stage_mut(&mut self, name: &str) -> &mut StageState {
        self.stages.entry(name.to_string()).or_default()
    }

    pub fn waiting_stage(&self) -> Option<&str> {
        self.stages
            .iter()
            .find(|(_, s)| s.status == StageStatus::WaitingUser)
            .map(|(name, _)| name.as_str())
    }

    /// Delegated child jobs referenced by any stage.
    pub fn child_job_ids(&self) -> Vec<JobId> {
        self.stages.values().filter_map(|s| s.child_job_id).collect()
    }

    /// Prepare the state for a restarted run: succeeded stages are kept,
    /// everything else goes back to `pending` without child, wait or prompt.
    pub fn reset_for_restart(&mut self) {
        for stage in self.stages.values_mut() {
            if stage.is_succeeded() {
                continue;
            }
            *stage = StageState {
                artifacts: stage.artifacts.take(),
                ..StageState::default()
            };
        }
        self.failure = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OrchestratorState {
        let mut state = OrchestratorState::default();
        state.stage_mut("ingest").status = StageStatus::Succeeded;
        let lessons = state.stage_mut("lessons");
        lessons.status = StageStatus::Running;
        lessons.child_job_id = Some(JobId::new());
        lessons.wait_until = Some(Utc::now());
        lessons.attempts = 2;
        let choose = state.stage_mut("choose");
        choose.status = StageStatus::WaitingUser;
        choose.prompt = Some(serde_json::json!({ "question": "single or split?" }));
        state
    }

    #[test]
    fn plain_results_are_not_orchestrated() {
        assert!(OrchestratorState::from_result(&JsonValue::Null).unwrap().is_none());
        assert!(
            OrchestratorState::from_result(&serde_json::json!({ "answer": 42 }))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn state_round_trips_and_keeps_extra_keys() {
        let mut state = sample();
        state.extra.insert("course_id".into(), serde_json::json!("c-1"));
        let value = state.to_value();
        assert_eq!(value["stages"]["choose"]["status"], "waiting_user");
        assert_eq!(value["course_id"], "c-1");

        let back = OrchestratorState::from_result(&value).unwrap().unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn corrupt_stage_map_is_fatal() {
        let bad = serde_json::json!({ "stages": { "ingest": { "status": "exploded" } } });
        assert!(matches!(
            OrchestratorState::from_result(&bad),
            Err(CoreError::Fatal(_))
        ));
    }

    #[test]
    fn restart_preserves_succeeded_stages() {
        let mut state = sample();
        state.failure = Some(FailureMarker {
            stage: "lessons".into(),
            error: "boom".into(),
            compensate: true,
            at: Utc::now(),
        });
        state.reset_for_restart();

        assert_eq!(state.stage("ingest").unwrap().status, StageStatus::Succeeded);
        let lessons = state.stage("lessons").unwrap();
        assert_eq!(lessons.status, StageStatus::Pending);
        assert!(lessons.child_job_id.is_none());
        assert!(lessons.wait_until.is_none());
        assert_eq!(lessons.attempts, 0);
        let choose = state.stage("choose").unwrap();
        assert_eq!(choose.status, StageStatus::Pending);
        assert!(choose.prompt.is_none());
        assert!(state.failure.is_none());
        assert!(state.child_job_ids().is_empty());
    }
}
