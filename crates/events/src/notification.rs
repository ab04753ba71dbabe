use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Closed set of lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobCreated,
    JobProgress,
    JobFailed,
    JobDone,
    JobCanceled,
    JobRestarted,
    /// A stage raised a waitpoint; the job is parked in `waiting_user`.
    JobWaiting,
    /// A user/assistant message pair was created for a chat turn.
    ChatTurnCreated,
    /// The assistant reply of a turn was finalised (done or error).
    ChatTurnCompleted,
    ChatMessageUpdated,
    ChatMessageDeleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobCreated => "job_created",
            EventKind::JobProgress => "job_progress",
            EventKind::JobFailed => "job_failed",
            EventKind::JobDone => "job_done",
            EventKind::JobCanceled => "job_canceled",
            EventKind::JobRestarted => "job_restarted",
            EventKind::JobWaiting => "job_waiting",
            EventKind::ChatTurnCreated => "chat_turn_created",
            EventKind::ChatTurnCompleted => "chat_turn_completed",
            EventKind::ChatMessageUpdated => "chat_message_updated",
            EventKind::ChatMessageDeleted => "chat_message_deleted",
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope published on the bus for one committed state change.
///
/// `payload` is the committed row (or rows) the change produced. For job
/// events it is the serialized job row, whose `id` + `version` pair is the
/// deduplication key for consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    event_id: Uuid,
    channel_id: String,
    kind: EventKind,
    payload: JsonValue,
    emitted_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(channel_id: impl Into<String>, kind: EventKind, payload: JsonValue) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            channel_id: channel_id.into(),
            kind,
            payload,
            emitted_at: Utc::now(),
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn emitted_at(&self) -> DateTime<Utc> {
        self.emitted_at
    }

    /// Job id carried by a job-row payload, if any.
    pub fn job_id(&self) -> Option<Uuid> {
        self.payload
            .get("id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Row version carried by a job-row payload, if any.
    pub fn version(&self) -> Option<i64> {
        self.payload.get("version").and_then(|v| v.as_i64())
    }

    /// Deduplication key for idempotent consumers.
    pub fn dedupe_key(&self) -> Option<(Uuid, i64)> {
        Some((self.job_id()?, self.version()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_as_snake_case() {
        let json = serde_json::to_string(&EventKind::JobRestarted).unwrap();
        assert_eq!(json, "\"job_restarted\"");
        assert_eq!(EventKind::JobRestarted.as_str(), "job_restarted");
    }

    #[test]
    fn dedupe_key_reads_job_row_payload() {
        let id = Uuid::now_v7();
        let n = Notification::new(
            "user:1",
            EventKind::JobProgress,
            serde_json::json!({ "id": id.to_string(), "version": 4 }),
        );
        assert_eq!(n.dedupe_key(), Some((id, 4)));

        let bare = Notification::new("user:1", EventKind::JobProgress, serde_json::json!({}));
        assert_eq!(bare.dedupe_key(), None);
    }
}
