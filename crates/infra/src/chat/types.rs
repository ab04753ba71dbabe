//! Chat thread, message and turn rows.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courseforge_core::{CoreError, JobId, MessageId, ThreadId, TurnId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatThread {
    pub id: ThreadId,
    pub owner_user_id: UserId,
    pub title: String,
    /// Highest message seq assigned so far (0 for an empty thread).
    pub next_seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatThread {
    pub fn new(owner_user_id: UserId, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: ThreadId::new(),
            owner_user_id,
            title: title.into(),
            next_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl FromStr for MessageRole {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(CoreError::invalid_argument(format!("unknown message role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Assistant placeholder still being generated.
    Streaming,
    Done,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Streaming => "streaming",
            MessageStatus::Done => "done",
            MessageStatus::Error => "error",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streaming" => Ok(MessageStatus::Streaming),
            "done" => Ok(MessageStatus::Done),
            "error" => Ok(MessageStatus::Error),
            other => Err(CoreError::invalid_argument(format!("unknown message status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub owner_user_id: UserId,
    pub seq: i64,
    pub role: MessageRole,
    pub content: String,
    pub status: MessageStatus,
    /// Client-supplied key; only set on user messages.
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn user(
        thread: &ChatThread,
        seq: i64,
        content: impl Into<String>,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            thread_id: thread.id,
            owner_user_id: thread.owner_user_id,
            seq,
            role: MessageRole::User,
            content: content.into(),
            status: MessageStatus::Done,
            idempotency_key,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Empty assistant message awaiting the reply job.
    pub fn assistant_placeholder(thread: &ChatThread, seq: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            thread_id: thread.id,
            owner_user_id: thread.owner_user_id,
            seq,
            role: MessageRole::Assistant,
            content: String::new(),
            status: MessageStatus::Streaming,
            idempotency_key: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Binds a user message, its assistant reply and the job producing the reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub id: TurnId,
    pub thread_id: ThreadId,
    pub owner_user_id: UserId,
    pub user_message_id: MessageId,
    pub assistant_message_id: MessageId,
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
}

/// Result of `send_message`: the message pair and the reply job.
#[derive(Debug, Clone, PartialEq)]
pub struct SentTurn {
    pub turn: ChatTurn,
    pub user_message: ChatMessage,
    pub assistant_message: Option<ChatMessage>,
    pub job: Option<crate::jobs::JobRun>,
    /// False when an earlier call with the same idempotency key was replayed.
    pub created: bool,
}
