//! `chat_respond` handler: generates the assistant reply of a turn.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use courseforge_core::{CoreError, JobId, MessageId, RequestContext, ThreadId, UserId};

use super::coordinator::ChatCoordinator;
use super::types::{ChatMessage, MessageRole};
use crate::adapters::LlmClient;
use crate::store::Store;
use crate::worker::{HandlerError, HandlerOutcome, JobContext, JobHandler};

#[derive(Debug, Deserialize)]
struct RespondPayload {
    thread_id: ThreadId,
    assistant_message_id: MessageId,
}

pub struct ChatResponder<S: Store> {
    chat: ChatCoordinator<S>,
    llm: Arc<dyn LlmClient>,
}

impl<S: Store> ChatResponder<S> {
    pub fn new(chat: ChatCoordinator<S>, llm: Arc<dyn LlmClient>) -> Self {
        Self { chat, llm }
    }

    async fn respond(&self, ctx: &JobContext) -> Result<HandlerOutcome, HandlerError> {
        let job = ctx.job();
        let owner = job.owner_user_id;
        let payload: RespondPayload = serde_json::from_value(ctx.payload().clone())
            .map_err(|e| HandlerError::fatal(format!("malformed chat_respond payload: {e}")))?;

        let messages = self
            .chat
            .list_messages(&RequestContext::new(owner), payload.thread_id)
            .await?;
        let prompt = transcript(&messages, payload.assistant_message_id);
        ctx.report_progress(10, Some("generating")).await?;

        let reply = self.llm.generate_text(&prompt).await?;
        // Confirms the lease before the reply becomes visible.
        ctx.report_progress(90, Some("storing")).await?;

        let message = self.chat.complete_turn(owner, job.id, &reply).await?;
        info!(job_id = %job.id, thread_id = %payload.thread_id, "assistant reply stored");
        Ok(HandlerOutcome::Succeeded(Some(serde_json::json!({
            "assistant_message_id": message.id,
        }))))
    }

    /// Settle the placeholder when this failure ends the turn.
    async fn settle_failed_turn(&self, ctx: &JobContext, err: &HandlerError) {
        let job = ctx.job();
        let (owner, job_id) = (job.owner_user_id, job.id);
        let settled = match err {
            HandlerError::Fatal(_) => {
                warn!(job_id = %job_id, error = %err, "reply generation rejected");
                self.fail_turn(owner, job_id).await
            }
            HandlerError::Transient(_) if ctx.is_final_attempt() => {
                warn!(job_id = %job_id, attempts = job.attempts, error = %err, "reply generation out of retries");
                self.fail_turn(owner, job_id).await
            }
            HandlerError::Transient(_) => Ok(()),
            HandlerError::Canceled => self
                .chat
                .fail_turn_if_abandoned(owner, job_id)
                .await
                .map(|_| ()),
        };
        if let Err(settle_err) = settled {
            warn!(job_id = %job_id, error = %settle_err, "failed to settle chat turn");
        }
    }

    async fn fail_turn(&self, owner: UserId, job_id: JobId) -> Result<(), CoreError> {
        self.chat.fail_turn(owner, job_id).await.map(|_| ())
    }
}

/// Transcript of everything before the reply being generated.
fn transcript(messages: &[ChatMessage], reply: MessageId) -> String {
    let cutoff = messages
        .iter()
        .find(|m| m.id == reply)
        .map(|m| m.seq)
        .unwrap_or(i64::MAX);
    messages
        .iter()
        .filter(|m| m.seq < cutoff && !m.content.is_empty())
        .map(|m| {
            let speaker = match m.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            format!("{speaker}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl<S: Store> JobHandler for ChatResponder<S> {
    async fn handle(&self, ctx: JobContext) -> Result<HandlerOutcome, HandlerError> {
        let result = self.respond(&ctx).await;
        if let Err(err) = &result {
            self.settle_failed_turn(&ctx, err).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use courseforge_core::UserId;

    use super::*;
    use crate::chat::ChatThread;

    #[test]
    fn transcript_stops_at_the_reply() {
        let thread = ChatThread::new(UserId::new(), "t", Utc::now());
        let now = Utc::now();
        let first = ChatMessage::user(&thread, 1, "hello", None, now);
        let mut answer = ChatMessage::assistant_placeholder(&thread, 2, now);
        answer.content = "hi there".into();
        let second = ChatMessage::user(&thread, 3, "explain sagas", None, now);
        let pending = ChatMessage::assistant_placeholder(&thread, 4, now);
        let later = ChatMessage::user(&thread, 5, "not yet", None, now);
        let messages = vec![first, answer, second, pending.clone(), later];

        assert_eq!(
            transcript(&messages, pending.id),
            "user: hello\nassistant: hi there\nuser: explain sagas"
        );
    }
}
