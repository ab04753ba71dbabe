//! Chat turns: one user message, one assistant placeholder, one reply job.
//!
//! `send_message` runs in a single transaction under a row lock on the
//! thread, so seq assignment and the one-reply-in-flight rule are serialized
//! per thread. Notifications go out after commit.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use courseforge_core::{CoreError, EntityId, JobId, MessageId, RequestContext, ThreadId, TurnId, UserId};
use courseforge_events::{EventKind, Notifier, thread_channel};

use super::types::{ChatMessage, ChatThread, ChatTurn, MessageRole, MessageStatus, SentTurn};
use crate::jobs::service::notify_job;
use crate::jobs::{JobRun, JobStatus, NewJob, enqueue_if_needed_in, enqueue_in};
use crate::store::{ChatTx, JobTx, Store, StoreTx};

/// Job type producing the assistant reply of a turn.
pub const CHAT_RESPOND: &str = "chat_respond";
/// Debounced job rebuilding derived thread state after an edit or delete.
pub const CHAT_REBUILD: &str = "chat_rebuild";
/// Entity type under which chat jobs are keyed.
pub const THREAD_ENTITY: &str = "chat_thread";

pub fn thread_entity(thread_id: ThreadId) -> EntityId {
    EntityId::from_uuid(*thread_id.as_uuid())
}

pub struct ChatCoordinator<S: Store> {
    store: Arc<S>,
    notifier: Arc<dyn Notifier>,
}

impl<S: Store> Clone for ChatCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

impl<S: Store> ChatCoordinator<S> {
    pub fn new(store: Arc<S>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    pub async fn create_thread(&self, ctx: &RequestContext, title: &str) -> Result<ChatThread, CoreError> {
        let mut tx = self.store.begin().await?;
        let thread = ChatThread::new(ctx.owner(), title, tx.now());
        tx.insert_thread(&thread).await?;
        tx.commit().await?;
        info!(thread_id = %thread.id, "chat thread created");
        Ok(thread)
    }

    /// Append a user message and its assistant placeholder, and enqueue the
    /// reply job.
    ///
    /// A repeated `idempotency_key` returns the original turn. Fails with
    /// `ThreadBusy` while a reply is in flight on the thread.
    pub async fn send_message(
        &self,
        ctx: &RequestContext,
        thread_id: ThreadId,
        content: &str,
        idempotency_key: Option<&str>,
    ) -> Result<SentTurn, CoreError> {
        if content.trim().is_empty() {
            return Err(CoreError::invalid_argument("message content is required"));
        }
        if idempotency_key.is_some_and(|k| k.trim().is_empty()) {
            return Err(CoreError::invalid_argument("idempotency key must be non-empty"));
        }

        let sent = match self.send_in_tx(ctx.owner(), thread_id, content, idempotency_key).await {
            Ok(sent) => sent,
            // A concurrent send with the same key won the race.
            Err(err) if err.is_conflict() => {
                let Some(key) = idempotency_key else {
                    return Err(err);
                };
                match self.replay(ctx.owner(), thread_id, key).await? {
                    Some(sent) => sent,
                    None => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };

        if sent.created {
            info!(
                thread_id = %thread_id,
                turn_id = %sent.turn.id,
                user_seq = sent.user_message.seq,
                "chat turn created"
            );
            if let Some(job) = &sent.job {
                notify_job(self.notifier.as_ref(), EventKind::JobCreated, job);
            }
            self.notifier.notify(
                &thread_channel(thread_id),
                EventKind::ChatTurnCreated,
                json!({
                    "turn": sent.turn,
                    "user_message": sent.user_message,
                    "assistant_message": sent.assistant_message,
                }),
            );
        } else {
            debug!(thread_id = %thread_id, turn_id = %sent.turn.id, "chat send replayed");
        }
        Ok(sent)
    }

    async fn send_in_tx(
        &self,
        owner: UserId,
        thread_id: ThreadId,
        content: &str,
        idempotency_key: Option<&str>,
    ) -> Result<SentTurn, CoreError> {
        let mut tx = self.store.begin().await?;
        let thread = tx.lock_thread(owner, thread_id).await?.ok_or(CoreError::NotFound)?;

        if let Some(key) = idempotency_key {
            if let Some(prior) = replay_in(&mut tx, owner, thread_id, key).await? {
                tx.rollback().await?;
                return Ok(prior);
            }
        }

        let entity = thread_entity(thread_id);
        let busy = tx
            .find_runnable_for_entity(owner, THREAD_ENTITY, Some(entity), CHAT_RESPOND)
            .await?;
        if busy.is_some() {
            return Err(CoreError::ThreadBusy);
        }

        let now = tx.now();
        let user_seq = thread.next_seq + 1;
        let assistant_seq = user_seq + 1;
        let user_message = ChatMessage::user(&thread, user_seq, content, idempotency_key.map(str::to_string), now);
        let assistant_message = ChatMessage::assistant_placeholder(&thread, assistant_seq, now);
        tx.insert_message(&user_message).await?;
        tx.insert_message(&assistant_message).await?;
        tx.set_thread_next_seq(owner, thread_id, assistant_seq).await?;

        let new_job = NewJob::new(owner, CHAT_RESPOND)
            .for_entity(THREAD_ENTITY, entity)
            .with_payload(json!({
                "thread_id": thread_id,
                "user_message_id": user_message.id,
                "assistant_message_id": assistant_message.id,
            }));
        let (job, _) = enqueue_in(&mut tx, &new_job).await.map_err(|err| {
            if err.is_conflict() {
                CoreError::ThreadBusy
            } else {
                err
            }
        })?;

        let turn = ChatTurn {
            id: TurnId::new(),
            thread_id,
            owner_user_id: owner,
            user_message_id: user_message.id,
            assistant_message_id: assistant_message.id,
            job_id: job.id,
            created_at: now,
        };
        tx.insert_turn(&turn).await?;
        tx.commit().await?;

        Ok(SentTurn {
            turn,
            user_message,
            assistant_message: Some(assistant_message),
            job: Some(job),
            created: true,
        })
    }

    async fn replay(&self, owner: UserId, thread_id: ThreadId, key: &str) -> Result<Option<SentTurn>, CoreError> {
        let mut tx = self.store.begin().await?;
        let prior = replay_in(&mut tx, owner, thread_id, key).await?;
        tx.rollback().await?;
        Ok(prior)
    }

    /// Finalise the assistant reply of the turn driven by `job_id`. Replies
    /// that are already final are returned unchanged.
    pub async fn complete_turn(&self, owner: UserId, job_id: JobId, content: &str) -> Result<ChatMessage, CoreError> {
        self.finish_turn(owner, job_id, MessageStatus::Done, Some(content)).await
    }

    /// Mark the assistant reply of the turn driven by `job_id` as errored.
    pub async fn fail_turn(&self, owner: UserId, job_id: JobId) -> Result<ChatMessage, CoreError> {
        self.finish_turn(owner, job_id, MessageStatus::Error, None).await
    }

    /// Mark the reply errored once its job can no longer produce it (canceled,
    /// finally failed or gone). `None` while the job may still run, e.g. after
    /// another worker reclaimed it.
    pub async fn fail_turn_if_abandoned(&self, owner: UserId, job_id: JobId) -> Result<Option<ChatMessage>, CoreError> {
        let mut tx = self.store.begin().await?;
        let job = tx.get_job(owner, job_id).await?;
        tx.rollback().await?;

        let live = job.is_some_and(|j| !j.status.is_terminal() || (j.status == JobStatus::Failed && j.retryable));
        if live {
            debug!(job_id = %job_id, "reply job still live; turn left streaming");
            return Ok(None);
        }
        self.fail_turn(owner, job_id).await.map(Some)
    }

    async fn finish_turn(
        &self,
        owner: UserId,
        job_id: JobId,
        status: MessageStatus,
        content: Option<&str>,
    ) -> Result<ChatMessage, CoreError> {
        let mut tx = self.store.begin().await?;
        let turn = tx.turn_by_job(owner, job_id).await?.ok_or(CoreError::NotFound)?;
        let mut reply = tx
            .get_message(owner, turn.assistant_message_id)
            .await?
            .ok_or(CoreError::NotFound)?;
        if reply.status != MessageStatus::Streaming {
            tx.rollback().await?;
            return Ok(reply);
        }

        reply.status = status;
        if let Some(content) = content {
            reply.content = content.to_string();
        }
        reply.updated_at = tx.now();
        if !tx.update_message(&reply).await? {
            return Err(CoreError::NotFound);
        }
        tx.commit().await?;

        info!(thread_id = %turn.thread_id, turn_id = %turn.id, status = reply.status.as_str(), "chat turn completed");
        self.notifier.notify(
            &thread_channel(turn.thread_id),
            EventKind::ChatTurnCompleted,
            json!({ "turn": turn, "assistant_message": reply }),
        );
        Ok(reply)
    }

    /// Replace the content of a user message and debounce a thread rebuild.
    pub async fn edit_user_message(
        &self,
        ctx: &RequestContext,
        message_id: MessageId,
        content: &str,
    ) -> Result<(ChatMessage, Option<JobRun>), CoreError> {
        if content.trim().is_empty() {
            return Err(CoreError::invalid_argument("message content is required"));
        }
        let content = content.to_string();
        let (message, rebuild) = self
            .modify_user_message(ctx.owner(), message_id, move |m| m.content = content)
            .await?;
        self.after_modify(&message, rebuild.as_ref(), EventKind::ChatMessageUpdated);
        Ok((message, rebuild))
    }

    /// Soft-delete a user message and debounce a thread rebuild.
    pub async fn delete_user_message(
        &self,
        ctx: &RequestContext,
        message_id: MessageId,
    ) -> Result<(ChatMessage, Option<JobRun>), CoreError> {
        let (message, rebuild) = self
            .modify_user_message(ctx.owner(), message_id, |m| m.deleted_at = Some(m.updated_at))
            .await?;
        self.after_modify(&message, rebuild.as_ref(), EventKind::ChatMessageDeleted);
        Ok((message, rebuild))
    }

    async fn modify_user_message<F>(
        &self,
        owner: UserId,
        message_id: MessageId,
        change: F,
    ) -> Result<(ChatMessage, Option<JobRun>), CoreError>
    where
        F: FnOnce(&mut ChatMessage) + Send,
    {
        let mut tx = self.store.begin().await?;
        let mut message = tx.get_message(owner, message_id).await?.ok_or(CoreError::NotFound)?;
        if message.is_deleted() {
            return Err(CoreError::NotFound);
        }
        if message.role != MessageRole::User {
            return Err(CoreError::invalid_argument("only user messages can be changed"));
        }
        // Serializes with sends on the same thread.
        tx.lock_thread(owner, message.thread_id).await?.ok_or(CoreError::NotFound)?;

        message.updated_at = tx.now();
        change(&mut message);
        if !tx.update_message(&message).await? {
            return Err(CoreError::NotFound);
        }

        let rebuild = NewJob::new(owner, CHAT_REBUILD)
            .for_entity(THREAD_ENTITY, thread_entity(message.thread_id))
            .with_payload(json!({ "thread_id": message.thread_id, "message_id": message.id }));
        let job = enqueue_if_needed_in(&mut tx, &rebuild).await?;
        tx.commit().await?;
        Ok((message, job))
    }

    fn after_modify(&self, message: &ChatMessage, rebuild: Option<&JobRun>, kind: EventKind) {
        if let Some(job) = rebuild {
            notify_job(self.notifier.as_ref(), EventKind::JobCreated, job);
        } else {
            debug!(thread_id = %message.thread_id, "chat rebuild already pending");
        }
        self.notifier
            .notify(&thread_channel(message.thread_id), kind, json!({ "message": message }));
    }

    /// The turn a `chat_respond` job produces the reply for.
    pub async fn turn_for_job(&self, owner: UserId, job_id: JobId) -> Result<Option<ChatTurn>, CoreError> {
        let mut tx = self.store.begin().await?;
        let turn = tx.turn_by_job(owner, job_id).await?;
        tx.rollback().await?;
        Ok(turn)
    }

    /// Visible messages of a thread in seq order.
    pub async fn list_messages(&self, ctx: &RequestContext, thread_id: ThreadId) -> Result<Vec<ChatMessage>, CoreError> {
        let mut tx = self.store.begin().await?;
        let messages = tx.list_messages(ctx.owner(), thread_id).await?;
        tx.rollback().await?;
        Ok(messages.into_iter().filter(|m| !m.is_deleted()).collect())
    }
}

async fn replay_in<T>(tx: &mut T, owner: UserId, thread_id: ThreadId, key: &str) -> Result<Option<SentTurn>, CoreError>
where
    T: ChatTx + JobTx + ?Sized,
{
    let Some(user_message) = tx.find_user_message_by_key(owner, thread_id, key).await? else {
        return Ok(None);
    };
    let turn = tx
        .turn_by_user_message(owner, user_message.id)
        .await?
        .ok_or_else(|| CoreError::conflict(format!("message {} has no turn", user_message.id)))?;
    let assistant_message = tx.get_message(owner, turn.assistant_message_id).await?;
    let job = tx.get_job(owner, turn.job_id).await?;
    Ok(Some(SentTurn {
        turn,
        user_message,
        assistant_message,
        job,
        created: false,
    }))
}
