//! Handler contract between the worker runtime and job implementations.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use courseforge_core::{CoreError, RetryPolicy};

use crate::adapters::AdapterError;
use crate::jobs::{JobRun, Lease, ProgressSink};

/// Failure classification returned by handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Retry later with backoff, within the retry budget.
    #[error("transient: {0}")]
    Transient(String),
    /// Do not retry.
    #[error("fatal: {0}")]
    Fatal(String),
    /// The handler observed cancellation and stopped.
    #[error("canceled")]
    Canceled,
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

impl From<CoreError> for HandlerError {
    fn from(value: CoreError) -> Self {
        match value {
            CoreError::Transient(msg) => HandlerError::Transient(msg),
            other => HandlerError::Fatal(other.to_string()),
        }
    }
}

impl From<AdapterError> for HandlerError {
    fn from(value: AdapterError) -> Self {
        CoreError::from(value).into()
    }
}

/// Successful handler return.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The runtime marks the job succeeded, storing the result if given.
    Succeeded(Option<JsonValue>),
    /// The handler already persisted the job's next state (requeued, parked,
    /// failed with compensation...). The runtime writes nothing.
    Settled,
}

/// Execution context handed to a handler.
#[derive(Clone)]
pub struct JobContext {
    job: JobRun,
    lease: Lease,
    retry: RetryPolicy,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("attempt", &self.lease.attempt)
            .field("canceled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl JobContext {
    pub fn new(
        job: JobRun,
        lease: Lease,
        retry: RetryPolicy,
        cancel: CancellationToken,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            job,
            lease,
            retry,
            cancel,
            progress,
        }
    }

    /// The row as claimed.
    pub fn job(&self) -> &JobRun {
        &self.job
    }

    /// The claim this execution runs under.
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Whether a transient failure now ends the job instead of scheduling a retry.
    pub fn is_final_attempt(&self) -> bool {
        !self.retry.should_retry(self.lease.attempt.max(0) as u32)
    }

    pub fn payload(&self) -> &JsonValue {
        &self.job.payload
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Canceled)` once cancellation was signalled.
    pub fn check_canceled(&self) -> Result<(), HandlerError> {
        if self.is_canceled() {
            return Err(HandlerError::Canceled);
        }
        Ok(())
    }

    /// Report in-stage progress. A job that is no longer running cancels the context.
    pub async fn report_progress(&self, progress: i32, stage: Option<&str>) -> Result<(), HandlerError> {
        let running = self
            .progress
            .report_progress(&self.lease, progress, stage)
            .await?;
        if !running {
            self.cancel.cancel();
            return Err(HandlerError::Canceled);
        }
        Ok(())
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> Result<HandlerOutcome, HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutcome, HandlerError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutcome, HandlerError>> + Send,
{
    async fn handle(&self, ctx: JobContext) -> Result<HandlerOutcome, HandlerError> {
        (self.0)(ctx).await
    }
}
