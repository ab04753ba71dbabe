//! `courseforge-core`: foundation building blocks for the job orchestration core.
//!
//! This crate contains **pure** primitives (no IO): identifiers, the error
//! taxonomy, typed configuration, the clock abstraction and the explicit
//! request context.

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CoreConfig, RetryPolicy};
pub use context::RequestContext;
pub use error::{CoreError, CoreResult};
pub use id::{EntityId, JobId, MessageId, SagaActionId, SagaId, ThreadId, TurnId, UserId};
