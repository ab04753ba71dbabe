//! Worker runtime and the handler contract.

pub mod handler;
pub mod registry;
pub mod runtime;

pub use handler::{FnHandler, HandlerError, HandlerOutcome, JobContext, JobHandler, handler_fn};
pub use registry::{HandlerRegistry, ResolvedHandler};
pub use runtime::{RunOutcome, Worker, WorkerHandle, WorkerStats};
