//! Durable jobs: row types, the control plane and the claimer.
//!
//! ## Components
//!
//! - `JobRun`: the persisted row, with `NewJob` / `JobPatch` to create and update it
//! - `JobService`: enqueue (idempotent, debounced), cancel, restart, queries
//! - `JobQueue`: claim with lease, heartbeat, complete, fail
//! - `Lease`: fencing token a worker carries for the attempt it claimed

pub mod queue;
pub mod service;
pub mod types;

pub use queue::{JobQueue, ProgressSink};
pub use service::{JobService, enqueue_if_needed_in, enqueue_in};
pub use types::{
    IdempotencyKey, IdempotencyRecord, JobPatch, JobRun, JobStatus, Lease, NewJob, Stamp,
};
