//! Durable job orchestration core: store, claimer, control plane,
//! orchestrator, sagas, waitpoints, chat turns and the worker runtime.
//!
//! ## Layout
//!
//! - `store`: transactional store contract, in-memory and Postgres backends
//! - `jobs`: job rows, `JobService` (enqueue/cancel/restart) and `JobQueue` (claim/lease)
//! - `worker`: handler registry and the worker runtime
//! - `orchestrator`: multi-stage root jobs and waitpoints
//! - `saga`: compensation logs
//! - `chat`: chat threads and reply turns
//! - `adapters`: object store, vector store and LLM contracts
//! - `event_bus`: Redis notification transport (feature `redis`)

pub mod adapters;
pub mod chat;
pub mod event_bus;
pub mod jobs;
pub mod orchestrator;
pub mod saga;
pub mod store;
pub mod worker;
