//! Sagas: append-only compensation logs bound to a root job.

pub mod engine;
pub mod types;

pub use engine::{
    CompensationReport, SagaEngine, append_action_in, append_compensation_in, create_or_get_in,
};
pub use types::{ActionStatus, Compensation, SagaAction, SagaRun, SagaStatus};
