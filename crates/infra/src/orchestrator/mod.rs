//! Multi-stage root jobs.
//!
//! ## Components
//!
//! - `Pipeline` / `StageSpec`: declared stages, prerequisites, weights, retry budgets
//! - `Orchestrator`: job handler of the root type, persisting the stages map in `JobRun.result`
//! - `WaitpointController`: resume a root parked on a decision

pub mod pipeline;
pub mod runner;
pub mod state;
pub mod waitpoint;

pub use pipeline::{Pipeline, StageContext, StageHandler, StageOutcome, StageSpec};
pub use runner::Orchestrator;
pub use state::{FailureMarker, OrchestratorState, StageState, StageStatus};
pub use waitpoint::{PendingDecision, WaitpointController};
