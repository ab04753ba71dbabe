//! Pipeline declaration: named stages, their prerequisites and the stage
//! handler contract.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use courseforge_core::CoreError;

use super::state::{OrchestratorState, StageStatus};
use crate::jobs::{JobRun, Lease, NewJob, ProgressSink};
use crate::saga::Compensation;
use crate::worker::HandlerError;

/// Static description of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    name: String,
    after: Vec<String>,
    weight: u32,
    compensating: bool,
    max_attempts: Option<u32>,
    parallel_safe: bool,
}

impl StageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            after: Vec::new(),
            weight: 1,
            compensating: false,
            max_attempts: None,
            parallel_safe: false,
        }
    }

    /// Require `stage` to have succeeded first.
    pub fn after(mut self, stage: impl Into<String>) -> Self {
        self.after.push(stage.into());
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Exhausting this stage's retries compensates the saga.
    pub fn compensating(mut self) -> Self {
        self.compensating = true;
        self
    }

    /// Stage-level retry budget; defaults to the global `max_attempts`.
    pub fn retry(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// May run while another stage waits for a decision.
    pub fn parallel_safe(mut self) -> Self {
        self.parallel_safe = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prerequisites(&self) -> &[String] {
        &self.after
    }

    pub fn is_compensating(&self) -> bool {
        self.compensating
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

/// What a stage handler asks the orchestrator to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Stage done; the value is stored as the stage's artifacts.
    Completed(JsonValue),
    /// Park the root until a decision is submitted for this stage.
    Wait { prompt: JsonValue },
    /// Run the work as a child job and adopt its result when it succeeds.
    Delegate(NewJob),
}

/// Execution context of one stage invocation.
pub struct StageContext {
    job: JobRun,
    lease: Lease,
    stage: String,
    attempt: u32,
    snapshot: OrchestratorState,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressSink>,
    progress_base: i32,
    progress_span: i32,
    compensations: Vec<Compensation>,
}

impl StageContext {
    pub(crate) fn new(
        job: JobRun,
        lease: Lease,
        stage: &str,
        snapshot: OrchestratorState,
        cancel: CancellationToken,
        progress: Arc<dyn ProgressSink>,
        progress_range: (i32, i32),
    ) -> Self {
        let attempt = snapshot.stage(stage).map(|s| s.attempts).unwrap_or(0);
        Self {
            job,
            lease,
            stage: stage.to_string(),
            attempt,
            snapshot,
            cancel,
            progress,
            progress_base: progress_range.0,
            progress_span: progress_range.1,
            compensations: Vec::new(),
        }
    }

    /// The root job as last persisted.
    pub fn job(&self) -> &JobRun {
        &self.job
    }

    pub fn payload(&self) -> &JsonValue {
        &self.job.payload
    }

    pub fn stage_name(&self) -> &str {
        &self.stage
    }

    /// 1 on the first invocation of this stage.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Decision submitted through the waitpoint, if any.
    pub fn decision(&self) -> Option<&JsonValue> {
        self.snapshot.stage(&self.stage).and_then(|s| s.decision.as_ref())
    }

    /// Artifacts this stage recorded on an earlier run.
    pub fn prior_artifacts(&self) -> Option<&JsonValue> {
        self.artifacts_of(&self.stage)
    }

    pub fn artifacts_of(&self, stage: &str) -> Option<&JsonValue> {
        self.snapshot.stage(stage).and_then(|s| s.artifacts.as_ref())
    }

    /// Record the inverse of a side effect this stage performed. Appended to
    /// the saga together with the stage's next state change.
    pub fn record_compensation(&mut self, compensation: Compensation) {
        self.compensations.push(compensation);
    }

    pub(crate) fn take_compensations(&mut self) -> Vec<Compensation> {
        std::mem::take(&mut self.compensations)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn check_canceled(&self) -> Result<(), HandlerError> {
        if self.cancel.is_cancelled() {
            return Err(HandlerError::Canceled);
        }
        Ok(())
    }

    /// In-stage progress, `percent` of this stage mapped onto the root's scale.
    pub async fn report_progress(&self, percent: i32) -> Result<(), HandlerError> {
        let overall = self.progress_base + self.progress_span * percent.clamp(0, 100) / 100;
        let running = self
            .progress
            .report_progress(&self.lease, overall, Some(self.stage.as_str()))
            .await?;
        if !running {
            self.cancel.cancel();
            return Err(HandlerError::Canceled);
        }
        Ok(())
    }
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Must be idempotent: a stage may run again after a crash.
    async fn run(&self, ctx: &mut StageContext) -> Result<StageOutcome, HandlerError>;
}

pub(crate) struct Stage {
    pub(crate) spec: StageSpec,
    pub(crate) handler: Arc<dyn StageHandler>,
}

/// Ordered stages of one root job type.
pub struct Pipeline {
    job_type: String,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            stages: Vec::new(),
        }
    }

    pub fn stage(mut self, spec: StageSpec, handler: Arc<dyn StageHandler>) -> Self {
        self.stages.push(Stage { spec, handler });
        self
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn specs(&self) -> impl Iterator<Item = &StageSpec> {
        self.stages.iter().map(|s| &s.spec)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.spec.name == name)
    }

    /// Stage names are unique, prerequisites are declared earlier (so the
    /// graph is acyclic) and the total weight is positive.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.stages.is_empty() {
            return Err(CoreError::config(format!("pipeline {} has no stages", self.job_type)));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            let spec = &stage.spec;
            if spec.name.trim().is_empty() {
                return Err(CoreError::config("stage name must be non-empty"));
            }
            for dep in &spec.after {
                if !seen.contains(dep.as_str()) {
                    return Err(CoreError::config(format!(
                        "stage {} depends on {dep}, which is not declared before it",
                        spec.name
                    )));
                }
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(CoreError::config(format!("duplicate stage {}", spec.name)));
            }
        }
        if self.total_weight() == 0 {
            return Err(CoreError::config(format!("pipeline {} has zero total weight", self.job_type)));
        }
        Ok(())
    }

    fn total_weight(&self) -> u64 {
        self.stages.iter().map(|s| u64::from(s.spec.weight)).sum()
    }

    /// `round(100 * succeeded_weight / total_weight)`, clamped to at most 99
    /// until every stage has succeeded, so 100 always means the root finished.
    /// A light last stage can therefore leave the value short of the plain
    /// weighted ratio (199 of 200 reports 99, not 100).
    pub fn progress(&self, state: &OrchestratorState) -> i32 {
        let total = self.total_weight();
        if total == 0 {
            return 0;
        }
        let done: u64 = self
            .stages
            .iter()
            .filter(|s| state.stage(&s.spec.name).is_some_and(|st| st.is_succeeded()))
            .map(|s| u64::from(s.spec.weight))
            .sum();
        if done >= total {
            return 100;
        }
        (((done * 200 + total) / (total * 2)) as i32).min(99)
    }

    /// Progress before `stage` runs and the share of the scale it covers.
    pub(crate) fn progress_range(&self, state: &OrchestratorState, stage: &str) -> (i32, i32) {
        let base = self.progress(state);
        let total = self.total_weight().max(1);
        let weight = self
            .get(stage)
            .map(|s| u64::from(s.spec.weight))
            .unwrap_or(0);
        (base, (weight * 100 / total) as i32)
    }

    /// First pending stage, in declaration order, whose prerequisites have
    /// succeeded. While a stage waits for a decision only parallel-safe
    /// stages are eligible.
    pub fn next_runnable(&self, state: &OrchestratorState) -> Option<&StageSpec> {
        let waiting = state.waiting_stage().is_some();
        self.specs().find(|spec| {
            let status = state.stage(&spec.name).map(|s| s.status).unwrap_or_default();
            status == StageStatus::Pending
                && (!waiting || spec.parallel_safe)
                && spec
                    .after
                    .iter()
                    .all(|dep| state.stage(dep).is_some_and(|s| s.is_succeeded()))
        })
    }

    pub fn all_succeeded(&self, state: &OrchestratorState) -> bool {
        self.specs()
            .all(|spec| state.stage(&spec.name).is_some_and(|s| s.is_succeeded()))
    }
}
