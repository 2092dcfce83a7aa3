//! # Task Runtime State
//!
//! Mutable execution state for a submitted task: overall status, per-step
//! runtime, and accumulated step results. All mutation happens on the
//! orchestrator command loop; other components observe snapshots.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::plan::StrategyPlan;

/// Failure taxonomy shared across steps and tasks.
///
/// The taxonomy is the contract; everything in the workspace converts its
/// domain errors into one of these kinds before attaching them to a step
/// or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed plan, unresolvable placeholder, forward dependency
    #[display("plan_error")]
    Plan,
    /// No advertised capability matches a peer step
    #[display("no_capability")]
    CapabilityNotFound,
    /// Peer returned a result with error status
    #[display("peer_error")]
    Peer,
    /// No peer result before the step window elapsed
    #[display("timeout")]
    Timeout,
    /// Substrate refused the publish or reconnect budget exhausted
    #[display("dispatch_error")]
    Dispatch,
    /// Local tool or model call failed
    #[display("tool_error")]
    Tool,
    /// Memory store decryption or checksum failure
    #[display("integrity_error")]
    Integrity,
    /// Memory store decompression failure
    #[display("corruption_error")]
    Corruption,
    /// Memory store refused a write under the declared disk limit
    #[display("resource_refusal")]
    ResourceRefusal,
    /// Submission rejected while draining
    #[display("draining")]
    Draining,
    /// Task-level deadline expired
    #[display("deadline")]
    Deadline,
}

/// A structured failure attached to a step or a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Runtime status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[display("pending")]
    Pending,
    /// Local step handed to the dispatcher
    #[display("running")]
    Running,
    /// Peer step published to the substrate
    #[display("dispatched")]
    Dispatched,
    /// Peer step awaiting a correlated result
    #[display("waiting_result")]
    WaitingResult,
    /// Peer step waiting out a retry delay
    #[display("failed_retry")]
    FailedRetry,
    #[display("completed")]
    Completed,
    #[display("failed_terminal")]
    FailedTerminal,
}

impl StepStatus {
    /// Terminal statuses allow the enclosing stage to join
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::FailedTerminal)
    }
}

/// Overall task status; transitions are monotonic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[display("new")]
    New,
    #[display("planning")]
    Planning,
    #[display("executing")]
    Executing,
    /// At least one peer step in the current stage awaits a result
    #[display("waiting_hsp")]
    WaitingHsp,
    /// Joining the final stage into the task result
    #[display("merging")]
    Merging,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Per-step runtime bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRuntime {
    pub status: StepStatus,
    /// Written exactly once, atomically with the transition to `Completed`
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub failure: Option<StepFailure>,
    /// Correlation id of the newest dispatch; superseded ids are forgotten
    #[serde(default)]
    pub correlation_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retries_left: u32,
    /// Dispatches so far; bounded by `1 + max_retries`
    #[serde(default)]
    pub dispatch_count: u32,
    #[serde(default)]
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl StepRuntime {
    pub fn new(retries_left: u32) -> Self {
        Self {
            status: StepStatus::Pending,
            result: None,
            failure: None,
            correlation_id: None,
            dispatched_at: None,
            retries_left,
            dispatch_count: 0,
            last_retry_at: None,
        }
    }
}

/// Final outcome delivered through the task handle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub failure: Option<StepFailure>,
}

/// Full runtime state of one submitted task
#[derive(Debug, Clone)]
pub struct TaskState {
    pub task_id: String,
    pub description: String,
    pub input: Value,
    pub plan: StrategyPlan,
    /// Completed step results, readable by later stages
    pub step_results: HashMap<String, Value>,
    pub steps: HashMap<String, StepRuntime>,
    pub overall_status: TaskStatus,
    pub current_stage_index: usize,
    pub submitted_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    /// Persist the final result as a learned fact when set
    pub learn: bool,
}

impl TaskState {
    /// Step ids of the current stage, in plan order
    pub fn current_stage_step_ids(&self) -> Vec<String> {
        self.plan
            .stages
            .get(self.current_stage_index)
            .map(|stage| {
                stage
                    .steps()
                    .iter()
                    .map(|s| s.step_id().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True when every step of the current stage is terminal
    pub fn current_stage_joined(&self) -> bool {
        self.current_stage_step_ids().iter().all(|id| {
            self.steps
                .get(id)
                .map(|rt| rt.status.is_terminal())
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_status_terminality() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::FailedTerminal.is_terminal());
        assert!(!StepStatus::WaitingResult.is_terminal());
        assert!(!StepStatus::FailedRetry.is_terminal());
    }

    #[test]
    fn test_failure_kind_serialization() {
        let failure = StepFailure::new(FailureKind::CapabilityNotFound, "no match");
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["kind"], "capability_not_found");
        assert_eq!(FailureKind::CapabilityNotFound.to_string(), "no_capability");
    }

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::WaitingHsp.to_string(), "waiting_hsp");
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Merging.is_terminal());
    }
}
