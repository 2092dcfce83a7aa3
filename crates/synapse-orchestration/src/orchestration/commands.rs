//! # Orchestrator Commands
//!
//! Every mutation of task state arrives as a command on one channel, so the
//! orchestrator performs at most one state transition per task at a time.
//! Request-response commands carry a `oneshot` responder; executor and timer
//! callbacks are fire-and-forget.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use synapse_hsp::TaskResultPayload;
use synapse_shared::models::{StepFailure, StrategyPlan, TaskOutcome};
use synapse_shared::SynapseResult;

use super::status::OrchestratorStatus;

/// Type alias for command response channels
pub type CommandResponder<T> = oneshot::Sender<SynapseResult<T>>;

/// A caller's request to run a task
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub description: String,
    pub input: Value,
    /// Absent: the trivial single-`local_llm` plan is used
    pub plan: Option<StrategyPlan>,
    /// Absent: a fresh id is generated
    pub task_id: Option<String>,
    /// Persist the final result as a learned fact
    pub learn: bool,
    /// Overall task deadline
    pub deadline: Option<Duration>,
}

impl TaskSubmission {
    pub fn new(description: impl Into<String>, input: Value) -> Self {
        Self {
            description: description.into(),
            input,
            plan: None,
            task_id: None,
            learn: false,
            deadline: None,
        }
    }

    pub fn with_plan(mut self, plan: StrategyPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_learn(mut self, learn: bool) -> Self {
        self.learn = learn;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Accepted submission: the task id plus the outcome channel
pub type TaskAccepted = (String, oneshot::Receiver<TaskOutcome>);

/// Commands processed by the orchestrator loop
#[derive(Debug)]
pub enum OrchestratorCommand {
    /// Accept a task (rejected with `Draining` while draining)
    Submit {
        submission: TaskSubmission,
        resp: CommandResponder<TaskAccepted>,
    },
    /// A spawned local step finished
    LocalStepFinished {
        task_id: String,
        step_id: String,
        outcome: Result<Value, StepFailure>,
    },
    /// A correlated peer result arrived through the connector
    PeerResult {
        task_id: String,
        step_id: String,
        result: TaskResultPayload,
    },
    /// A peer step's retry delay elapsed
    RetryDue { task_id: String, step_id: String },
    /// The task-level deadline expired
    TaskDeadline { task_id: String },
    /// Stop accepting new tasks; in-flight tasks finish
    EnterDrain { resp: CommandResponder<()> },
    /// Resume accepting tasks
    ExitDrain { resp: CommandResponder<()> },
    /// Snapshot the orchestrator-owned status fields
    GetStatus {
        resp: CommandResponder<OrchestratorStatus>,
    },
    /// Stop the command loop
    Shutdown { resp: CommandResponder<()> },
}
