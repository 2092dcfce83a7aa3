//! # Domain Models
//!
//! Plan and task shapes shared between the orchestrator, the federation
//! layer, and the admin surface.

pub mod plan;
pub mod task;

pub use plan::{
    LocalStepKind, LocalStepSpec, PeerStepSpec, Stage, StepSpec, StrategyPlan,
};
pub use task::{
    FailureKind, StepFailure, StepRuntime, StepStatus, TaskOutcome, TaskState, TaskStatus,
};
