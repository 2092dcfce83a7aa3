//! # Synapse Orchestration
//!
//! The meta-task orchestrator: decomposes a complex task into staged
//! processing steps, dispatches them locally through the tool dispatcher or
//! to remote peers over the federation layer, tracks correlations, and
//! handles retries, timeouts, and result aggregation.
//!
//! All task state transitions are serialized on a single command loop
//! ([`orchestration::core`]); local executors and timers communicate with it
//! exclusively through commands.

pub mod chunker;
pub mod dispatcher;
pub mod input_resolver;
pub mod orchestration;
pub mod web;

pub use dispatcher::{LlmBackend, ToolDispatcher, ToolHandler, ToolResult};
pub use orchestration::bootstrap::{bootstrap, NodeHandle};
pub use orchestration::commands::TaskSubmission;
pub use orchestration::core::{Orchestrator, OrchestratorHandle, TaskHandle};
pub use orchestration::status::StatusSnapshot;
