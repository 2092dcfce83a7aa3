//! # Error Taxonomy
//!
//! Top-level error type shared across the workspace. Domain crates define
//! their own `thiserror` enums (`HamError`, `SubstrateError`, `HspError`, ...)
//! and convert into `SynapseError` at crate boundaries. The orchestrator
//! never lets any of these escape its public entry points: failures are
//! recorded as structured step/task failures instead (see
//! `synapse_shared::models::task::StepFailure`).

use thiserror::Error;

/// Result type used across the synapse workspace
pub type SynapseResult<T> = Result<T, SynapseError>;

/// Top-level error for cross-crate boundaries
#[derive(Debug, Error)]
pub enum SynapseError {
    /// Configuration loading or validation failed
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Messaging substrate operation failed
    #[error("Messaging error: {0}")]
    Messaging(String),

    /// Memory store operation failed
    #[error("Memory error: {0}")]
    Memory(String),

    /// Orchestration operation failed
    #[error("Orchestration error: {0}")]
    Orchestration(String),

    /// Input failed structural validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Submission rejected because the process is draining
    #[error("Submission rejected: process is draining")]
    Draining,
}
