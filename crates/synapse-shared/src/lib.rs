//! # Synapse Shared
//!
//! Shared components for the synapse orchestration and memory systems:
//! the error taxonomy, declarative configuration, plan/task models, the
//! messaging substrate (provider enum + client facade), and resilience
//! primitives used by every other crate in the workspace.

pub mod config;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod resilience;

pub use error::{SynapseError, SynapseResult};
