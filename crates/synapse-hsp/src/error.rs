//! Federation layer error taxonomy

use thiserror::Error;

use synapse_shared::messaging::SubstrateError;

/// Errors surfaced by the envelope layer and connector
#[derive(Debug, Error)]
pub enum HspError {
    /// Required envelope fields missing or malformed
    #[error("Envelope validation failed: {0}")]
    InvalidEnvelope(String),

    /// The substrate refused a publish
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}
