//! Memory store error taxonomy

use thiserror::Error;

/// Errors surfaced by the memory store and its primitives
#[derive(Debug, Error)]
pub enum HamError {
    /// Decryption or checksum verification failed; the record is suspect
    #[error("Integrity failure: {0}")]
    Integrity(String),

    /// Decompression of a decrypted payload failed
    #[error("Corruption failure: {0}")]
    Corruption(String),

    /// Key material could not be loaded or decoded
    #[error("Invalid key material: {0}")]
    Key(String),

    #[error("Memory store I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Memory store serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}
