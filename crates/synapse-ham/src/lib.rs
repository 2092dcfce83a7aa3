//! # Synapse HAM
//!
//! Hierarchical abstractive memory: a content-addressed, encrypted,
//! compressed, checksum-verified store of "gists" with structured metadata
//! and query-by-filter semantics. The orchestrator and peer services persist
//! intermediate artifacts and learned facts here.
//!
//! Layering, bottom up:
//!
//! - [`crypto`] — AES-256-GCM sealing and SHA-256 canonical checksums
//! - [`codec`] — zlib compression of serialized gists
//! - [`gist`] — abstraction of raw experience into summary + keywords
//! - [`store`] — the persistent keyed store and its query engine

pub mod codec;
pub mod crypto;
pub mod error;
pub mod gist;
pub mod store;

pub use error::HamError;
pub use gist::{abstract_text, Gist};
pub use store::{HamQuery, HamStore, RecallResult};
