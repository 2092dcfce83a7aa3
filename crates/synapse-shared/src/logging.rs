//! # Logging Initialization
//!
//! Single place to initialise `tracing` for binaries and integration tests.
//! Respects `RUST_LOG`; defaults to `info` for synapse crates and `warn`
//! for dependencies.

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Initialise the global tracing subscriber.
///
/// Idempotent: repeated calls (e.g. from multiple tests) are no-ops.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn,synapse_shared=info,synapse_ham=info,synapse_hsp=info,synapse_orchestration=info"));

        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}
