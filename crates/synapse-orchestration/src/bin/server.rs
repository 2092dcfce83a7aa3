//! # Synapse Node Server
//!
//! Thin wrapper binary for running a synapse node as a standalone server:
//! orchestrator, federation connector, memory store, and the read-only admin
//! surface.
//!
//! ## Usage
//!
//! ```bash
//! # Run with defaults (in-memory substrate, config/synapse.toml if present)
//! cargo run --bin synapse-server
//!
//! # Point at a broker and a config file
//! SYNAPSE_CONFIG_PATH=/etc/synapse/node.toml cargo run --bin synapse-server
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{error, info, warn};

use synapse_orchestration::web;
use synapse_shared::config::SynapseConfig;
use synapse_shared::logging;

/// Upper bound on graceful shutdown, drain included
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    info!("Starting Synapse Node Server...");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));

    let config = SynapseConfig::load()?;
    let drain_on_shutdown = config.orchestrator.drain_on_shutdown;
    let web_config = config.web.clone();

    let node = synapse_orchestration::bootstrap(config).await?;

    if web_config.enabled {
        let state = web::AppState {
            orchestrator: node.orchestrator.clone(),
            connector: Some(Arc::clone(&node.connector)),
            registry: Some(Arc::clone(&node.registry)),
            ham: Some(Arc::clone(&node.ham)),
        };
        let router = web::router(state);
        let bind_address = web_config.bind_address.clone();
        tokio::spawn(async move {
            if let Err(e) = web::serve(router, &bind_address).await {
                error!(error = %e, "Admin surface stopped");
            }
        });
        info!("   Admin surface: http://{}/v1/status", web_config.bind_address);
    }

    info!("   Node id: {}", node.config.ai_id);
    info!("   Press Ctrl+C to shutdown gracefully");

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    if drain_on_shutdown {
        if let Err(e) = node.orchestrator.enter_drain().await {
            warn!(error = %e, "Failed to enter drain mode");
        } else if node.drain_until_idle(SHUTDOWN_TIMEOUT).await {
            info!("Drain complete, no tasks in flight");
        } else {
            warn!("Drain timed out with tasks still in flight");
        }
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, node.stop()).await {
        Ok(Ok(())) => info!("Node stopped"),
        Ok(Err(e)) => error!(error = %e, "Failed to stop node cleanly"),
        Err(_) => error!(
            timeout_s = SHUTDOWN_TIMEOUT.as_secs(),
            "Graceful shutdown timed out, forcing exit"
        ),
    }

    info!("Synapse Node Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
