//! # Admin Surface
//!
//! Read-only, best-effort HTTP endpoints:
//!
//! - `GET /v1/health` — liveness
//! - `GET /v1/status` — the full status document (drain state, in-flight
//!   tasks, federation/memory/registry gauges)
//!
//! The shape is fixed; the transport is plain JSON over HTTP.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tracing::info;

use synapse_ham::HamStore;
use synapse_hsp::{HspConnector, ServiceRegistry};

use crate::orchestration::core::OrchestratorHandle;
use crate::orchestration::status::{HamStatus, HspStatus, RegistryStatus, StatusSnapshot};

/// References the admin router reads from
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: OrchestratorHandle,
    pub connector: Option<Arc<HspConnector>>,
    pub registry: Option<Arc<ServiceRegistry>>,
    pub ham: Option<Arc<HamStore>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("connector", &self.connector.is_some())
            .field("registry", &self.registry.is_some())
            .field("ham", &self.ham.is_some())
            .finish()
    }
}

/// Build the admin router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(get_health))
        .route("/v1/status", get(get_status))
        .with_state(state)
}

/// Bind and serve the admin router until the process exits
pub async fn serve(router: Router, bind_address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!(address = %bind_address, "Admin surface listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn get_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let orchestrator = match state.orchestrator.status().await {
        Ok(status) => status,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };

    let hsp = state.connector.as_ref().map(|connector| HspStatus {
        connected: connector.is_connected(),
        pending_acks: connector.pending_ack_count(),
        active_retries: orchestrator.active_retries,
    });

    let ham = match &state.ham {
        Some(ham) => Some(HamStatus {
            record_count: ham.count().await,
            refused_writes: ham.refused_writes(),
        }),
        None => None,
    };

    let registry = state.registry.as_ref().map(|registry| {
        let snapshot = registry.snapshot();
        RegistryStatus {
            capabilities: snapshot.capabilities,
            peers_online: snapshot.peers_online,
        }
    });

    let snapshot = StatusSnapshot {
        draining: orchestrator.draining,
        tasks_in_flight: orchestrator.tasks_in_flight,
        tasks_by_state: orchestrator.tasks_by_state,
        hsp,
        ham,
        registry,
    };

    Json(snapshot).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use synapse_shared::config::SynapseConfig;

    #[tokio::test]
    async fn test_status_document_shape() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SynapseConfig::default();
        config.ham.storage_path = dir.path().join("ham.json");
        let node = crate::orchestration::bootstrap::bootstrap(config).await.unwrap();

        let state = AppState {
            orchestrator: node.orchestrator.clone(),
            connector: Some(Arc::clone(&node.connector)),
            registry: Some(Arc::clone(&node.registry)),
            ham: Some(Arc::clone(&node.ham)),
        };

        let response = get_status(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let document: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(document["draining"], false);
        assert_eq!(document["tasks_in_flight"], 0);
        assert_eq!(document["hsp"]["connected"], true);
        assert_eq!(document["ham"]["record_count"], 0);
        assert_eq!(document["registry"]["capabilities"], 0);

        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_subsystems_are_null() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SynapseConfig::default();
        config.ham.storage_path = dir.path().join("ham.json");
        let node = crate::orchestration::bootstrap::bootstrap(config).await.unwrap();

        let state = AppState {
            orchestrator: node.orchestrator.clone(),
            connector: None,
            registry: None,
            ham: None,
        };

        let response = get_status(State(state)).await.into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let document: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert!(document["hsp"].is_null());
        assert!(document["ham"].is_null());
        assert!(document["registry"].is_null());

        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = get_health().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
