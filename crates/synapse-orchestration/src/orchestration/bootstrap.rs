//! # Node Bootstrap
//!
//! Explicit dependency wiring for a synapse node: construct the memory
//! store, substrate client, registry, connector, tool dispatcher, and
//! orchestrator as distinct objects and pass them down. No module-level
//! singletons; the admin surface receives its references through
//! [`crate::web::AppState`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use synapse_ham::crypto::MemoryCipher;
use synapse_ham::HamStore;
use synapse_hsp::{HspConnector, ServiceRegistry};
use synapse_shared::config::{SubstrateProviderKind, SynapseConfig};
use synapse_shared::messaging::service::providers::AmqpSubstrate;
use synapse_shared::messaging::{SubstrateClient, SubstrateProvider};
use synapse_shared::resilience::{CircuitBreaker, CircuitBreakerConfig};
use synapse_shared::{SynapseError, SynapseResult};

use crate::dispatcher::ToolDispatcher;

use super::core::{Orchestrator, OrchestratorHandle};
use super::learning::LearningAdapter;
use super::peer_service::PeerService;

/// A running node's components and join handles
#[derive(Debug)]
pub struct NodeHandle {
    pub config: SynapseConfig,
    pub orchestrator: OrchestratorHandle,
    pub connector: Arc<HspConnector>,
    pub registry: Arc<ServiceRegistry>,
    pub ham: Arc<HamStore>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub peer_service: Arc<PeerService>,
    orchestrator_join: JoinHandle<()>,
    sweeper_join: JoinHandle<()>,
}

impl NodeHandle {
    /// Stop the node: announce offline, stop the command loop, stop the
    /// sweeper, and disconnect the substrate.
    pub async fn stop(self) -> SynapseResult<()> {
        let _ = self.connector.announce(false).await;
        self.orchestrator.shutdown().await?;
        self.sweeper_join.abort();
        let _ = self.orchestrator_join.await;
        self.connector
            .disconnect()
            .await
            .map_err(|e| SynapseError::Messaging(e.to_string()))?;
        Ok(())
    }

    /// Poll the orchestrator until no tasks are in flight or the timeout
    /// elapses. Used with drain-on-shutdown.
    pub async fn drain_until_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.orchestrator.status().await {
                Ok(status) if status.tasks_in_flight == 0 => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Construct and start every component of a node from its configuration.
///
/// The returned dispatcher is empty; callers register tools and model
/// backends before (or after) submitting work.
pub async fn bootstrap(config: SynapseConfig) -> SynapseResult<NodeHandle> {
    let provider = match config.substrate.provider {
        SubstrateProviderKind::InMemory => SubstrateProvider::new_in_memory(),
        SubstrateProviderKind::Amqp => SubstrateProvider::Amqp(AmqpSubstrate::new(
            config.substrate.url.clone(),
            config.substrate.reconnect.clone(),
        )),
    };
    let breaker = Arc::new(CircuitBreaker::new(
        "substrate".to_string(),
        CircuitBreakerConfig::default(),
    ));
    let client = SubstrateClient::with_circuit_breaker(Arc::new(provider), breaker);

    let registry = Arc::new(ServiceRegistry::new(Duration::from_secs(
        config.registry.capability_ttl_s,
    )));
    let sweeper_join =
        registry.spawn_sweeper(Duration::from_secs(config.registry.sweep_interval_s));

    let ham = Arc::new(
        HamStore::open(&config.ham, &config.resource_profile, MemoryCipher::from_env())
            .await
            .map_err(|e| SynapseError::Memory(e.to_string()))?,
    );

    let (connector, hsp_events) = HspConnector::new(
        config.ai_id.clone(),
        client,
        Arc::clone(&registry),
        config.hsp.clone(),
    );
    connector
        .start()
        .await
        .map_err(|e| SynapseError::Messaging(e.to_string()))?;

    let dispatcher = Arc::new(ToolDispatcher::new(Duration::from_secs(
        config.orchestrator.tool_timeout_s,
    )));
    let peer_service = PeerService::new(Arc::clone(&dispatcher), Arc::clone(&connector));
    let learning = LearningAdapter::new(Arc::clone(&ham), config.ai_id.clone());

    let (orchestrator, handle) = Orchestrator::new(
        config.ai_id.clone(),
        config.orchestrator.clone(),
        config.hsp.clone(),
        Arc::clone(&dispatcher),
        Arc::clone(&connector),
        Arc::clone(&registry),
        hsp_events,
        Some(learning),
        Some(Arc::clone(&peer_service)),
        Some(Arc::clone(&ham)),
    );
    let orchestrator_join = orchestrator.spawn();

    info!(
        ai_id = %config.ai_id,
        substrate = ?config.substrate.provider,
        ham_path = %config.ham.storage_path.display(),
        "Synapse node bootstrapped"
    );

    Ok(NodeHandle {
        config,
        orchestrator: handle,
        connector,
        registry,
        ham,
        dispatcher,
        peer_service,
        orchestrator_join,
        sweeper_join,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bootstrap_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SynapseConfig::default();
        config.ham.storage_path = dir.path().join("ham.json");

        let node = bootstrap(config).await.unwrap();
        assert!(node.connector.is_connected());
        assert_eq!(node.ham.count().await, 0);

        let status = node.orchestrator.status().await.unwrap();
        assert_eq!(status.tasks_in_flight, 0);
        assert!(!status.draining);

        node.stop().await.unwrap();
    }
}
