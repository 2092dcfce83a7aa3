//! # Peer Service
//!
//! Serves inbound `TaskRequest`s from remote peers: maps the requested
//! capability to a locally registered tool, invokes it through the
//! dispatcher, and publishes the correlated `TaskResult` back on the
//! requester's callback topic.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use synapse_hsp::{
    CapabilityAdvertisement, HspConnector, TaskRequestPayload, TaskResultPayload,
};

use crate::dispatcher::{ToolDispatcher, ToolResult};

/// Serves this node's advertised capabilities to the federation
#[derive(Debug)]
pub struct PeerService {
    dispatcher: Arc<ToolDispatcher>,
    connector: Arc<HspConnector>,
    /// capability_id -> local tool name
    served: RwLock<HashMap<String, String>>,
}

impl PeerService {
    pub fn new(dispatcher: Arc<ToolDispatcher>, connector: Arc<HspConnector>) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            connector,
            served: RwLock::new(HashMap::new()),
        })
    }

    /// Advertise a capability backed by a locally registered tool
    pub async fn serve_capability(
        &self,
        advertisement: CapabilityAdvertisement,
        tool_name: impl Into<String>,
    ) -> Result<(), synapse_hsp::HspError> {
        let tool_name = tool_name.into();
        {
            let mut served = self.served.write().unwrap_or_else(|p| p.into_inner());
            served.insert(advertisement.capability_id.clone(), tool_name);
        }
        self.connector.advertise_capability(&advertisement).await
    }

    fn tool_for(&self, capability_id: &str) -> String {
        let served = self.served.read().unwrap_or_else(|p| p.into_inner());
        served
            .get(capability_id)
            .cloned()
            .unwrap_or_else(|| capability_id.to_string())
    }

    /// Handle one inbound request; spawned per request by the node's event
    /// loop so a slow tool never blocks routing.
    pub async fn handle_request(
        self: Arc<Self>,
        request: TaskRequestPayload,
        correlation_id: Option<Uuid>,
        sender_ai_id: String,
    ) {
        debug!(
            capability_id = %request.capability_id,
            requester = %request.requester_ai_id,
            "Serving peer task request"
        );

        let tool_name = self.tool_for(&request.capability_id);
        let invocation = self
            .dispatcher
            .invoke(&tool_name, request.parameters.clone())
            .await;

        let result = match invocation {
            ToolResult::Success { payload } => TaskResultPayload::success(
                request.request_id,
                correlation_id,
                self.connector.ai_id(),
                payload,
            ),
            ToolResult::Error { kind, message } => TaskResultPayload::error(
                request.request_id,
                correlation_id,
                self.connector.ai_id(),
                kind,
                message,
            ),
        };

        if let Err(e) = self
            .connector
            .send_task_result(&sender_ai_id, &request.callback_address, correlation_id, &result)
            .await
        {
            warn!(
                requester = %sender_ai_id,
                error = %e,
                "Failed to publish task result to requester"
            );
        }
    }

    /// Capability ids this node currently serves
    pub fn served_capabilities(&self) -> Vec<String> {
        let served = self.served.read().unwrap_or_else(|p| p.into_inner());
        served.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use synapse_shared::messaging::{SubstrateClient, SubstrateProvider};

    struct Echo;

    #[async_trait]
    impl crate::dispatcher::ToolHandler for Echo {
        async fn call(&self, params: Value) -> Result<Value, String> {
            Ok(params)
        }
    }

    #[tokio::test]
    async fn test_capability_maps_to_tool() {
        let dispatcher = Arc::new(ToolDispatcher::new(Duration::from_secs(1)));
        dispatcher.register_tool("echo", Arc::new(Echo), vec![]);

        let provider = Arc::new(SubstrateProvider::new_in_memory());
        let client = SubstrateClient::new(provider);
        let registry = Arc::new(synapse_hsp::ServiceRegistry::new(Duration::from_secs(60)));
        let (connector, _events) =
            HspConnector::new("node1", client, registry, Default::default());
        connector.start().await.unwrap();

        let service = PeerService::new(dispatcher, connector);
        service
            .serve_capability(
                CapabilityAdvertisement {
                    capability_id: "cap:echo".to_string(),
                    ai_id: "node1".to_string(),
                    name: "echo".to_string(),
                    description: String::new(),
                    version: "1.0".to_string(),
                    input_schema: None,
                    output_schema: None,
                    tags: Vec::new(),
                    availability_status: Default::default(),
                },
                "echo",
            )
            .await
            .unwrap();

        assert_eq!(service.tool_for("cap:echo"), "echo");
        assert_eq!(service.tool_for("cap:unmapped"), "cap:unmapped");
        assert_eq!(service.served_capabilities(), vec!["cap:echo".to_string()]);
    }
}
