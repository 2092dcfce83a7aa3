//! # Substrate Client Facade
//!
//! Domain-level client over a `SubstrateProvider`. Publish operations are
//! optionally gated by a circuit breaker; subscribe, connect, and health
//! operations bypass it so recovery and observability keep working while the
//! breaker is open.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::debug;

use crate::resilience::CircuitBreaker;

use super::service::SubstrateProvider;
use super::types::{InboundMessage, QosLevel, SubstrateError};

/// Handler invoked for each delivered message
pub type MessageHandler = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;

/// Substrate client shared by the federation connector and the orchestrator
#[derive(Debug, Clone)]
pub struct SubstrateClient {
    provider: Arc<SubstrateProvider>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
}

impl SubstrateClient {
    /// Create a client without circuit breaker protection
    pub fn new(provider: Arc<SubstrateProvider>) -> Self {
        Self {
            provider,
            circuit_breaker: None,
        }
    }

    /// Create a client whose publish path is gated by a circuit breaker
    pub fn with_circuit_breaker(
        provider: Arc<SubstrateProvider>,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            provider,
            circuit_breaker: Some(circuit_breaker),
        }
    }

    pub fn provider(&self) -> &Arc<SubstrateProvider> {
        &self.provider
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.provider_name()
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.circuit_breaker.as_ref()
    }

    pub async fn connect(&self) -> Result<(), SubstrateError> {
        self.provider.connect().await
    }

    pub async fn disconnect(&self) -> Result<(), SubstrateError> {
        self.provider.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.provider.is_connected()
    }

    /// Publish a payload (PROTECTED)
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
    ) -> Result<(), SubstrateError> {
        self.with_breaker(|| self.provider.publish(topic, payload, qos))
            .await
    }

    /// Publish a retained status payload (PROTECTED)
    pub async fn publish_retained(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
    ) -> Result<(), SubstrateError> {
        self.with_breaker(|| self.provider.publish_retained(topic, payload, qos))
            .await
    }

    /// Subscribe to a topic pattern (UNPROTECTED)
    pub async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<InboundMessage>, SubstrateError> {
        self.provider.subscribe(pattern).await
    }

    /// Subscribe and drain deliveries into a handler on a spawned task.
    ///
    /// Satisfies the `handler(topic, payload_bytes)` contract; the task ends
    /// when the subscription closes.
    pub async fn subscribe_with_handler(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> Result<(), SubstrateError> {
        let mut rx = self.subscribe(pattern).await?;
        let pattern_owned = pattern.to_string();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                handler(message.topic, message.payload);
            }
            debug!(pattern = %pattern_owned, "Handler subscription ended");
        });

        Ok(())
    }

    async fn with_breaker<F, Fut>(&self, op: F) -> Result<(), SubstrateError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), SubstrateError>>,
    {
        if let Some(cb) = &self.circuit_breaker {
            if !cb.should_allow() {
                return Err(SubstrateError::CircuitOpen("substrate".to_string()));
            }
            let start = Instant::now();
            let result = op().await;
            match &result {
                Ok(_) => cb.record_success(start.elapsed()),
                Err(_) => cb.record_failure(start.elapsed()),
            }
            result
        } else {
            op().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn client() -> SubstrateClient {
        SubstrateClient::new(Arc::new(SubstrateProvider::new_in_memory()))
    }

    fn client_with_breaker() -> (SubstrateClient, Arc<CircuitBreaker>) {
        let provider = Arc::new(SubstrateProvider::new_in_memory());
        let breaker = Arc::new(CircuitBreaker::new(
            "substrate".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                timeout: Duration::from_millis(100),
                success_threshold: 1,
            },
        ));
        let client = SubstrateClient::with_circuit_breaker(provider, breaker.clone());
        (client, breaker)
    }

    #[tokio::test]
    async fn test_publish_subscribe_roundtrip() {
        let client = client();
        client.connect().await.unwrap();

        let mut rx = client.subscribe("a/+").await.unwrap();
        client
            .publish("a/b", b"payload", QosLevel::AtLeastOnce)
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "a/b");
        assert_eq!(msg.payload, b"payload");
    }

    #[tokio::test]
    async fn test_publish_blocked_when_circuit_open() {
        let (client, breaker) = client_with_breaker();
        client.connect().await.unwrap();

        breaker.force_open();
        let result = client.publish("a/b", b"x", QosLevel::AtLeastOnce).await;
        assert!(matches!(result, Err(SubstrateError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn test_subscribe_bypasses_circuit_breaker() {
        let (client, breaker) = client_with_breaker();
        client.connect().await.unwrap();

        breaker.force_open();
        assert!(client.subscribe("a/#").await.is_ok());
    }

    #[tokio::test]
    async fn test_success_updates_breaker_metrics() {
        let (client, breaker) = client_with_breaker();
        client.connect().await.unwrap();

        client
            .publish("a/b", b"x", QosLevel::AtLeastOnce)
            .await
            .unwrap();

        let metrics = breaker.metrics();
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 0);
    }

    #[tokio::test]
    async fn test_handler_subscription() {
        let client = client();
        client.connect().await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        client
            .subscribe_with_handler(
                "h/#",
                Arc::new(move |_topic, _payload| {
                    seen_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        client.publish("h/1", b"x", QosLevel::AtLeastOnce).await.unwrap();
        client.publish("h/2", b"y", QosLevel::AtLeastOnce).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
