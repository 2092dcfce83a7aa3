//! # In-Memory Substrate
//!
//! In-process topic bus with full wildcard matching and retained-message
//! semantics. Backs every deterministic orchestration test and single-node
//! deployments that need no broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::messaging::service::SubstrateService;
use crate::messaging::types::{topic_matches, InboundMessage, QosLevel, SubstrateError};

/// Buffer size for per-subscriber channels
const SUBSCRIBER_BUFFER_SIZE: usize = 256;

#[derive(Debug)]
struct Subscription {
    pattern: String,
    tx: mpsc::Sender<InboundMessage>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    subscriptions: Mutex<Vec<Subscription>>,
    /// Retained payloads by concrete topic, replayed to new subscribers
    retained: Mutex<HashMap<String, Vec<u8>>>,
    connected: AtomicBool,
}

/// In-process substrate provider
#[derive(Debug, Clone, Default)]
pub struct InMemorySubstrate {
    inner: Arc<InMemoryState>,
}

impl InMemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a payload to every live subscription matching `topic`.
    ///
    /// Senders are collected under the lock, then awaited outside it;
    /// closed subscriptions are pruned on the way.
    async fn deliver(&self, topic: &str, payload: &[u8]) {
        let targets: Vec<mpsc::Sender<InboundMessage>> = {
            let mut subs = self
                .inner
                .subscriptions
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            subs.retain(|s| !s.tx.is_closed());
            subs.iter()
                .filter(|s| topic_matches(&s.pattern, topic))
                .map(|s| s.tx.clone())
                .collect()
        };

        for tx in targets {
            let message = InboundMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            };
            if tx.send(message).await.is_err() {
                warn!(topic = %topic, "In-memory subscriber receiver dropped");
            }
        }
    }
}

#[async_trait]
impl SubstrateService for InMemorySubstrate {
    async fn connect(&self) -> Result<(), SubstrateError> {
        self.inner.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        _qos: QosLevel,
    ) -> Result<(), SubstrateError> {
        if !self.is_connected() {
            return Err(SubstrateError::NotConnected);
        }
        self.deliver(topic, payload).await;
        Ok(())
    }

    async fn publish_retained(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
    ) -> Result<(), SubstrateError> {
        {
            let mut retained = self
                .inner
                .retained
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            retained.insert(topic.to_string(), payload.to_vec());
        }
        self.publish(topic, payload, qos).await
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<InboundMessage>, SubstrateError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER_SIZE);

        // Replay retained messages matching the new subscription first, so
        // liveness/status topics behave like a retained-will broker.
        let replays: Vec<(String, Vec<u8>)> = {
            let retained = self
                .inner
                .retained
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            retained
                .iter()
                .filter(|(topic, _)| topic_matches(pattern, topic))
                .map(|(topic, payload)| (topic.clone(), payload.clone()))
                .collect()
        };
        for (topic, payload) in replays {
            let _ = tx.send(InboundMessage { topic, payload }).await;
        }

        {
            let mut subs = self
                .inner
                .subscriptions
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            subs.push(Subscription {
                pattern: pattern.to_string(),
                tx,
            });
        }

        debug!(pattern = %pattern, "In-memory subscription added");
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), SubstrateError> {
        self.inner.connected.store(false, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_requires_connect() {
        let bus = InMemorySubstrate::new();
        let result = bus.publish("t", b"x", QosLevel::AtLeastOnce).await;
        assert!(matches!(result, Err(SubstrateError::NotConnected)));
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscriber() {
        let bus = InMemorySubstrate::new();
        bus.connect().await.unwrap();

        let mut rx = bus.subscribe("synapse/task/+").await.unwrap();
        bus.publish("synapse/task/node1", b"hello", QosLevel::AtLeastOnce)
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "synapse/task/node1");
        assert_eq!(msg.payload, b"hello");
    }

    #[tokio::test]
    async fn test_non_matching_subscriber_sees_nothing() {
        let bus = InMemorySubstrate::new();
        bus.connect().await.unwrap();

        let mut rx = bus.subscribe("synapse/results/#").await.unwrap();
        bus.publish("synapse/task/node1", b"hello", QosLevel::AtLeastOnce)
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retained_replayed_to_new_subscriber() {
        let bus = InMemorySubstrate::new();
        bus.connect().await.unwrap();

        bus.publish_retained("synapse/status/node1", b"online", QosLevel::AtLeastOnce)
            .await
            .unwrap();

        let mut rx = bus.subscribe("synapse/status/#").await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "synapse/status/node1");
        assert_eq!(msg.payload, b"online");
    }

    #[tokio::test]
    async fn test_per_topic_ordering() {
        let bus = InMemorySubstrate::new();
        bus.connect().await.unwrap();

        let mut rx = bus.subscribe("t/#").await.unwrap();
        for i in 0..10u8 {
            bus.publish("t/seq", &[i], QosLevel::AtLeastOnce)
                .await
                .unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(rx.recv().await.unwrap().payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_pruned() {
        let bus = InMemorySubstrate::new();
        bus.connect().await.unwrap();

        let rx = bus.subscribe("t/#").await.unwrap();
        drop(rx);

        // Publish after drop must not error
        bus.publish("t/x", b"y", QosLevel::AtLeastOnce).await.unwrap();
    }
}
