//! # Substrate Service
//!
//! The provider contract and the enum that dispatches over concrete
//! providers. Enum dispatch keeps the hot path free of trait objects; the
//! trait exists so providers share one contract and tests can exercise it
//! uniformly.

pub mod providers;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{InboundMessage, QosLevel, SubstrateError};
pub use providers::{AmqpSubstrate, InMemorySubstrate};

/// Contract every substrate provider implements.
///
/// Semantics required of implementations:
/// - `publish` is at-least-once for `QosLevel::AtLeastOnce` and ordered
///   per (sender, topic); ordering across topics is not guaranteed.
/// - `subscribe` delivers every matching message to the returned channel
///   until the receiver is dropped.
/// - After a transport loss, implementations reconnect with bounded
///   exponential backoff and restore existing subscriptions.
#[async_trait]
pub trait SubstrateService: Send + Sync {
    /// Establish the transport. Idempotent.
    async fn connect(&self) -> Result<(), SubstrateError>;

    /// Publish a payload on a concrete topic
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
    ) -> Result<(), SubstrateError>;

    /// Publish a payload retained for future subscribers (liveness/status).
    /// Providers without native retention treat this as a plain publish.
    async fn publish_retained(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
    ) -> Result<(), SubstrateError>;

    /// Subscribe to a topic pattern (`+`/`#` wildcards)
    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<InboundMessage>, SubstrateError>;

    /// Tear down the transport, announcing offline status best-effort
    async fn disconnect(&self) -> Result<(), SubstrateError>;

    fn is_connected(&self) -> bool;

    fn provider_name(&self) -> &'static str;
}

/// Concrete substrate providers, enum-dispatched
#[derive(Debug)]
pub enum SubstrateProvider {
    InMemory(InMemorySubstrate),
    Amqp(AmqpSubstrate),
}

impl SubstrateProvider {
    /// In-process bus for tests and single-node deployments
    pub fn new_in_memory() -> Self {
        SubstrateProvider::InMemory(InMemorySubstrate::new())
    }

    pub async fn connect(&self) -> Result<(), SubstrateError> {
        match self {
            SubstrateProvider::InMemory(p) => p.connect().await,
            SubstrateProvider::Amqp(p) => p.connect().await,
        }
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
    ) -> Result<(), SubstrateError> {
        match self {
            SubstrateProvider::InMemory(p) => p.publish(topic, payload, qos).await,
            SubstrateProvider::Amqp(p) => p.publish(topic, payload, qos).await,
        }
    }

    pub async fn publish_retained(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
    ) -> Result<(), SubstrateError> {
        match self {
            SubstrateProvider::InMemory(p) => p.publish_retained(topic, payload, qos).await,
            SubstrateProvider::Amqp(p) => p.publish_retained(topic, payload, qos).await,
        }
    }

    pub async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<InboundMessage>, SubstrateError> {
        match self {
            SubstrateProvider::InMemory(p) => p.subscribe(pattern).await,
            SubstrateProvider::Amqp(p) => p.subscribe(pattern).await,
        }
    }

    pub async fn disconnect(&self) -> Result<(), SubstrateError> {
        match self {
            SubstrateProvider::InMemory(p) => p.disconnect().await,
            SubstrateProvider::Amqp(p) => p.disconnect().await,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            SubstrateProvider::InMemory(p) => p.is_connected(),
            SubstrateProvider::Amqp(p) => p.is_connected(),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            SubstrateProvider::InMemory(p) => p.provider_name(),
            SubstrateProvider::Amqp(p) => p.provider_name(),
        }
    }
}
