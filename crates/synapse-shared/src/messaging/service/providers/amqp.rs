//! # AMQP Substrate
//!
//! Broker-backed substrate provider over a topic exchange. Topic patterns
//! translate to AMQP routing keys (`/` → `.`, `+` → `*`, `#` unchanged), so
//! wildcard subscriptions keep their semantics. Publisher confirms provide
//! at-least-once delivery for `QosLevel::AtLeastOnce`.
//!
//! A supervisor task watches the connection and reconnects with bounded
//! exponential backoff, re-declaring the exchange and restoring every
//! subscription. The broker has no retained-message concept; retained
//! publishes degrade to plain publishes and liveness is carried by the
//! registry's TTL staleness instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::ReconnectConfig;
use crate::messaging::service::SubstrateService;
use crate::messaging::types::{InboundMessage, QosLevel, SubstrateError};

/// Exchange all synapse traffic flows through
const EXCHANGE_NAME: &str = "synapse.topic";

/// Buffer size for per-subscriber channels
const SUBSCRIBER_BUFFER_SIZE: usize = 256;

/// Supervisor poll interval while connected
const SUPERVISOR_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Translate a substrate topic pattern into an AMQP binding key
fn pattern_to_binding_key(pattern: &str) -> String {
    pattern.replace('/', ".").replace('+', "*")
}

/// Translate a concrete topic into an AMQP routing key
fn topic_to_routing_key(topic: &str) -> String {
    topic.replace('/', ".")
}

/// Translate an inbound routing key back into a substrate topic
fn routing_key_to_topic(routing_key: &str) -> String {
    routing_key.replace('.', "/")
}

#[derive(Debug, Clone)]
struct AmqpSubscription {
    pattern: String,
    tx: mpsc::Sender<InboundMessage>,
}

struct AmqpShared {
    connection: Mutex<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
    subscriptions: Mutex<Vec<AmqpSubscription>>,
    connected: AtomicBool,
    shutdown: AtomicBool,
    supervisor_started: AtomicBool,
}

impl std::fmt::Debug for AmqpShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpShared")
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

/// AMQP-backed substrate provider
#[derive(Debug, Clone)]
pub struct AmqpSubstrate {
    url: String,
    reconnect: ReconnectConfig,
    shared: Arc<AmqpShared>,
}

impl AmqpSubstrate {
    pub fn new(url: impl Into<String>, reconnect: ReconnectConfig) -> Self {
        Self {
            url: url.into(),
            reconnect,
            shared: Arc::new(AmqpShared {
                connection: Mutex::new(None),
                channel: RwLock::new(None),
                subscriptions: Mutex::new(Vec::new()),
                connected: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                supervisor_started: AtomicBool::new(false),
            }),
        }
    }

    /// Open a connection and channel, declare the exchange, and restore any
    /// existing subscriptions onto the fresh channel.
    async fn establish(&self) -> Result<(), SubstrateError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| SubstrateError::Connection(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| SubstrateError::Connection(e.to_string()))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| SubstrateError::Connection(e.to_string()))?;

        channel
            .exchange_declare(
                EXCHANGE_NAME,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| SubstrateError::Connection(e.to_string()))?;

        let subscriptions: Vec<AmqpSubscription> = {
            let subs = self.shared.subscriptions.lock().await;
            subs.clone()
        };
        for sub in subscriptions {
            Self::bind_and_consume(&channel, &sub.pattern, sub.tx.clone()).await?;
        }

        *self.shared.connection.lock().await = Some(connection);
        *self.shared.channel.write().await = Some(channel);
        self.shared.connected.store(true, Ordering::Release);

        info!(url = %self.url, "AMQP substrate connected");
        Ok(())
    }

    /// Declare a server-named exclusive queue bound to the pattern and spawn
    /// the delivery-forwarding task.
    async fn bind_and_consume(
        channel: &Channel,
        pattern: &str,
        tx: mpsc::Sender<InboundMessage>,
    ) -> Result<(), SubstrateError> {
        let binding_key = pattern_to_binding_key(pattern);

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| SubstrateError::subscribe(pattern, e))?;

        channel
            .queue_bind(
                queue.name().as_str(),
                EXCHANGE_NAME,
                &binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| SubstrateError::subscribe(pattern, e))?;

        let mut consumer = channel
            .basic_consume(
                queue.name().as_str(),
                &format!("synapse-{}", uuid::Uuid::new_v4()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| SubstrateError::subscribe(pattern, e))?;

        let pattern_owned = pattern.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let topic = routing_key_to_topic(delivery.routing_key.as_str());
                        let message = InboundMessage {
                            topic,
                            payload: delivery.data.clone(),
                        };
                        if tx.send(message).await.is_err() {
                            debug!(pattern = %pattern_owned, "Subscriber dropped, ending consumer");
                            break;
                        }
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            warn!(pattern = %pattern_owned, error = %e, "Failed to ack delivery");
                        }
                    }
                    Err(e) => {
                        warn!(pattern = %pattern_owned, error = %e, "Consumer stream error");
                        break;
                    }
                }
            }
            debug!(pattern = %pattern_owned, "Consumer task ended");
        });

        Ok(())
    }

    /// Start the connection supervisor once. It polls connection liveness and
    /// reconnects with exponential backoff when the transport drops.
    fn start_supervisor(&self) {
        if self
            .shared
            .supervisor_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SUPERVISOR_POLL_INTERVAL).await;

                if this.shared.shutdown.load(Ordering::Acquire) {
                    break;
                }

                let alive = {
                    let guard = this.shared.connection.lock().await;
                    guard
                        .as_ref()
                        .map(|c| c.status().connected())
                        .unwrap_or(false)
                };
                if alive {
                    continue;
                }

                if !this.shared.connected.load(Ordering::Acquire) {
                    // Never connected or deliberately disconnected
                    continue;
                }

                this.shared.connected.store(false, Ordering::Release);
                error!("AMQP connection lost, starting reconnect loop");
                this.reconnect_loop().await;
            }
        });
    }

    /// Bounded reconnect loop with exponential backoff and jitter
    async fn reconnect_loop(&self) {
        let mut delay = Duration::from_secs(self.reconnect.initial_delay_s.max(1));
        let max_delay = Duration::from_secs(self.reconnect.max_delay_s.max(1));

        for attempt in 1..=self.reconnect.max_retries {
            if self.shared.shutdown.load(Ordering::Acquire) {
                return;
            }

            let jitter = Duration::from_millis(fastrand::u64(0..250));
            tokio::time::sleep(delay + jitter).await;

            match self.establish().await {
                Ok(()) => {
                    info!(attempt = attempt, "AMQP reconnected, subscriptions restored");
                    return;
                }
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        max_retries = self.reconnect.max_retries,
                        error = %e,
                        "AMQP reconnect attempt failed"
                    );
                    delay = (delay * 2).min(max_delay);
                }
            }
        }

        error!(
            max_retries = self.reconnect.max_retries,
            "AMQP reconnect budget exhausted, substrate is down"
        );
    }
}

#[async_trait]
impl SubstrateService for AmqpSubstrate {
    async fn connect(&self) -> Result<(), SubstrateError> {
        if self.is_connected() {
            return Ok(());
        }
        self.shared.shutdown.store(false, Ordering::Release);
        self.establish().await?;
        self.start_supervisor();
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
    ) -> Result<(), SubstrateError> {
        let guard = self.shared.channel.read().await;
        let channel = guard.as_ref().ok_or(SubstrateError::NotConnected)?;

        let routing_key = topic_to_routing_key(topic);
        let confirm = channel
            .basic_publish(
                EXCHANGE_NAME,
                &routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| SubstrateError::publish(topic, e))?;

        if qos >= QosLevel::AtLeastOnce {
            let confirmation = confirm.await.map_err(|e| SubstrateError::publish(topic, e))?;
            if confirmation.is_nack() {
                return Err(SubstrateError::publish(topic, "broker nacked publish"));
            }
        }

        Ok(())
    }

    async fn publish_retained(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
    ) -> Result<(), SubstrateError> {
        // No native retention on a topic exchange; deliver to current
        // subscribers only. Liveness gaps are covered by registry TTLs.
        self.publish(topic, payload, qos).await
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<InboundMessage>, SubstrateError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER_SIZE);

        {
            let guard = self.shared.channel.read().await;
            let channel = guard.as_ref().ok_or(SubstrateError::NotConnected)?;
            Self::bind_and_consume(channel, pattern, tx.clone()).await?;
        }

        let mut subs = self.shared.subscriptions.lock().await;
        subs.push(AmqpSubscription {
            pattern: pattern.to_string(),
            tx,
        });

        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), SubstrateError> {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.connected.store(false, Ordering::Release);

        if let Some(channel) = self.shared.channel.write().await.take() {
            let _ = channel.close(200, "shutdown").await;
        }
        if let Some(connection) = self.shared.connection.lock().await.take() {
            let _ = connection.close(200, "shutdown").await;
        }

        info!("AMQP substrate disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn provider_name(&self) -> &'static str {
        "amqp"
    }
}
