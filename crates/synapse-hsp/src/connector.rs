//! # HSP Connector
//!
//! Ties the envelope layer to the substrate: publishes enveloped payloads,
//! subscribes this node's topics, routes inbound traffic by `message_type`,
//! and owns the correlation and pending-ACK tables.
//!
//! Routing fan-out:
//!
//! ```text
//! TaskRequest            -> HspEvent::TaskRequest (served by the node)
//! TaskResult             -> correlation resolve -> HspEvent::TaskResult
//! CapabilityAdvertisement-> ServiceRegistry::register
//! Fact                   -> HspEvent::Fact
//! Acknowledgement        -> pending-ACK table
//! unknown message_type   -> logged and dropped
//! ```
//!
//! One sweeper task drains both deadline tables: expired correlations become
//! `HspEvent::RequestTimedOut`, and pending ACKs past their deadline get one
//! resend before `HspEvent::DeliveryFailed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use synapse_shared::config::HspConfig;
use synapse_shared::messaging::{QosLevel, SubstrateClient};

use crate::correlation::CorrelationTable;
use crate::envelope::{Envelope, MessageType, QosParameters, BROADCAST};
use crate::error::HspError;
use crate::payloads::{
    Acknowledgement, CapabilityAdvertisement, FactPayload, PeerLiveness, TaskRequestPayload,
    TaskResultPayload,
};
use crate::registry::ServiceRegistry;
use crate::topics;

/// Sweep cadence for the correlation and pending-ACK tables
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Resends attempted after a missed ACK deadline
const ACK_RESEND_BUDGET: u8 = 1;

/// Buffer size for the connector's outbound event channel
const EVENT_BUFFER_SIZE: usize = 256;

/// Events the connector surfaces to the rest of the node
#[derive(Debug)]
pub enum HspEvent {
    /// A correlated peer result routed back to its waiting step
    TaskResult {
        task_id: String,
        step_id: String,
        result: TaskResultPayload,
    },
    /// A peer asked this node to execute a capability
    TaskRequest {
        request: TaskRequestPayload,
        correlation_id: Option<Uuid>,
        sender_ai_id: String,
    },
    /// A shared fact arrived on the broadcast topic
    Fact(FactPayload),
    /// A dispatched request's correlation deadline passed with no result
    RequestTimedOut {
        task_id: String,
        step_id: String,
        correlation_id: Uuid,
    },
    /// An acked publish missed its deadline after the resend budget
    DeliveryFailed { message_id: Uuid, topic: String },
}

#[derive(Debug)]
struct PendingAck {
    envelope_bytes: Vec<u8>,
    topic: String,
    deadline: Instant,
    resends_left: u8,
}

/// The node's federation connector
#[derive(Debug)]
pub struct HspConnector {
    ai_id: String,
    client: SubstrateClient,
    registry: Arc<ServiceRegistry>,
    config: HspConfig,
    correlation: CorrelationTable,
    pending_acks: Mutex<HashMap<Uuid, PendingAck>>,
    event_tx: mpsc::Sender<HspEvent>,
    started: AtomicBool,
}

impl HspConnector {
    /// Build the connector and hand back the event stream it feeds
    pub fn new(
        ai_id: impl Into<String>,
        client: SubstrateClient,
        registry: Arc<ServiceRegistry>,
        config: HspConfig,
    ) -> (Arc<Self>, mpsc::Receiver<HspEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let connector = Arc::new(Self {
            ai_id: ai_id.into(),
            client,
            registry,
            config,
            correlation: CorrelationTable::new(),
            pending_acks: Mutex::new(HashMap::new()),
            event_tx,
            started: AtomicBool::new(false),
        });
        (connector, event_rx)
    }

    pub fn ai_id(&self) -> &str {
        &self.ai_id
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Tear down the underlying substrate connection
    pub async fn disconnect(&self) -> Result<(), HspError> {
        self.client.disconnect().await?;
        Ok(())
    }

    pub fn correlation_count(&self) -> usize {
        self.correlation.len()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Connect the substrate, subscribe this node's topics, start the ACK
    /// sweeper, and announce liveness. Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<(), HspError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.client.connect().await?;

        let envelope_patterns = [
            topics::task_requests(&self.ai_id),
            topics::task_results(&self.ai_id),
            topics::acks(&self.ai_id),
            topics::capabilities_pattern(),
            topics::facts_pattern(),
        ];
        for pattern in envelope_patterns {
            let mut rx = self.client.subscribe(&pattern).await?;
            let connector = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    connector.route(&message.topic, &message.payload).await;
                }
                debug!(pattern = %pattern, "Connector subscription ended");
            });
        }

        // Liveness announcements are raw (non-enveloped) status payloads
        let mut status_rx = self.client.subscribe(&topics::status_pattern()).await?;
        let connector = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = status_rx.recv().await {
                connector.route_status(&message.payload);
            }
        });

        self.spawn_sweeper();
        self.announce(true).await?;

        info!(ai_id = %self.ai_id, provider = self.client.provider_name(), "HSP connector started");
        Ok(())
    }

    /// Announce this node's liveness on the retained status topic
    pub async fn announce(&self, online: bool) -> Result<(), HspError> {
        let liveness = PeerLiveness {
            ai_id: self.ai_id.clone(),
            online,
            announced_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&liveness)?;
        self.client
            .publish_retained(&topics::status(&self.ai_id), &bytes, QosLevel::AtLeastOnce)
            .await?;
        Ok(())
    }

    /// Dispatch a `TaskRequest` to a peer with a fresh correlation id.
    ///
    /// The correlation is registered with `timeout` as its deadline before
    /// the publish, and forgotten again if the publish fails. The sweeper
    /// enforces the deadline: a correlation still unresolved past it is
    /// removed and surfaced as [`HspEvent::RequestTimedOut`].
    pub async fn dispatch_task_request(
        &self,
        target_ai_id: &str,
        capability_id: &str,
        parameters: Value,
        task_id: &str,
        step_id: &str,
        timeout: Duration,
    ) -> Result<Uuid, HspError> {
        let correlation_id = Uuid::new_v4();
        let payload = TaskRequestPayload {
            request_id: Uuid::new_v4(),
            capability_id: capability_id.to_string(),
            parameters,
            callback_address: topics::task_results(&self.ai_id),
            requester_ai_id: self.ai_id.clone(),
        };

        let envelope = Envelope::new(
            self.ai_id.clone(),
            target_ai_id,
            MessageType::TaskRequest,
            serde_json::to_value(&payload)?,
        )
        .with_correlation(correlation_id);

        self.correlation.insert(
            correlation_id,
            task_id.to_string(),
            step_id.to_string(),
            Instant::now() + timeout,
        );

        if let Err(e) = self
            .publish_envelope(&topics::task_requests(target_ai_id), &envelope)
            .await
        {
            self.correlation.forget(&correlation_id);
            return Err(e);
        }

        debug!(
            task_id = %task_id,
            step_id = %step_id,
            correlation_id = %correlation_id,
            target = %target_ai_id,
            capability_id = %capability_id,
            "Peer task request dispatched"
        );
        Ok(correlation_id)
    }

    /// Send a correlated `TaskResult` back to a requester's callback topic
    pub async fn send_task_result(
        &self,
        recipient_ai_id: &str,
        callback_topic: &str,
        correlation_id: Option<Uuid>,
        result: &TaskResultPayload,
    ) -> Result<(), HspError> {
        let mut envelope = Envelope::new(
            self.ai_id.clone(),
            recipient_ai_id,
            MessageType::TaskResult,
            serde_json::to_value(result)?,
        );
        if let Some(correlation_id) = correlation_id {
            envelope = envelope.with_correlation(correlation_id);
        }
        self.publish_envelope(callback_topic, &envelope).await
    }

    /// Broadcast a capability this node offers
    pub async fn advertise_capability(
        &self,
        advertisement: &CapabilityAdvertisement,
    ) -> Result<(), HspError> {
        let envelope = Envelope::new(
            self.ai_id.clone(),
            BROADCAST,
            MessageType::CapabilityAdvertisement,
            serde_json::to_value(advertisement)?,
        );
        self.publish_envelope(&topics::capabilities(), &envelope)
            .await
    }

    /// Broadcast a learned fact
    pub async fn publish_fact(&self, fact: &FactPayload) -> Result<(), HspError> {
        let envelope = Envelope::new(
            self.ai_id.clone(),
            BROADCAST,
            MessageType::Fact,
            serde_json::to_value(fact)?,
        );
        self.publish_envelope(&topics::facts(), &envelope).await
    }

    /// Drop a correlation whose task was abandoned or superseded
    pub fn forget_correlation(&self, correlation_id: &Uuid) -> bool {
        self.correlation.forget(correlation_id)
    }

    /// Publish an envelope; `requires_ack` arms the pending-ACK table first
    pub async fn publish_envelope(
        &self,
        topic: &str,
        envelope: &Envelope,
    ) -> Result<(), HspError> {
        let bytes = envelope.to_bytes()?;

        if envelope.qos_parameters.requires_ack {
            let mut pending = self
                .pending_acks
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            pending.insert(
                envelope.message_id,
                PendingAck {
                    envelope_bytes: bytes.clone(),
                    topic: topic.to_string(),
                    deadline: Instant::now() + Duration::from_secs(self.config.ack_timeout_s),
                    resends_left: ACK_RESEND_BUDGET,
                },
            );
        }

        let published = self
            .client
            .publish(topic, &bytes, QosLevel::AtLeastOnce)
            .await
            .map_err(|e| HspError::Dispatch(e.to_string()));

        if published.is_err() && envelope.qos_parameters.requires_ack {
            let mut pending = self
                .pending_acks
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            pending.remove(&envelope.message_id);
        }

        published
    }

    /// Route one inbound envelope
    async fn route(self: &Arc<Self>, topic: &str, payload: &[u8]) {
        let envelope = match Envelope::from_bytes(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Dropping undecodable envelope");
                return;
            }
        };
        if let Err(e) = envelope.validate() {
            warn!(topic = %topic, error = %e, "Dropping invalid envelope");
            return;
        }
        if envelope.sender_ai_id == self.ai_id {
            // Broadcast topics echo our own messages back
            return;
        }

        if envelope.qos_parameters.requires_ack && envelope.recipient_ai_id == self.ai_id {
            self.send_ack(&envelope).await;
        }

        match envelope.kind() {
            Some(MessageType::TaskResult) => self.route_task_result(&envelope).await,
            Some(MessageType::TaskRequest) => self.route_task_request(&envelope).await,
            Some(MessageType::CapabilityAdvertisement) => self.route_advertisement(&envelope),
            Some(MessageType::Fact) => self.route_fact(&envelope).await,
            Some(MessageType::Acknowledgement) => self.route_acknowledgement(&envelope),
            None => {
                warn!(
                    message_type = %envelope.message_type,
                    sender = %envelope.sender_ai_id,
                    "Dropping envelope with unknown message type"
                );
            }
        }
    }

    async fn route_task_result(&self, envelope: &Envelope) {
        let result: TaskResultPayload = match serde_json::from_value(envelope.payload.clone()) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Dropping malformed TaskResult payload");
                return;
            }
        };

        let correlation_id = envelope.correlation_id.or(result.correlation_id);
        let Some(correlation_id) = correlation_id else {
            warn!("Dropping TaskResult without correlation id");
            return;
        };

        match self.correlation.resolve(&correlation_id) {
            Some(entry) => {
                let event = HspEvent::TaskResult {
                    task_id: entry.task_id,
                    step_id: entry.step_id,
                    result,
                };
                if self.event_tx.send(event).await.is_err() {
                    warn!("HSP event receiver dropped; TaskResult lost");
                }
            }
            None => {
                debug!(
                    correlation_id = %correlation_id,
                    sender = %envelope.sender_ai_id,
                    "Discarding late or superseded TaskResult"
                );
            }
        }
    }

    async fn route_task_request(&self, envelope: &Envelope) {
        let request: TaskRequestPayload = match serde_json::from_value(envelope.payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Dropping malformed TaskRequest payload");
                return;
            }
        };

        let event = HspEvent::TaskRequest {
            request,
            correlation_id: envelope.correlation_id,
            sender_ai_id: envelope.sender_ai_id.clone(),
        };
        if self.event_tx.send(event).await.is_err() {
            warn!("HSP event receiver dropped; TaskRequest lost");
        }
    }

    fn route_advertisement(&self, envelope: &Envelope) {
        match serde_json::from_value::<CapabilityAdvertisement>(envelope.payload.clone()) {
            Ok(advertisement) => self.registry.register(advertisement),
            Err(e) => warn!(error = %e, "Dropping malformed CapabilityAdvertisement payload"),
        }
    }

    async fn route_fact(&self, envelope: &Envelope) {
        match serde_json::from_value::<FactPayload>(envelope.payload.clone()) {
            Ok(fact) => {
                if self.event_tx.send(HspEvent::Fact(fact)).await.is_err() {
                    warn!("HSP event receiver dropped; Fact lost");
                }
            }
            Err(e) => warn!(error = %e, "Dropping malformed Fact payload"),
        }
    }

    fn route_acknowledgement(&self, envelope: &Envelope) {
        match serde_json::from_value::<Acknowledgement>(envelope.payload.clone()) {
            Ok(ack) => {
                let mut pending = self
                    .pending_acks
                    .lock()
                    .unwrap_or_else(|p| p.into_inner());
                if pending.remove(&ack.acked_message_id).is_some() {
                    debug!(message_id = %ack.acked_message_id, "Acknowledgement cleared pending entry");
                }
            }
            Err(e) => warn!(error = %e, "Dropping malformed Acknowledgement payload"),
        }
    }

    fn route_status(&self, payload: &[u8]) {
        match serde_json::from_slice::<PeerLiveness>(payload) {
            Ok(liveness) if liveness.ai_id != self.ai_id => {
                debug!(peer = %liveness.ai_id, online = liveness.online, "Peer liveness update");
                self.registry.set_peer_status(&liveness.ai_id, liveness.online);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Dropping malformed liveness payload"),
        }
    }

    async fn send_ack(&self, envelope: &Envelope) {
        let ack = Acknowledgement {
            acked_message_id: envelope.message_id,
            status: "received".to_string(),
        };
        let ack_envelope = match serde_json::to_value(&ack) {
            Ok(value) => Envelope::new(
                self.ai_id.clone(),
                envelope.sender_ai_id.clone(),
                MessageType::Acknowledgement,
                value,
            ),
            Err(e) => {
                warn!(error = %e, "Failed to serialize acknowledgement");
                return;
            }
        };
        if let Err(e) = self
            .publish_envelope(&topics::acks(&envelope.sender_ai_id), &ack_envelope)
            .await
        {
            warn!(error = %e, "Failed to publish acknowledgement");
        }
    }

    /// Sweep both deadline tables: expired correlations become
    /// `RequestTimedOut` events; expired pending ACKs get one resend, then
    /// `DeliveryFailed`.
    fn spawn_sweeper(self: &Arc<Self>) {
        let connector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;

                let now = Instant::now();

                for (correlation_id, entry) in connector.correlation.take_expired(now) {
                    warn!(
                        correlation_id = %correlation_id,
                        task_id = %entry.task_id,
                        step_id = %entry.step_id,
                        "No correlated result before the deadline"
                    );
                    let _ = connector
                        .event_tx
                        .send(HspEvent::RequestTimedOut {
                            task_id: entry.task_id,
                            step_id: entry.step_id,
                            correlation_id,
                        })
                        .await;
                }

                let mut resends: Vec<(Uuid, String, Vec<u8>)> = Vec::new();
                let mut failures: Vec<(Uuid, String)> = Vec::new();
                {
                    let mut pending = connector
                        .pending_acks
                        .lock()
                        .unwrap_or_else(|p| p.into_inner());
                    let expired: Vec<Uuid> = pending
                        .iter()
                        .filter(|(_, p)| p.deadline <= now)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in expired {
                        let entry = pending.get_mut(&id).expect("entry present");
                        if entry.resends_left > 0 {
                            entry.resends_left -= 1;
                            entry.deadline = now
                                + Duration::from_secs(connector.config.ack_timeout_s);
                            resends.push((id, entry.topic.clone(), entry.envelope_bytes.clone()));
                        } else {
                            let entry = pending.remove(&id).expect("entry present");
                            failures.push((id, entry.topic));
                        }
                    }
                }

                for (message_id, topic, bytes) in resends {
                    warn!(message_id = %message_id, topic = %topic, "ACK deadline missed, resending");
                    if let Err(e) = connector
                        .client
                        .publish(&topic, &bytes, QosLevel::AtLeastOnce)
                        .await
                    {
                        warn!(message_id = %message_id, error = %e, "ACK resend failed");
                    }
                }
                for (message_id, topic) in failures {
                    warn!(message_id = %message_id, topic = %topic, "Delivery failed after resend budget");
                    let _ = connector
                        .event_tx
                        .send(HspEvent::DeliveryFailed { message_id, topic })
                        .await;
                }
            }
        });
    }
}
