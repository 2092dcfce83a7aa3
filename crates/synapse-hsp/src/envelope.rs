//! # Message Envelope
//!
//! Canonical wire envelope wrapping every payload on the substrate. The
//! envelope version is fixed at `0.1`; receivers tolerate unknown optional
//! fields (serde ignores what it does not know) and drop unknown message
//! types after logging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::HspError;

/// Fixed envelope schema version on the wire
pub const ENVELOPE_VERSION: &str = "0.1";

/// Fixed protocol version on the wire
pub const PROTOCOL_VERSION: &str = "0.1";

/// Recipient value addressing every peer
pub const BROADCAST: &str = "broadcast";

/// Known payload types; the wire carries the string form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    TaskRequest,
    TaskResult,
    Fact,
    CapabilityAdvertisement,
    Acknowledgement,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskRequest => "TaskRequest",
            MessageType::TaskResult => "TaskResult",
            MessageType::Fact => "Fact",
            MessageType::CapabilityAdvertisement => "CapabilityAdvertisement",
            MessageType::Acknowledgement => "Acknowledgement",
        }
    }

    /// Parse the wire form; `None` for unknown types (logged and dropped by
    /// the receiver, never an error)
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "TaskRequest" => Some(MessageType::TaskRequest),
            "TaskResult" => Some(MessageType::TaskResult),
            "Fact" => Some(MessageType::Fact),
            "CapabilityAdvertisement" => Some(MessageType::CapabilityAdvertisement),
            "Acknowledgement" => Some(MessageType::Acknowledgement),
            _ => None,
        }
    }
}

/// Message priority hint carried in QoS parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Per-message delivery requirements
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QosParameters {
    pub requires_ack: bool,
    pub priority: Priority,
}

/// The canonical envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub hsp_envelope_version: String,
    pub message_id: Uuid,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    pub sender_ai_id: String,
    /// A peer id or [`BROADCAST`]
    pub recipient_ai_id: String,
    pub timestamp_sent: DateTime<Utc>,
    /// Wire form of [`MessageType`]; unknown values survive deserialization
    pub message_type: String,
    pub protocol_version: String,
    #[serde(default)]
    pub qos_parameters: QosParameters,
    #[serde(default)]
    pub payload_schema_uri: Option<String>,
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope with a fresh message id
    pub fn new(
        sender_ai_id: impl Into<String>,
        recipient_ai_id: impl Into<String>,
        message_type: MessageType,
        payload: Value,
    ) -> Self {
        Self {
            hsp_envelope_version: ENVELOPE_VERSION.to_string(),
            message_id: Uuid::new_v4(),
            correlation_id: None,
            sender_ai_id: sender_ai_id.into(),
            recipient_ai_id: recipient_ai_id.into(),
            timestamp_sent: Utc::now(),
            message_type: message_type.as_str().to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            qos_parameters: QosParameters::default(),
            payload_schema_uri: None,
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_qos(mut self, qos: QosParameters) -> Self {
        self.qos_parameters = qos;
        self
    }

    /// Validate the fields every receiver requires before routing
    pub fn validate(&self) -> Result<(), HspError> {
        if self.hsp_envelope_version != ENVELOPE_VERSION {
            return Err(HspError::InvalidEnvelope(format!(
                "unsupported envelope version '{}'",
                self.hsp_envelope_version
            )));
        }
        if self.sender_ai_id.is_empty() {
            return Err(HspError::InvalidEnvelope("empty sender_ai_id".to_string()));
        }
        if self.recipient_ai_id.is_empty() {
            return Err(HspError::InvalidEnvelope(
                "empty recipient_ai_id".to_string(),
            ));
        }
        if self.message_type.is_empty() {
            return Err(HspError::InvalidEnvelope("empty message_type".to_string()));
        }
        Ok(())
    }

    /// Parsed message type; `None` for unknown types
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::parse(&self.message_type)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, HspError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HspError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = Envelope::new(
            "node1",
            "node2",
            MessageType::TaskRequest,
            json!({"capability_id": "cap:echo"}),
        )
        .with_correlation(Uuid::new_v4());

        let bytes = envelope.to_bytes().unwrap();
        let parsed = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.message_id, envelope.message_id);
        assert_eq!(parsed.correlation_id, envelope.correlation_id);
        assert_eq!(parsed.kind(), Some(MessageType::TaskRequest));
        parsed.validate().unwrap();
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let raw = json!({
            "hsp_envelope_version": "0.1",
            "message_id": Uuid::new_v4(),
            "sender_ai_id": "node1",
            "recipient_ai_id": "broadcast",
            "timestamp_sent": Utc::now(),
            "message_type": "Fact",
            "protocol_version": "0.1",
            "payload": {},
            "experimental_field": {"nested": true}
        });
        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        envelope.validate().unwrap();
        assert_eq!(envelope.kind(), Some(MessageType::Fact));
    }

    #[test]
    fn test_unknown_message_type_survives_parse() {
        let mut envelope = Envelope::new("a", "b", MessageType::Fact, json!({}));
        envelope.message_type = "FutureThing".to_string();

        let parsed = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        parsed.validate().unwrap();
        assert!(parsed.kind().is_none());
    }

    #[test]
    fn test_validation_rejects_wrong_version() {
        let mut envelope = Envelope::new("a", "b", MessageType::Fact, json!({}));
        envelope.hsp_envelope_version = "0.9".to_string();
        assert!(envelope.validate().is_err());
    }

    #[test]
    fn test_qos_defaults() {
        let qos: QosParameters = serde_json::from_value(json!({})).unwrap();
        assert!(!qos.requires_ack);
        assert_eq!(qos.priority, Priority::Normal);
    }
}
