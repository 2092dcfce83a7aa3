//! # Wire Payloads
//!
//! Payload shapes per envelope `message_type`, exactly as they cross between
//! peers. All shapes tolerate unknown optional fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Peer-reported outcome status inside a `TaskResult`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Success,
    Error,
}

/// Structured error details inside a failed `TaskResult`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub kind: String,
    pub message: String,
}

/// `TaskRequest` payload: ask a peer to execute a capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequestPayload {
    pub request_id: Uuid,
    pub capability_id: String,
    #[serde(default)]
    pub parameters: Value,
    /// Topic the peer publishes the correlated `TaskResult` on
    pub callback_address: String,
    pub requester_ai_id: String,
}

/// `TaskResult` payload: the correlated answer to a `TaskRequest`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultPayload {
    pub request_id: Uuid,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    pub executing_ai_id: String,
    pub status: PeerStatus,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub error_details: Option<ErrorDetails>,
}

impl TaskResultPayload {
    pub fn success(
        request_id: Uuid,
        correlation_id: Option<Uuid>,
        executing_ai_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            request_id,
            correlation_id,
            executing_ai_id: executing_ai_id.into(),
            status: PeerStatus::Success,
            payload: Some(payload),
            error_details: None,
        }
    }

    pub fn error(
        request_id: Uuid,
        correlation_id: Option<Uuid>,
        executing_ai_id: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            correlation_id,
            executing_ai_id: executing_ai_id.into(),
            status: PeerStatus::Error,
            payload: None,
            error_details: Some(ErrorDetails {
                kind: kind.into(),
                message: message.into(),
            }),
        }
    }
}

/// Availability of an advertised capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityStatus {
    #[default]
    Online,
    Offline,
    Degraded,
}

/// `CapabilityAdvertisement` payload: a tool a peer offers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityAdvertisement {
    /// Globally unique
    pub capability_id: String,
    /// Owner peer identity
    pub ai_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub availability_status: AvailabilityStatus,
}

/// `Fact` payload: a shared subject/predicate/object statement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactPayload {
    pub id: Uuid,
    pub subject: String,
    pub predicate: String,
    pub object: Value,
    pub confidence: f64,
    pub source_ai_id: String,
    pub observed_at: DateTime<Utc>,
}

/// `Acknowledgement` payload clearing a pending-ack entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub acked_message_id: Uuid,
    pub status: String,
}

/// Peer liveness announcement on the status topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLiveness {
    pub ai_id: String,
    pub online: bool,
    pub announced_at: DateTime<Utc>,
}
