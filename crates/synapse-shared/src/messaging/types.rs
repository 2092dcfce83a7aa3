//! # Substrate Types
//!
//! Wire-level primitives shared by every provider: QoS levels, inbound
//! message wrapper, the substrate error enum, and topic pattern matching.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Delivery guarantee requested for a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QosLevel {
    /// Fire and forget
    AtMostOnce,
    /// Broker-confirmed; redelivered until acknowledged
    #[default]
    AtLeastOnce,
}

/// A message delivered to a subscriber
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Concrete topic the message was published on (not the pattern)
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Errors surfaced by substrate operations
#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("Substrate connection failed: {0}")]
    Connection(String),

    #[error("Publish to '{topic}' failed: {message}")]
    Publish { topic: String, message: String },

    #[error("Subscribe to '{pattern}' failed: {message}")]
    Subscribe { pattern: String, message: String },

    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("Substrate is not connected")]
    NotConnected,
}

impl SubstrateError {
    pub fn publish(topic: impl Into<String>, message: impl ToString) -> Self {
        Self::Publish {
            topic: topic.into(),
            message: message.to_string(),
        }
    }

    pub fn subscribe(pattern: impl Into<String>, message: impl ToString) -> Self {
        Self::Subscribe {
            pattern: pattern.into(),
            message: message.to_string(),
        }
    }
}

/// Match a topic against a subscription pattern.
///
/// Topics are `/`-separated. Patterns may use `+` for exactly one level and
/// a trailing `#` for any remaining levels (including none).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("synapse/task/node1", "synapse/task/node1"));
        assert!(!topic_matches("synapse/task/node1", "synapse/task/node2"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("synapse/task/+", "synapse/task/node1"));
        assert!(!topic_matches("synapse/task/+", "synapse/task/node1/extra"));
        assert!(!topic_matches("synapse/task/+", "synapse/task"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches("synapse/#", "synapse/task/node1"));
        assert!(topic_matches("synapse/#", "synapse"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("synapse/#", "other/task"));
    }

    #[test]
    fn test_wildcard_in_middle() {
        assert!(topic_matches("synapse/+/results", "synapse/node1/results"));
        assert!(!topic_matches("synapse/+/results", "synapse/node1/requests"));
    }

    #[test]
    fn test_qos_ordering() {
        assert!(QosLevel::AtMostOnce < QosLevel::AtLeastOnce);
    }
}
