//! # Topic Scheme
//!
//! Every federation message flows over one of these substrate topics. Peer
//! identities are embedded as a single topic level, so `+` patterns select
//! "any peer" and concrete ids select one.

/// Task requests addressed to a specific peer
pub fn task_requests(ai_id: &str) -> String {
    format!("synapse/task/{ai_id}")
}

/// Task results addressed back to a requester
pub fn task_results(ai_id: &str) -> String {
    format!("synapse/results/{ai_id}")
}

/// Acknowledgements addressed to a sender
pub fn acks(ai_id: &str) -> String {
    format!("synapse/ack/{ai_id}")
}

/// Capability advertisements, broadcast
pub fn capabilities() -> String {
    "synapse/capabilities/broadcast".to_string()
}

/// Pattern covering all capability advertisements
pub fn capabilities_pattern() -> String {
    "synapse/capabilities/#".to_string()
}

/// Shared facts, broadcast
pub fn facts() -> String {
    "synapse/facts/broadcast".to_string()
}

pub fn facts_pattern() -> String {
    "synapse/facts/#".to_string()
}

/// Retained liveness status for one peer
pub fn status(ai_id: &str) -> String {
    format!("synapse/status/{ai_id}")
}

/// Pattern covering all peers' liveness status
pub fn status_pattern() -> String {
    "synapse/status/+".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use synapse_shared::messaging::topic_matches;

    #[test]
    fn test_status_pattern_covers_peers() {
        assert!(topic_matches(&status_pattern(), &status("peer1")));
        assert!(!topic_matches(&status_pattern(), &task_requests("peer1")));
    }

    #[test]
    fn test_per_peer_topics_distinct() {
        assert_ne!(task_requests("a"), task_requests("b"));
        assert_ne!(task_requests("a"), task_results("a"));
    }
}
