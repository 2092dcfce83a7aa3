//! # Learning Adapter
//!
//! Converts final task results into `learned_fact_<topic>` memory records
//! with confidence and provenance. Derivation is pass-through when the
//! result already carries the learned shape, and a small deterministic rule
//! set otherwise. Failure to derive never fails the task.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use synapse_ham::HamStore;

/// What a final result was distilled into
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedFact {
    pub user_id: Option<String>,
    pub topic: String,
    pub value: Value,
    pub confidence: f64,
}

/// Fallback confidence when the result does not declare one
const DEFAULT_CONFIDENCE: f64 = 0.75;

/// Derive the learned-fact fields from a final result.
///
/// Pass-through applies when the result is an object carrying `topic` and
/// `value`; otherwise the topic comes from the task description and the
/// whole result becomes the value.
pub fn derive_fact(description: &str, result: &Value) -> Option<DerivedFact> {
    if let Value::Object(map) = result {
        if let (Some(topic), Some(value)) = (
            map.get("topic").and_then(Value::as_str),
            map.get("value"),
        ) {
            return Some(DerivedFact {
                user_id: map
                    .get("user_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                topic: slugify(topic),
                value: value.clone(),
                confidence: map
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(DEFAULT_CONFIDENCE),
            });
        }
    }

    let topic = slugify(description);
    if topic.is_empty() {
        return None;
    }
    Some(DerivedFact {
        user_id: None,
        topic,
        value: result.clone(),
        confidence: DEFAULT_CONFIDENCE,
    })
}

/// First three alphanumeric words, lowercased and underscore-joined
fn slugify(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .take(3)
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

/// Persists derived facts into the memory store
#[derive(Debug, Clone)]
pub struct LearningAdapter {
    ham: Arc<HamStore>,
    source_ai_id: String,
}

impl LearningAdapter {
    pub fn new(ham: Arc<HamStore>, source_ai_id: impl Into<String>) -> Self {
        Self {
            ham,
            source_ai_id: source_ai_id.into(),
        }
    }

    /// Derive and store a learned fact for a finished task.
    ///
    /// Returns the record id when one was written. Every failure path logs
    /// and returns `None`; the task outcome is already decided.
    pub async fn record_outcome(
        &self,
        task_id: &str,
        description: &str,
        result: &Value,
    ) -> Option<String> {
        let fact = match derive_fact(description, result) {
            Some(fact) => fact,
            None => {
                warn!(task_id = %task_id, "Could not derive learned fact from result");
                return None;
            }
        };

        let mut metadata = Map::new();
        if let Some(user_id) = &fact.user_id {
            metadata.insert("user_id".to_string(), Value::String(user_id.clone()));
        }
        metadata.insert("confidence".to_string(), serde_json::json!(fact.confidence));
        metadata.insert(
            "source_ai_id".to_string(),
            Value::String(self.source_ai_id.clone()),
        );
        metadata.insert(
            "recorded_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );

        let raw = match &fact.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let data_type = format!("learned_fact_{}", fact.topic);

        match self.ham.store(&raw, &data_type, metadata).await {
            Ok(Some(id)) => {
                debug!(task_id = %task_id, record_id = %id, data_type = %data_type, "Learned fact stored");
                Some(id)
            }
            Ok(None) => {
                warn!(task_id = %task_id, "Learned fact refused by resource profile");
                None
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to store learned fact");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_passthrough_shape() {
        let result = json!({
            "user_id": "alice",
            "topic": "Coffee Preference",
            "value": "espresso",
            "confidence": 0.9
        });
        let fact = derive_fact("irrelevant", &result).unwrap();
        assert_eq!(fact.user_id.as_deref(), Some("alice"));
        assert_eq!(fact.topic, "coffee_preference");
        assert_eq!(fact.value, json!("espresso"));
        assert!((fact.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fallback_rules() {
        let fact = derive_fact("Summarize the weekly Report now", &json!("short summary")).unwrap();
        assert_eq!(fact.topic, "summarize_the_weekly");
        assert_eq!(fact.value, json!("short summary"));
        assert!((fact.confidence - DEFAULT_CONFIDENCE).abs() < f64::EPSILON);
        assert!(fact.user_id.is_none());
    }

    #[test]
    fn test_underivable_when_description_empty() {
        assert!(derive_fact("  --  ", &json!(1)).is_none());
    }

    #[tokio::test]
    async fn test_record_outcome_persists() {
        use synapse_ham::crypto::MemoryCipher;
        use synapse_shared::config::{HamConfig, ResourceProfile};

        let dir = tempfile::tempdir().unwrap();
        let ham = Arc::new(
            HamStore::open(
                &HamConfig {
                    storage_path: dir.path().join("ham.json"),
                },
                &ResourceProfile::default(),
                MemoryCipher::generate(),
            )
            .await
            .unwrap(),
        );

        let adapter = LearningAdapter::new(ham.clone(), "did:synapse:test");
        let id = adapter
            .record_outcome(
                "task1",
                "learn user preference",
                &json!({"topic": "tea", "value": "green", "user_id": "bob"}),
            )
            .await
            .unwrap();

        let record = ham.recall(&id).await.unwrap().unwrap();
        assert_eq!(record.data_type, "learned_fact_tea");
        assert_eq!(record.metadata["user_id"], "bob");
        assert_eq!(record.metadata["source_ai_id"], "did:synapse:test");
    }
}
