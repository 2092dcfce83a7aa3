//! # HAM Store
//!
//! Persistent keyed store of abstracted, compressed, encrypted gists.
//! Append-mostly: updates are new records referencing the old id via
//! `metadata.reference_ids`; ids are monotonic and never reused, including
//! after deletion.
//!
//! On-disk layout is a single JSON document written atomically
//! (write-temp-and-rename):
//!
//! ```json
//! {"next_memory_id": 4,
//!  "store": {"mem_000001": {"timestamp": "...", "data_type": "...",
//!             "encrypted_package_b64": "...", "metadata": {...}}}}
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use synapse_shared::config::{HamConfig, ResourceProfile};

use crate::codec;
use crate::crypto::{checksum_hex, MemoryCipher};
use crate::error::HamError;
use crate::gist::{abstract_text, is_textual_data_type};

/// Metadata key carrying the canonical gist checksum
const CHECKSUM_KEY: &str = "sha256_checksum";

/// One record as persisted on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    timestamp: DateTime<Utc>,
    data_type: String,
    encrypted_package_b64: String,
    metadata: Map<String, Value>,
}

/// The persisted document
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoreDocument {
    next_memory_id: u64,
    store: BTreeMap<String, StoredRecord>,
}

/// A record rehydrated through decrypt → decompress → checksum verify
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallResult {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub data_type: String,
    /// Structured gist for textual records, opaque string value otherwise
    pub rehydrated_gist: Value,
    pub metadata: Map<String, Value>,
}

/// Filter set for [`HamStore::query`]; filters compose as logical AND
#[derive(Debug, Clone, Default)]
pub struct HamQuery {
    /// Case-insensitive substrings matched against the stringified metadata;
    /// every keyword must match
    pub keywords: Option<Vec<String>>,
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Prefix match against `data_type`
    pub data_type_filter: Option<String>,
    /// Exact-match metadata constraints
    pub metadata_filters: Option<Map<String, Value>>,
    /// Sugar for `metadata_filters["user_id"]` when querying fact records
    pub user_id_for_facts: Option<String>,
    pub limit: Option<usize>,
    /// Order by `metadata.confidence` descending instead of newest-first
    pub sort_by_confidence: bool,
}

impl HamQuery {
    const DEFAULT_LIMIT: usize = 5;

    fn limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }
}

/// The hierarchical abstractive memory store
#[derive(Debug)]
pub struct HamStore {
    cipher: MemoryCipher,
    storage_path: PathBuf,
    /// Soft cap for the persisted document, from the declared resource profile
    disk_max_bytes: Option<u64>,
    state: Mutex<StoreDocument>,
    refused_writes: AtomicU64,
}

impl HamStore {
    /// Open (or create) a store at the configured path.
    pub async fn open(
        config: &HamConfig,
        profile: &ResourceProfile,
        cipher: MemoryCipher,
    ) -> Result<Self, HamError> {
        let storage_path = config.storage_path.clone();
        let state = Self::load_document(&storage_path).await?;

        info!(
            path = %storage_path.display(),
            records = state.store.len(),
            ephemeral_key = cipher.is_ephemeral(),
            "Memory store opened"
        );

        Ok(Self {
            cipher,
            storage_path,
            disk_max_bytes: profile.disk.max_bytes,
            state: Mutex::new(state),
            refused_writes: AtomicU64::new(0),
        })
    }

    async fn load_document(path: &Path) -> Result<StoreDocument, HamError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let document: StoreDocument = serde_json::from_slice(&bytes)?;
                Ok(document)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(StoreDocument {
                    next_memory_id: 1,
                    store: BTreeMap::new(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Abstract, seal, and persist one experience.
    ///
    /// Returns `Ok(None)` when the declared disk limit refuses the write;
    /// the refusal counter feeds the admin surface.
    pub async fn store(
        &self,
        raw_data: &str,
        data_type: &str,
        mut metadata: Map<String, Value>,
    ) -> Result<Option<String>, HamError> {
        let gist_value = if is_textual_data_type(data_type) {
            serde_json::to_value(abstract_text(raw_data))?
        } else {
            Value::String(raw_data.to_string())
        };

        // Checksum covers the canonical serialization of the gist before
        // compression and encryption.
        metadata.insert(
            CHECKSUM_KEY.to_string(),
            Value::String(checksum_hex(&gist_value)),
        );

        let serialized = serde_json::to_vec(&gist_value)?;
        let compressed = codec::compress(&serialized)?;
        let sealed = self.cipher.encrypt(&compressed)?;
        let encrypted_package_b64 = BASE64.encode(sealed);

        let mut state = self.state.lock().await;

        let id = format!("mem_{:06}", state.next_memory_id);
        let record = StoredRecord {
            timestamp: Utc::now(),
            data_type: data_type.to_string(),
            encrypted_package_b64,
            metadata,
        };

        // Size the candidate document before committing it
        let mut candidate = state.clone();
        candidate.next_memory_id += 1;
        candidate.store.insert(id.clone(), record);

        let bytes = serde_json::to_vec(&candidate)?;
        if let Some(max) = self.disk_max_bytes {
            if bytes.len() as u64 > max {
                self.refused_writes.fetch_add(1, Ordering::Relaxed);
                warn!(
                    data_type = %data_type,
                    would_be_bytes = bytes.len(),
                    max_bytes = max,
                    "Memory store write refused by resource profile"
                );
                return Ok(None);
            }
        }

        Self::persist_atomic(&self.storage_path, &bytes).await?;
        *state = candidate;

        debug!(id = %id, data_type = %data_type, "Memory record stored");
        Ok(Some(id))
    }

    /// Rehydrate a record by id.
    ///
    /// Integrity and corruption failures are logged and yield `Ok(None)`;
    /// the record is left untouched on disk for offline inspection.
    pub async fn recall(&self, id: &str) -> Result<Option<RecallResult>, HamError> {
        let record = {
            let state = self.state.lock().await;
            match state.store.get(id) {
                Some(record) => record.clone(),
                None => return Ok(None),
            }
        };

        match self.rehydrate(id, &record) {
            Ok(result) => Ok(Some(result)),
            Err(HamError::Integrity(msg)) => {
                error!(id = %id, reason = %msg, "CRITICAL: memory record failed integrity verification");
                Ok(None)
            }
            Err(HamError::Corruption(msg)) => {
                error!(id = %id, reason = %msg, "CRITICAL: memory record failed decompression");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn rehydrate(&self, id: &str, record: &StoredRecord) -> Result<RecallResult, HamError> {
        let sealed = BASE64
            .decode(&record.encrypted_package_b64)
            .map_err(|e| HamError::Corruption(format!("base64: {e}")))?;
        let compressed = self.cipher.decrypt(&sealed)?;
        let serialized = codec::decompress(&compressed)?;
        let gist_value: Value = serde_json::from_slice(&serialized)
            .map_err(|e| HamError::Corruption(format!("gist parse: {e}")))?;

        match record.metadata.get(CHECKSUM_KEY).and_then(Value::as_str) {
            Some(expected) => {
                let actual = checksum_hex(&gist_value);
                if actual != expected {
                    return Err(HamError::Integrity(format!(
                        "checksum mismatch: stored {expected}, computed {actual}"
                    )));
                }
            }
            None => {
                warn!(id = %id, "Legacy memory record without checksum; accepting");
            }
        }

        Ok(RecallResult {
            id: id.to_string(),
            timestamp: record.timestamp,
            data_type: record.data_type.clone(),
            rehydrated_gist: gist_value,
            metadata: record.metadata.clone(),
        })
    }

    /// Query records by composed filters. Records failing integrity checks
    /// are omitted, matching `recall` semantics.
    pub async fn query(&self, query: &HamQuery) -> Result<Vec<RecallResult>, HamError> {
        let candidates: Vec<(String, StoredRecord)> = {
            let state = self.state.lock().await;
            state
                .store
                .iter()
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect()
        };

        let mut effective_metadata = query.metadata_filters.clone().unwrap_or_default();
        if let Some(user_id) = &query.user_id_for_facts {
            effective_metadata.insert("user_id".to_string(), Value::String(user_id.clone()));
        }

        let mut results = Vec::new();
        // Monotonic ids make reverse id order newest-first
        for (id, record) in candidates.iter().rev() {
            if let Some(prefix) = &query.data_type_filter {
                if !record.data_type.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            if let Some((start, end)) = &query.date_range {
                if record.timestamp < *start || record.timestamp > *end {
                    continue;
                }
            }
            if !effective_metadata
                .iter()
                .all(|(key, expected)| record.metadata.get(key) == Some(expected))
            {
                continue;
            }
            if let Some(keywords) = &query.keywords {
                let haystack = serde_json::to_string(&record.metadata)?.to_lowercase();
                if !keywords
                    .iter()
                    .all(|kw| haystack.contains(&kw.to_lowercase()))
                {
                    continue;
                }
            }

            match self.rehydrate(id, record) {
                Ok(result) => results.push(result),
                Err(HamError::Integrity(msg)) | Err(HamError::Corruption(msg)) => {
                    error!(id = %id, reason = %msg, "CRITICAL: omitting unreadable record from query");
                }
                Err(e) => return Err(e),
            }

            if !query.sort_by_confidence && results.len() >= query.limit() {
                break;
            }
        }

        if query.sort_by_confidence {
            results.sort_by(|a, b| {
                let confidence = |r: &RecallResult| {
                    r.metadata
                        .get("confidence")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0)
                };
                confidence(b)
                    .partial_cmp(&confidence(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            results.truncate(query.limit());
        }

        Ok(results)
    }

    /// Delete a record. The id is never reused.
    pub async fn delete(&self, id: &str) -> Result<bool, HamError> {
        let mut state = self.state.lock().await;
        if state.store.remove(id).is_none() {
            return Ok(false);
        }
        let bytes = serde_json::to_vec(&*state)?;
        Self::persist_atomic(&self.storage_path, &bytes).await?;
        debug!(id = %id, "Memory record deleted");
        Ok(true)
    }

    pub async fn count(&self) -> usize {
        self.state.lock().await.store.len()
    }

    /// Writes refused by the resource profile since startup
    pub fn refused_writes(&self) -> u64 {
        self.refused_writes.load(Ordering::Relaxed)
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    async fn persist_atomic(path: &Path, bytes: &[u8]) -> Result<(), HamError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
        tokio::fs::write(&tmp_path, bytes).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synapse_shared::config::DiskProfile;

    fn test_config(dir: &tempfile::TempDir) -> HamConfig {
        HamConfig {
            storage_path: dir.path().join("ham.json"),
        }
    }

    async fn open_store(dir: &tempfile::TempDir) -> HamStore {
        HamStore::open(
            &test_config(dir),
            &ResourceProfile::default(),
            MemoryCipher::generate(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_store_assigns_monotonic_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let a = store
            .store("first", "dialogue_text", Map::new())
            .await
            .unwrap()
            .unwrap();
        let b = store
            .store("second", "dialogue_text", Map::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a, "mem_000001");
        assert_eq!(b, "mem_000002");
    }

    #[tokio::test]
    async fn test_roundtrip_textual_gist() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let id = store
            .store(
                "The meeting moved to Tuesday. Everyone agreed quickly.",
                "dialogue_text",
                Map::new(),
            )
            .await
            .unwrap()
            .unwrap();

        let result = store.recall(&id).await.unwrap().unwrap();
        assert_eq!(result.data_type, "dialogue_text");
        assert_eq!(
            result.rehydrated_gist["summary"],
            "The meeting moved to Tuesday."
        );
        assert!(result.metadata.contains_key("sha256_checksum"));
    }

    #[tokio::test]
    async fn test_roundtrip_opaque_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let id = store
            .store("42.5", "task_artifact_stage1", Map::new())
            .await
            .unwrap()
            .unwrap();
        let result = store.recall(&id).await.unwrap().unwrap();
        assert_eq!(result.rehydrated_gist, Value::String("42.5".to_string()));
    }

    #[tokio::test]
    async fn test_recall_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        assert!(store.recall("mem_999999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_does_not_reuse_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let a = store
            .store("x", "dialogue_text", Map::new())
            .await
            .unwrap()
            .unwrap();
        assert!(store.delete(&a).await.unwrap());
        assert!(!store.delete(&a).await.unwrap());

        let b = store
            .store("y", "dialogue_text", Map::new())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_disk_limit_refuses_write() {
        let dir = tempfile::tempdir().unwrap();
        let profile = ResourceProfile {
            disk: DiskProfile { max_bytes: Some(64) },
            ..Default::default()
        };
        let store = HamStore::open(&test_config(&dir), &profile, MemoryCipher::generate())
            .await
            .unwrap();

        let outcome = store
            .store("way too large for the declared profile", "dialogue_text", Map::new())
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(store.refused_writes(), 1);
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = [3u8; 32];
        let config = test_config(&dir);

        let id = {
            let store = HamStore::open(
                &config,
                &ResourceProfile::default(),
                MemoryCipher::from_key_bytes(&key),
            )
            .await
            .unwrap();
            store
                .store("persistent fact.", "dialogue_text", Map::new())
                .await
                .unwrap()
                .unwrap()
        };

        let reopened = HamStore::open(
            &config,
            &ResourceProfile::default(),
            MemoryCipher::from_key_bytes(&key),
        )
        .await
        .unwrap();

        let result = reopened.recall(&id).await.unwrap().unwrap();
        assert_eq!(result.rehydrated_gist["summary"], "persistent fact.");

        // next_memory_id also persisted
        let next = reopened
            .store("another", "dialogue_text", Map::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, "mem_000002");
    }

    #[tokio::test]
    async fn test_query_by_data_type_prefix_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        for i in 0..8 {
            store
                .store(&format!("fact {i}"), "learned_fact_weather", Map::new())
                .await
                .unwrap();
        }
        store
            .store("noise", "dialogue_text", Map::new())
            .await
            .unwrap();

        let results = store
            .query(&HamQuery {
                data_type_filter: Some("learned_fact".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 5); // default limit
        assert!(results.iter().all(|r| r.data_type.starts_with("learned_fact")));
        // newest-first
        assert_eq!(results[0].rehydrated_gist, Value::String("fact 7".to_string()));
    }

    #[tokio::test]
    async fn test_query_metadata_and_keywords() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut meta_a = Map::new();
        meta_a.insert("user_id".to_string(), Value::String("alice".to_string()));
        meta_a.insert("tags".to_string(), Value::String("Weather,Rain".to_string()));
        store.store("a", "learned_fact_w", meta_a).await.unwrap();

        let mut meta_b = Map::new();
        meta_b.insert("user_id".to_string(), Value::String("bob".to_string()));
        store.store("b", "learned_fact_w", meta_b).await.unwrap();

        let results = store
            .query(&HamQuery {
                user_id_for_facts: Some("alice".to_string()),
                keywords: Some(vec!["rain".to_string()]),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata["user_id"], "alice");
    }

    #[tokio::test]
    async fn test_query_sort_by_confidence() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        for (name, confidence) in [("low", 0.2), ("high", 0.9), ("mid", 0.5)] {
            let mut meta = Map::new();
            meta.insert(
                "confidence".to_string(),
                serde_json::json!(confidence),
            );
            store.store(name, "learned_fact_x", meta).await.unwrap();
        }

        let results = store
            .query(&HamQuery {
                data_type_filter: Some("learned_fact_x".to_string()),
                sort_by_confidence: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let order: Vec<&str> = results
            .iter()
            .map(|r| r.rehydrated_gist.as_str().unwrap())
            .collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
    }
}
