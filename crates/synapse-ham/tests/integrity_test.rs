//! End-to-end integrity tests: external mutation of the persisted file must
//! never let a record be silently returned.

use serde_json::{Map, Value};

use synapse_ham::crypto::MemoryCipher;
use synapse_ham::store::{HamQuery, HamStore};
use synapse_shared::config::{HamConfig, ResourceProfile};

const KEY: [u8; 32] = [9u8; 32];

fn config(dir: &tempfile::TempDir) -> HamConfig {
    HamConfig {
        storage_path: dir.path().join("ham.json"),
    }
}

async fn open(dir: &tempfile::TempDir) -> HamStore {
    HamStore::open(
        &config(dir),
        &ResourceProfile::default(),
        MemoryCipher::from_key_bytes(&KEY),
    )
    .await
    .unwrap()
}

/// Flip one character inside the stored record's encrypted package
fn corrupt_record(path: &std::path::Path, id: &str) {
    let raw = std::fs::read_to_string(path).unwrap();
    let mut document: Value = serde_json::from_str(&raw).unwrap();

    let package = document["store"][id]["encrypted_package_b64"]
        .as_str()
        .unwrap()
        .to_string();
    let mut chars: Vec<char> = package.chars().collect();
    // Flip a character in the middle of the ciphertext body; stay inside the
    // base64 alphabet so decoding still succeeds and authentication fails.
    let target = chars.len() / 2;
    chars[target] = if chars[target] == 'A' { 'B' } else { 'A' };
    let tampered: String = chars.into_iter().collect();

    document["store"][id]["encrypted_package_b64"] = Value::String(tampered);
    std::fs::write(path, serde_json::to_vec(&document).unwrap()).unwrap();
}

#[tokio::test]
async fn tampered_record_is_never_returned() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let store = open(&dir).await;
        store
            .store(
                "The launch window opens at dawn. Hold until confirmation.",
                "dialogue_text",
                Map::new(),
            )
            .await
            .unwrap()
            .unwrap()
    };

    corrupt_record(&config(&dir).storage_path, &id);

    let store = open(&dir).await;

    // recall returns None rather than a suspect record
    assert!(store.recall(&id).await.unwrap().is_none());

    // the record is not deleted by the failed recall
    assert_eq!(store.count().await, 1);

    // a query that would match the record omits it
    let results = store
        .query(&HamQuery {
            data_type_filter: Some("dialogue_text".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn untampered_sibling_still_readable() {
    let dir = tempfile::tempdir().unwrap();

    let (bad, good) = {
        let store = open(&dir).await;
        let bad = store
            .store("record one.", "dialogue_text", Map::new())
            .await
            .unwrap()
            .unwrap();
        let good = store
            .store("record two.", "dialogue_text", Map::new())
            .await
            .unwrap()
            .unwrap();
        (bad, good)
    };

    corrupt_record(&config(&dir).storage_path, &bad);

    let store = open(&dir).await;
    assert!(store.recall(&bad).await.unwrap().is_none());

    let result = store.recall(&good).await.unwrap().unwrap();
    assert_eq!(result.rehydrated_gist["summary"], "record two.");
}

#[tokio::test]
async fn checksum_recomputation_matches_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;

    let id = store
        .store("Checksums never lie. Mostly.", "dialogue_text", Map::new())
        .await
        .unwrap()
        .unwrap();

    let result = store.recall(&id).await.unwrap().unwrap();
    let expected = result.metadata["sha256_checksum"].as_str().unwrap();
    let actual = synapse_ham::crypto::checksum_hex(&result.rehydrated_gist);
    assert_eq!(actual, expected);
}
