//! # Memory Store Crypto
//!
//! AES-256-GCM sealing of serialized gists and SHA-256 checksums over a
//! canonical JSON form. The 12-byte nonce is generated per encryption and
//! prepended to the ciphertext; GCM's auth tag turns any tampering into an
//! [`HamError::Integrity`] at decrypt time.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::HamError;

/// Environment variable holding the URL-safe base64 store key
pub const KEY_ENV_VAR: &str = "SYNAPSE_HAM_KEY";

/// Required decoded key length
pub const KEY_LEN: usize = 32;

/// GCM nonce length prepended to every ciphertext
const NONCE_LEN: usize = 12;

/// Symmetric cipher for the memory store
pub struct MemoryCipher {
    cipher: Aes256Gcm,
    /// True when the key was generated for this process only
    ephemeral: bool,
}

impl std::fmt::Debug for MemoryCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCipher")
            .field("ephemeral", &self.ephemeral)
            .finish()
    }
}

impl MemoryCipher {
    /// Load the key from [`KEY_ENV_VAR`].
    ///
    /// When the variable is absent or undecodable a process-lifetime key is
    /// generated instead; records written with it are unreadable after
    /// restart, and a warning says so.
    pub fn from_env() -> Self {
        match std::env::var(KEY_ENV_VAR) {
            Ok(encoded) => match Self::decode_key(&encoded) {
                Ok(key) => Self::from_key_bytes(&key),
                Err(e) => {
                    warn!(
                        error = %e,
                        "Invalid {KEY_ENV_VAR}; generating process-lifetime key — records will be unreadable after restart"
                    );
                    Self::generate()
                }
            },
            Err(_) => {
                warn!(
                    "{KEY_ENV_VAR} not set; generating process-lifetime key — records will be unreadable after restart"
                );
                Self::generate()
            }
        }
    }

    /// Build a cipher from raw key bytes
    pub fn from_key_bytes(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            ephemeral: false,
        }
    }

    /// Generate a random process-lifetime cipher
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
            ephemeral: true,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], HamError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|e| HamError::Key(e.to_string()))?;
        bytes
            .try_into()
            .map_err(|_| HamError::Key(format!("key must decode to {KEY_LEN} bytes")))
    }

    /// Seal a plaintext; output is `nonce || ciphertext+tag`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, HamError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| HamError::Integrity("encryption failed".to_string()))?;

        let mut package = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        package.extend_from_slice(&nonce);
        package.extend_from_slice(&ciphertext);
        Ok(package)
    }

    /// Open a sealed package; any tampering fails authentication
    pub fn decrypt(&self, package: &[u8]) -> Result<Vec<u8>, HamError> {
        if package.len() <= NONCE_LEN {
            return Err(HamError::Integrity("package too short".to_string()));
        }
        let (nonce, ciphertext) = package.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| HamError::Integrity("authentication failed".to_string()))
    }
}

/// Serialize a JSON value with all object keys sorted, recursively.
///
/// Checksums must not depend on map iteration order, so the canonical form
/// is computed explicitly rather than trusting serializer defaults.
pub fn canonical_json(value: &Value) -> String {
    fn write_value(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).expect("string serializes"));
                    out.push(':');
                    write_value(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_value(item, out);
                }
                out.push(']');
            }
            other => {
                out.push_str(&serde_json::to_string(other).expect("scalar serializes"));
            }
        }
    }

    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// SHA-256 of the canonical serialization, hex encoded
pub fn checksum_hex(value: &Value) -> String {
    let canonical = canonical_json(value);
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        write!(hex, "{byte:02x}").expect("write to string");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = MemoryCipher::generate();
        let plaintext = b"the quick brown fox";
        let package = cipher.encrypt(plaintext).unwrap();
        assert_ne!(&package[NONCE_LEN..], plaintext.as_slice());
        assert_eq!(cipher.decrypt(&package).unwrap(), plaintext);
    }

    #[test]
    fn test_tampering_detected() {
        let cipher = MemoryCipher::generate();
        let mut package = cipher.encrypt(b"payload").unwrap();
        let last = package.len() - 1;
        package[last] ^= 0x01;
        assert!(matches!(
            cipher.decrypt(&package),
            Err(HamError::Integrity(_))
        ));
    }

    #[test]
    fn test_short_package_rejected() {
        let cipher = MemoryCipher::generate();
        assert!(matches!(
            cipher.decrypt(&[0u8; 4]),
            Err(HamError::Integrity(_))
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = MemoryCipher::generate();
        let b = MemoryCipher::generate();
        let package = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&package).is_err());
    }

    #[test]
    fn test_key_decoding() {
        let key = [7u8; KEY_LEN];
        let encoded = URL_SAFE_NO_PAD.encode(key);
        let decoded = MemoryCipher::decode_key(&encoded).unwrap();
        assert_eq!(decoded, key);

        assert!(MemoryCipher::decode_key("too-short").is_err());
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"z": true, "m": [1, 2]}});
        assert_eq!(canonical_json(&value), r#"{"a":{"m":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn test_checksum_stable_across_key_order() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(checksum_hex(&a), checksum_hex(&b));
    }
}
