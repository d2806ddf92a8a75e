use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("no keys known for server {0}")]
    UnknownServer(String),
    #[error("server {server} has no key {key_id}")]
    UnknownKey { server: String, key_id: String },
    #[error("key {key_id} for {server} expired at {valid_until_ts}")]
    Expired { server: String, key_id: String, valid_until_ts: i64 },
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
}

/// A server's ed25519 verify key plus its advertised validity horizon.
#[derive(Debug, Clone)]
pub struct VerifyKey {
    pub key_id: String,
    pub key: VerifyingKey,
    /// Millisecond timestamp after which the key must be re-fetched, if the
    /// origin advertised one.
    pub valid_until_ts: Option<i64>,
}

impl VerifyKey {
    pub fn from_base64(key_id: impl Into<String>, encoded: &str) -> Result<Self, KeyringError> {
        let bytes = STANDARD_NO_PAD
            .decode(encoded)
            .map_err(|e| KeyringError::InvalidKeyMaterial(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyringError::InvalidKeyMaterial("key is not 32 bytes".to_string()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| KeyringError::InvalidKeyMaterial(e.to_string()))?;
        Ok(Self { key_id: key_id.into(), key, valid_until_ts: None })
    }
}

/// Source of federation verify keys.
///
/// Fetching and caching remote keys over the wire lives behind this trait;
/// the engine only asks "give me the key for server X valid at time T".
#[async_trait]
pub trait Keyring: Send + Sync {
    async fn verify_key_for(
        &self,
        server_name: &str,
        key_id: &str,
        at_ts: i64,
    ) -> Result<VerifyKey, KeyringError>;
}

/// Fixed key set, for tests and closed federations.
#[derive(Default)]
pub struct StaticKeyring {
    keys: HashMap<(String, String), VerifyKey>,
}

impl StaticKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, server_name: impl Into<String>, key: VerifyKey) {
        self.keys.insert((server_name.into(), key.key_id.clone()), key);
    }
}

#[async_trait]
impl Keyring for StaticKeyring {
    async fn verify_key_for(
        &self,
        server_name: &str,
        key_id: &str,
        at_ts: i64,
    ) -> Result<VerifyKey, KeyringError> {
        let key = self
            .keys
            .get(&(server_name.to_string(), key_id.to_string()))
            .ok_or_else(|| {
                if self.keys.keys().any(|(server, _)| server == server_name) {
                    KeyringError::UnknownKey {
                        server: server_name.to_string(),
                        key_id: key_id.to_string(),
                    }
                } else {
                    KeyringError::UnknownServer(server_name.to_string())
                }
            })?;

        if let Some(valid_until_ts) = key.valid_until_ts {
            if at_ts > valid_until_ts {
                return Err(KeyringError::Expired {
                    server: server_name.to_string(),
                    key_id: key_id.to_string(),
                    valid_until_ts,
                });
            }
        }

        Ok(key.clone())
    }
}
