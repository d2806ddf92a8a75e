//! Event hashing and signing.
//!
//! Outbound events get a content hash, a reference-hash event ID (v3+) and an
//! ed25519 signature over the redacted canonical JSON. Inbound events are
//! checked the same way, with verify keys supplied by the [`Keyring`].

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use lattica_entity::hashing::{
    self, compute_content_hash, compute_event_id, verify_content_hash, HashingError,
};
use lattica_entity::redaction::redact_value;
use lattica_entity::types::event::domain_of;
use lattica_entity::types::{Event, EventIdFormat, RoomVersion};
use lattica_entity::utils::canonical_json::canonical_json;

use crate::federation::keyring::{Keyring, KeyringError};

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("hashing failed: {0}")]
    Hashing(#[from] HashingError),
    #[error("key lookup failed: {0}")]
    Keyring(#[from] KeyringError),
    #[error("event has no signature from {0}")]
    MissingSignature(String),
    #[error("signature {key_id} from {server} does not verify")]
    BadSignature { server: String, key_id: String },
    #[error("content hash mismatch")]
    ContentHashMismatch,
    #[error("sender {sender} has no domain")]
    MalformedSender { sender: String },
    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Hashes, signs and verifies events on behalf of one server.
pub struct EventSigningEngine {
    server_name: String,
    key_id: String,
    signing_key: SigningKey,
    keyring: Arc<dyn Keyring>,
}

impl EventSigningEngine {
    pub fn new(
        server_name: impl Into<String>,
        key_id: impl Into<String>,
        signing_key: SigningKey,
        keyring: Arc<dyn Keyring>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            key_id: key_id.into(),
            signing_key,
            keyring,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Add the content hash, this server's signature, and (for hash-derived
    /// formats) the event ID to a locally-built event.
    pub fn hash_and_sign(
        &self,
        event: &mut Event,
        room_version: &RoomVersion,
    ) -> Result<(), SigningError> {
        let pdu = hashing::wire_json(event, room_version)?;
        let content_hash = compute_content_hash(&pdu)?;
        event
            .hashes
            .get_or_insert_with(Default::default)
            .insert("sha256".to_string(), content_hash.clone());

        let mut signable = pdu;
        if let Some(obj) = signable.as_object_mut() {
            obj.insert("hashes".to_string(), serde_json::json!({"sha256": content_hash}));
        }
        let signature = self.sign_pdu(&signable, room_version)?;
        event
            .signatures
            .get_or_insert_with(Default::default)
            .entry(self.server_name.clone())
            .or_default()
            .insert(self.key_id.clone(), signature);

        if room_version.event_id_format() != EventIdFormat::DomainQualified {
            let signed_pdu = hashing::wire_json(event, room_version)?;
            event.event_id = compute_event_id(&signed_pdu, room_version)?;
        }

        debug!(event_id = %event.event_id, "hashed and signed event");
        Ok(())
    }

    /// Append this server's signature without touching hashes or the event
    /// ID. Used to countersign events minted elsewhere, e.g. invites.
    pub fn add_signature(
        &self,
        event: &mut Event,
        room_version: &RoomVersion,
    ) -> Result<(), SigningError> {
        let pdu = hashing::wire_json(event, room_version)?;
        let signature = self.sign_pdu(&pdu, room_version)?;
        event
            .signatures
            .get_or_insert_with(Default::default)
            .entry(self.server_name.clone())
            .or_default()
            .insert(self.key_id.clone(), signature);
        Ok(())
    }

    fn sign_pdu(&self, pdu: &Value, room_version: &RoomVersion) -> Result<String, SigningError> {
        let mut redacted = redact_value(pdu, room_version);
        if let Some(obj) = redacted.as_object_mut() {
            obj.remove("signatures");
            obj.remove("unsigned");
        }
        let canonical = canonical_json(&redacted).map_err(HashingError::from)?;
        let signature = self.signing_key.sign(canonical.as_bytes());
        Ok(STANDARD_NO_PAD.encode(signature.to_bytes()))
    }

    /// Verify an inbound event's content hash and origin signatures.
    ///
    /// The sender's domain must have signed the event; for domain-qualified
    /// event IDs the minting server must have as well. Key validity windows
    /// are enforced for room versions that require it.
    pub async fn verify_event(
        &self,
        event: &Event,
        room_version: &RoomVersion,
    ) -> Result<(), SigningError> {
        let pdu = hashing::wire_json(event, room_version)?;

        if !verify_content_hash(&pdu)? {
            return Err(SigningError::ContentHashMismatch);
        }

        let sender_domain = domain_of(&event.sender).ok_or_else(|| {
            SigningError::MalformedSender { sender: event.sender.clone() }
        })?;

        let mut required_signers = vec![sender_domain];
        if room_version.event_id_format() == EventIdFormat::DomainQualified {
            if let Some(id_domain) = domain_of(&event.event_id) {
                if id_domain != sender_domain {
                    required_signers.push(id_domain);
                }
            }
        }

        let mut signable = redact_value(&pdu, room_version);
        if let Some(obj) = signable.as_object_mut() {
            obj.remove("signatures");
            obj.remove("unsigned");
        }
        let canonical = canonical_json(&signable).map_err(HashingError::from)?;

        let at_ts = if room_version.enforce_key_validity() {
            event.origin_server_ts
        } else {
            0
        };

        for server in required_signers {
            self.verify_server_signature(event, server, &canonical, at_ts).await?;
        }

        Ok(())
    }

    async fn verify_server_signature(
        &self,
        event: &Event,
        server: &str,
        canonical: &str,
        at_ts: i64,
    ) -> Result<(), SigningError> {
        let sig_block = event
            .signatures
            .as_ref()
            .and_then(|sigs| sigs.get(server))
            .ok_or_else(|| SigningError::MissingSignature(server.to_string()))?;

        for (key_id, encoded) in sig_block {
            if !key_id.starts_with("ed25519:") {
                continue;
            }
            let verify_key = match self.keyring.verify_key_for(server, key_id, at_ts).await {
                Ok(key) => key,
                Err(reason) => {
                    warn!(%server, %key_id, %reason, "verify key unavailable");
                    continue;
                },
            };
            if verify_with(&verify_key.key, canonical, encoded) {
                return Ok(());
            }
            return Err(SigningError::BadSignature {
                server: server.to_string(),
                key_id: key_id.clone(),
            });
        }

        Err(SigningError::MissingSignature(server.to_string()))
    }
}

fn verify_with(key: &ed25519_dalek::VerifyingKey, message: &str, encoded_sig: &str) -> bool {
    let Ok(bytes) = STANDARD_NO_PAD.decode(encoded_sig) else {
        return false;
    };
    let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&bytes);
    key.verify(message.as_bytes(), &signature).is_ok()
}

/// Verify a detached signed-JSON object (third-party invite bundles) against
/// one base64 ed25519 public key. Accepts any matching signature from any
/// server block; returns `false` on any structural or cryptographic failure.
pub fn verify_signed_json(signed: &Value, public_key_b64: &str) -> bool {
    let Ok(key_bytes) = STANDARD_NO_PAD.decode(public_key_b64) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };

    let mut stripped = signed.clone();
    let Some(obj) = stripped.as_object_mut() else {
        return false;
    };
    let Some(signatures) = obj.remove("signatures") else {
        return false;
    };
    obj.remove("unsigned");

    let Ok(canonical) = canonical_json(&stripped) else {
        return false;
    };

    let Some(blocks) = signatures.as_object() else {
        return false;
    };
    for block in blocks.values() {
        let Some(block) = block.as_object() else {
            continue;
        };
        for (key_id, encoded) in block {
            if !key_id.starts_with("ed25519:") {
                continue;
            }
            if let Some(encoded) = encoded.as_str() {
                if verify_with(&key, &canonical, encoded) {
                    return true;
                }
            }
        }
    }

    false
}
