//! Content and reference hashing for events.
//!
//! Both hashes are SHA-256 over canonical JSON. The content hash covers the
//! full event minus `signatures`, `unsigned` and `hashes`; the reference hash
//! covers the *redacted* event minus `signatures` and `unsigned`, and is what
//! v3+ event IDs are derived from.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::redaction::redact_value;
use crate::types::{Event, EventIdFormat, RoomVersion};
use crate::utils::canonical_json::{canonical_json, CanonicalJsonError};

#[derive(Debug, thiserror::Error)]
pub enum HashingError {
    #[error("canonical JSON error: {0}")]
    Canonical(#[from] CanonicalJsonError),

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("event IDs for room version {0} are minted by the origin server, not hashed")]
    NotHashDerived(RoomVersion),
}

/// Fields that exist only in local bookkeeping and never on the wire.
const LOCAL_FIELDS: &[&str] = &["soft_failed", "received_ts", "outlier", "rejected_reason"];

/// Serialize an event to its wire JSON form, dropping local bookkeeping
/// fields. v3+ rooms carry no `event_id` on the wire.
pub fn wire_json(event: &Event, room_version: &RoomVersion) -> Result<Value, HashingError> {
    let mut pdu = serde_json::to_value(event)?;
    if let Some(obj) = pdu.as_object_mut() {
        for field in LOCAL_FIELDS {
            obj.remove(*field);
        }
        if room_version.event_id_format() != EventIdFormat::DomainQualified {
            obj.remove("event_id");
        }
    }
    Ok(pdu)
}

/// Compute the base64 content hash of an event's wire JSON.
pub fn compute_content_hash(pdu: &Value) -> Result<String, HashingError> {
    let mut hashable = pdu.clone();
    if let Some(obj) = hashable.as_object_mut() {
        obj.remove("signatures");
        obj.remove("unsigned");
        obj.remove("hashes");
        for field in LOCAL_FIELDS {
            obj.remove(*field);
        }
    }

    let canonical = canonical_json(&hashable)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(STANDARD_NO_PAD.encode(hasher.finalize()))
}

/// Compute the reference hash of an event: SHA-256 of the canonical JSON of
/// the redacted event with `signatures` and `unsigned` removed.
pub fn compute_reference_hash(
    pdu: &Value,
    room_version: &RoomVersion,
) -> Result<[u8; 32], HashingError> {
    let mut redacted = redact_value(pdu, room_version);
    if let Some(obj) = redacted.as_object_mut() {
        obj.remove("signatures");
        obj.remove("unsigned");
        obj.remove("event_id");
        for field in LOCAL_FIELDS {
            obj.remove(*field);
        }
    }

    let canonical = canonical_json(&redacted)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hasher.finalize().into())
}

/// Derive the event ID for a hash-derived room version.
///
/// v1/v2 IDs are opaque strings minted by the origin server and cannot be
/// recomputed; asking for one is an error.
pub fn compute_event_id(
    pdu: &Value,
    room_version: &RoomVersion,
) -> Result<String, HashingError> {
    let hash = compute_reference_hash(pdu, room_version)?;
    match room_version.event_id_format() {
        EventIdFormat::DomainQualified => Err(HashingError::NotHashDerived(*room_version)),
        EventIdFormat::Base64ReferenceHash => Ok(format!("${}", STANDARD_NO_PAD.encode(hash))),
        EventIdFormat::UrlSafeBase64ReferenceHash => {
            Ok(format!("${}", URL_SAFE_NO_PAD.encode(hash)))
        },
    }
}

/// Check an event's declared sha256 content hash against its actual content.
/// Returns `false` when no sha256 hash is present.
pub fn verify_content_hash(pdu: &Value) -> Result<bool, HashingError> {
    let declared = pdu
        .get("hashes")
        .and_then(|h| h.get("sha256"))
        .and_then(|h| h.as_str());

    match declared {
        Some(declared) => Ok(declared == compute_content_hash(pdu)?),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_pdu() -> Value {
        json!({
            "type": "m.room.message",
            "room_id": "!room:example.org",
            "sender": "@user:example.org",
            "origin_server_ts": 1_234_567_890i64,
            "depth": 5,
            "prev_events": ["$prev"],
            "auth_events": ["$auth"],
            "content": {"msgtype": "m.text", "body": "hello"}
        })
    }

    #[test]
    fn content_hash_ignores_signatures_and_unsigned() {
        let base = sample_pdu();
        let mut signed = base.clone();
        signed["signatures"] = json!({"example.org": {"ed25519:a": "sig"}});
        signed["unsigned"] = json!({"age": 1000});

        assert_eq!(
            compute_content_hash(&base).unwrap(),
            compute_content_hash(&signed).unwrap()
        );
    }

    #[test]
    fn event_id_is_deterministic_and_version_scoped() {
        let pdu = sample_pdu();
        let id_v10_a = compute_event_id(&pdu, &RoomVersion::V10).unwrap();
        let id_v10_b = compute_event_id(&pdu, &RoomVersion::V10).unwrap();
        assert_eq!(id_v10_a, id_v10_b);
        assert!(id_v10_a.starts_with('$'));

        // v3 uses standard rather than url-safe base64
        let id_v3 = compute_event_id(&pdu, &RoomVersion::V3).unwrap();
        assert_eq!(&id_v3[1..].replace('+', "-").replace('/', "_"), &id_v10_a[1..]);

        assert!(compute_event_id(&pdu, &RoomVersion::V1).is_err());
    }

    #[test]
    fn verify_content_hash_detects_tampering() {
        let mut pdu = sample_pdu();
        let hash = compute_content_hash(&pdu).unwrap();
        pdu["hashes"] = json!({"sha256": hash});
        assert!(verify_content_hash(&pdu).unwrap());

        pdu["content"]["body"] = json!("tampered");
        assert!(!verify_content_hash(&pdu).unwrap());
    }
}
