//! Event redaction.
//!
//! Redacting an event strips everything but a version-dependent allow-list of
//! top-level keys and per-type content keys. Redaction is idempotent and never
//! changes the event ID: the reference hash is computed over the redacted
//! form in the first place.

use serde_json::{json, Map, Value};

use crate::types::{Event, RoomVersion};

/// Top-level keys every room version keeps under redaction.
const KEPT_TOP_LEVEL: &[&str] = &[
    "event_id",
    "type",
    "room_id",
    "sender",
    "state_key",
    "hashes",
    "signatures",
    "depth",
    "prev_events",
    "auth_events",
    "origin_server_ts",
];

/// Content keys preserved for a given event type under a given room version.
fn preserved_content_keys(event_type: &str, room_version: &RoomVersion) -> &'static [&'static str] {
    match event_type {
        "m.room.member" => {
            if room_version.updated_redaction_rules() {
                // v11 additionally keeps the signed third-party-invite block,
                // handled separately below since it is nested.
                &["membership", "join_authorised_via_users_server"]
            } else if *room_version >= RoomVersion::V9 {
                &["membership", "join_authorised_via_users_server"]
            } else {
                &["membership"]
            }
        },
        "m.room.create" => {
            // v11 keeps the entire content; signalled by the empty sentinel
            // checked in `redact_value`.
            &["creator", "m.federate", "room_version"]
        },
        "m.room.join_rules" => {
            if *room_version >= RoomVersion::V8 {
                &["join_rule", "allow"]
            } else {
                &["join_rule"]
            }
        },
        "m.room.power_levels" => {
            if room_version.updated_redaction_rules() {
                &[
                    "ban",
                    "events",
                    "events_default",
                    "invite",
                    "kick",
                    "redact",
                    "state_default",
                    "users",
                    "users_default",
                ]
            } else {
                &[
                    "ban",
                    "events",
                    "events_default",
                    "kick",
                    "redact",
                    "state_default",
                    "users",
                    "users_default",
                ]
            }
        },
        "m.room.history_visibility" => &["history_visibility"],
        "m.room.aliases" => {
            if room_version.special_case_aliases_auth() {
                &["aliases"]
            } else {
                &[]
            }
        },
        "m.room.redaction" => {
            if room_version.updated_redaction_rules() {
                &["redacts"]
            } else {
                &[]
            }
        },
        _ => &[],
    }
}

/// Redact a wire-format event JSON object.
pub fn redact_value(pdu: &Value, room_version: &RoomVersion) -> Value {
    let obj = match pdu.as_object() {
        Some(obj) => obj,
        None => return pdu.clone(),
    };

    let event_type = obj.get("type").and_then(|t| t.as_str()).unwrap_or("");

    let mut redacted = Map::new();
    for key in KEPT_TOP_LEVEL {
        if let Some(value) = obj.get(*key) {
            redacted.insert((*key).to_string(), value.clone());
        }
    }

    // Pre-v11, `redacts` survives as a top-level key on redaction events only
    // through the content rules; v11 moved it into the always-kept set.
    if room_version.updated_redaction_rules() {
        if let Some(redacts) = obj.get("redacts") {
            redacted.insert("redacts".to_string(), redacts.clone());
        }
    } else if event_type == "m.room.redaction" {
        if let Some(redacts) = obj.get("redacts") {
            redacted.insert("redacts".to_string(), redacts.clone());
        }
    }

    let content = obj.get("content").cloned().unwrap_or_else(|| json!({}));

    // v11 create events are fully unredactable at the content level.
    if event_type == "m.room.create" && room_version.updated_redaction_rules() {
        redacted.insert("content".to_string(), content);
        return Value::Object(redacted);
    }

    let mut kept_content = Map::new();
    if let Some(content_obj) = content.as_object() {
        for key in preserved_content_keys(event_type, room_version) {
            if let Some(value) = content_obj.get(*key) {
                kept_content.insert((*key).to_string(), value.clone());
            }
        }

        // v11 member events keep the signed block of a third-party invite.
        if event_type == "m.room.member" && room_version.updated_redaction_rules() {
            if let Some(signed) = content_obj
                .get("third_party_invite")
                .and_then(|tpi| tpi.get("signed"))
            {
                kept_content.insert(
                    "third_party_invite".to_string(),
                    json!({ "signed": signed.clone() }),
                );
            }
        }
    }

    redacted.insert("content".to_string(), Value::Object(kept_content));
    Value::Object(redacted)
}

/// Redact an `Event`, returning the stripped copy. Local bookkeeping fields
/// are dropped along with everything else outside the allow-list.
pub fn redact(event: &Event, room_version: &RoomVersion) -> Event {
    let pdu = match serde_json::to_value(event) {
        Ok(pdu) => pdu,
        Err(_) => return event.clone(),
    };
    let redacted = redact_value(&pdu, room_version);
    serde_json::from_value(redacted).unwrap_or_else(|_| event.clone())
}
