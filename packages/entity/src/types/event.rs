use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::types::state::{StateKey, StateMap};

/// Event - federation PDU (Persistent Data Unit)
///
/// Mirrors the server-server wire format. The trailing fields
/// (`soft_failed`, `received_ts`, `outlier`, `rejected_reason`) are local
/// bookkeeping; they are stripped alongside `signatures`/`unsigned` before
/// any hash or signature is computed.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Event {
    /// Unique event identifier
    pub event_id: String,

    /// Event sender user ID
    pub sender: String,

    /// Server timestamp when event was created
    pub origin_server_ts: i64,

    /// Event type
    #[serde(rename = "type")]
    pub event_type: String,

    /// Room this event belongs to
    pub room_id: String,

    /// Event content
    pub content: Value,

    /// State key for state events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,

    /// Unsigned event metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Value>,

    /// Authorization events that give sender permission to send this event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_events: Option<Vec<String>>,

    /// Depth in the event DAG
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<i64>,

    /// Content hashes for verification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashes: Option<HashMap<String, String>>,

    /// Previous events in the DAG
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_events: Option<Vec<String>>,

    /// Digital signatures from servers, keyed by server name then key ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signatures: Option<HashMap<String, HashMap<String, String>>>,

    /// Event ID that this event redacts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacts: Option<String>,

    /// Whether this event failed the soft-failure check against current state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soft_failed: Option<bool>,

    /// Timestamp when event was received by this server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_ts: Option<i64>,

    /// Whether this event is an outlier (persisted without its full ancestry)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outlier: Option<bool>,

    /// Reason why this event was rejected, if it was
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_reason: Option<String>,
}

impl Event {
    /// Whether this event participates in the room's state map.
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// `(type, state_key)` pair for state events, `None` otherwise.
    pub fn state_key_pair(&self) -> Option<StateKey> {
        self.state_key
            .as_ref()
            .map(|sk| StateKey::new(self.event_type.clone(), sk.clone()))
    }

    /// Domain portion of the sender identifier (`@user:domain`).
    pub fn sender_domain(&self) -> Option<&str> {
        domain_of(&self.sender)
    }

    /// Domain portion of the room identifier (`!opaque:domain`).
    pub fn room_domain(&self) -> Option<&str> {
        domain_of(&self.room_id)
    }

    /// `membership` content field for `m.room.member` events.
    pub fn membership(&self) -> Option<Membership> {
        self.content
            .get("membership")
            .and_then(|m| m.as_str())
            .and_then(Membership::parse)
    }

    pub fn prev_event_ids(&self) -> &[String] {
        self.prev_events.as_deref().unwrap_or(&[])
    }

    pub fn auth_event_ids(&self) -> &[String] {
        self.auth_events.as_deref().unwrap_or(&[])
    }

    pub fn is_outlier(&self) -> bool {
        self.outlier.unwrap_or(false)
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected_reason.is_some()
    }
}

/// Extract the domain from a Matrix identifier of the form `sigil local:domain`.
pub fn domain_of(id: &str) -> Option<&str> {
    id.split_once(':').map(|(_, domain)| domain)
}

/// Membership states an `m.room.member` event can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Join,
    Invite,
    Leave,
    Ban,
    Knock,
}

impl Membership {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "join" => Some(Self::Join),
            "invite" => Some(Self::Invite),
            "leave" => Some(Self::Leave),
            "ban" => Some(Self::Ban),
            "knock" => Some(Self::Knock),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Invite => "invite",
            Self::Leave => "leave",
            Self::Ban => "ban",
            Self::Knock => "knock",
        }
    }
}

/// Transient per-processing-attempt wrapper pairing an event with the state
/// computed around it. Created when an event begins processing and discarded
/// once persistence succeeds or the event is rejected.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    /// State of the room before this event, as `(type, state_key) -> event_id`.
    pub state_before: StateMap<String>,

    /// State of the room after this event, if it is a state event.
    pub state_after: StateMap<String>,

    /// Whether the event was received without its full history.
    pub outlier: bool,

    /// Rejection reason if authorization failed.
    pub rejected_reason: Option<String>,

    /// Whether the event lost the soft-failure check against current state.
    pub soft_failed: bool,
}

impl EventContext {
    pub fn for_outlier() -> Self {
        Self { outlier: true, ..Default::default() }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            outlier: true,
            rejected_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Builder for locally-constructed PDUs. The caller fills in the protocol
/// fields; hashing and signing happen afterwards in the engine.
#[derive(Debug, Clone, Default)]
pub struct PduBuilder {
    pub sender: String,
    pub event_type: String,
    pub room_id: String,
    pub content: Value,
    pub state_key: Option<String>,
    pub redacts: Option<String>,
    pub prev_events: Vec<String>,
    pub auth_events: Vec<String>,
    pub depth: i64,
}

impl PduBuilder {
    pub fn state(
        room_id: impl Into<String>,
        sender: impl Into<String>,
        event_type: impl Into<String>,
        state_key: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            sender: sender.into(),
            event_type: event_type.into(),
            state_key: Some(state_key.into()),
            content,
            ..Default::default()
        }
    }

    /// Produce the unhashed, unsigned event. `origin_server_ts` is supplied by
    /// the caller so tests stay deterministic.
    pub fn into_event(self, origin_server_ts: i64) -> Event {
        Event {
            event_id: String::new(),
            sender: self.sender,
            origin_server_ts,
            event_type: self.event_type,
            room_id: self.room_id,
            content: self.content,
            state_key: self.state_key,
            redacts: self.redacts,
            prev_events: Some(self.prev_events),
            auth_events: Some(self.auth_events),
            depth: Some(self.depth),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_wire_roundtrip_uses_type_rename() {
        let event_json = json!({
            "event_id": "$abc",
            "type": "m.room.member",
            "room_id": "!room:example.org",
            "sender": "@user:example.org",
            "origin_server_ts": 1_234_567_890i64,
            "state_key": "@user:example.org",
            "content": {"membership": "join"}
        });

        let event: Event = serde_json::from_value(event_json.clone()).unwrap();
        assert_eq!(event.event_type, "m.room.member");
        assert_eq!(event.membership(), Some(Membership::Join));

        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back["type"], "m.room.member");
        assert!(back.get("soft_failed").is_none());
    }

    #[test]
    fn domain_extraction() {
        assert_eq!(domain_of("@alice:example.org"), Some("example.org"));
        assert_eq!(domain_of("!room:other.org"), Some("other.org"));
        assert_eq!(domain_of("no-domain"), None);
    }
}
