use async_trait::async_trait;
use std::collections::HashMap;

use lattica_entity::types::{Event, EventContext, StateMap};

use crate::error::StoreError;

/// Result of persisting a batch of events: the stream position after the
/// write, for downstream notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedBatch {
    pub stream_position: u64,
}

/// The abstract event/state store the federation engine runs against.
///
/// Persisted events are immutable, so read-only lookups may proceed
/// concurrently without locking; all mutation goes through
/// [`persist_events_and_notify`](EventStore::persist_events_and_notify) and is
/// serialized per room by the engine's linearizer, not by the store.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn get_event(&self, event_id: &str) -> Result<Option<Event>, StoreError>;

    /// Batch lookup; absent IDs are simply missing from the result map.
    async fn get_events(&self, event_ids: &[String])
        -> Result<HashMap<String, Event>, StoreError>;

    /// Current room state as `(type, state_key) -> event_id`.
    async fn get_current_state_ids(&self, room_id: &str)
        -> Result<StateMap<String>, StoreError>;

    /// State of the room *after* each of the given events, for computing the
    /// previous state of a new event from its prev_events.
    async fn get_state_groups_ids(
        &self,
        room_id: &str,
        event_ids: &[String],
    ) -> Result<HashMap<String, StateMap<String>>, StoreError>;

    /// Atomically persist a batch of events with their contexts. Events whose
    /// context is rejected or outlier are retained but never contribute to
    /// state; state-event contexts update the room's current state and
    /// forward extremities.
    async fn persist_events_and_notify(
        &self,
        room_id: &str,
        events: Vec<(Event, EventContext)>,
    ) -> Result<PersistedBatch, StoreError>;

    /// Transitive closure of the given events' auth_events. When
    /// `include_given` is set the given IDs are part of the result.
    async fn get_auth_chain_ids(
        &self,
        room_id: &str,
        event_ids: &[String],
        include_given: bool,
    ) -> Result<Vec<String>, StoreError>;

    /// Backwards extremities: `(event_id, depth)` of known events whose
    /// parents are missing locally.
    async fn get_oldest_event_ids_with_depth_in_room(
        &self,
        room_id: &str,
    ) -> Result<Vec<(String, i64)>, StoreError>;

    /// Forward extremities: locally-known events with no locally-known
    /// children.
    async fn get_forward_extremity_ids(&self, room_id: &str)
        -> Result<Vec<String>, StoreError>;

    /// Locally-known events that reference the given event in prev_events.
    async fn get_successor_ids(&self, event_id: &str) -> Result<Vec<String>, StoreError>;

    async fn is_host_joined(&self, room_id: &str, host: &str) -> Result<bool, StoreError>;

    /// The room's `m.room.create` event, from which the room version is read.
    async fn get_room_create_event(&self, room_id: &str)
        -> Result<Option<Event>, StoreError>;
}
