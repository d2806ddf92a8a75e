use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;
use tracing::debug;

use lattica_entity::types::event::domain_of;
use lattica_entity::types::{Event, EventContext, Membership, StateMap};

use crate::error::StoreError;
use crate::event_store::{EventStore, PersistedBatch};

#[derive(Default)]
struct RoomData {
    current_state: StateMap<String>,
    forward_extremities: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    events: HashMap<String, Event>,
    /// State of the room after each non-outlier event.
    state_after: HashMap<String, StateMap<String>>,
    successors: HashMap<String, Vec<String>>,
    rooms: HashMap<String, RoomData>,
    stream_position: u64,
}

/// In-process [`EventStore`] backed by hash maps.
///
/// Complete enough for the engine's tests and for embedding without
/// durability; persisted events are immutable and redelivery of a known
/// event ID is a no-op.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: RwLock<Inner>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn get_event(&self, event_id: &str) -> Result<Option<Event>, StoreError> {
        Ok(self.inner.read().await.events.get(event_id).cloned())
    }

    async fn get_events(
        &self,
        event_ids: &[String],
    ) -> Result<HashMap<String, Event>, StoreError> {
        let inner = self.inner.read().await;
        Ok(event_ids
            .iter()
            .filter_map(|id| inner.events.get(id).map(|e| (id.clone(), e.clone())))
            .collect())
    }

    async fn get_current_state_ids(
        &self,
        room_id: &str,
    ) -> Result<StateMap<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .rooms
            .get(room_id)
            .map(|r| r.current_state.clone())
            .unwrap_or_default())
    }

    async fn get_state_groups_ids(
        &self,
        _room_id: &str,
        event_ids: &[String],
    ) -> Result<HashMap<String, StateMap<String>>, StoreError> {
        let inner = self.inner.read().await;
        Ok(event_ids
            .iter()
            .filter_map(|id| inner.state_after.get(id).map(|s| (id.clone(), s.clone())))
            .collect())
    }

    async fn persist_events_and_notify(
        &self,
        room_id: &str,
        events: Vec<(Event, EventContext)>,
    ) -> Result<PersistedBatch, StoreError> {
        let mut inner = self.inner.write().await;

        for (mut event, context) in events {
            // Redelivery is a no-op, except that an outlier may be upgraded
            // to a fully-processed event once its history is known.
            if let Some(existing) = inner.events.get(&event.event_id) {
                let upgrading =
                    existing.is_outlier() && !existing.is_rejected() && !context.outlier;
                if !upgrading {
                    debug!(event_id = %event.event_id, "skipping persist of duplicate event");
                    continue;
                }
                debug!(event_id = %event.event_id, "upgrading outlier");
            }

            event.outlier = Some(context.outlier);
            event.soft_failed = Some(context.soft_failed);
            event.rejected_reason = context.rejected_reason.clone();

            let event_id = event.event_id.clone();
            for prev in event.prev_event_ids().to_vec() {
                let succ = inner.successors.entry(prev).or_default();
                if !succ.contains(&event_id) {
                    succ.push(event_id.clone());
                }
            }

            let contributes_to_graph =
                !context.outlier && context.rejected_reason.is_none();

            if contributes_to_graph {
                inner
                    .state_after
                    .insert(event_id.clone(), context.state_after.clone());

                let prev_ids = event.prev_event_ids().to_vec();
                let is_state = event.is_state();
                let state_pair = event.state_key_pair();

                let room = inner.rooms.entry(room_id.to_string()).or_default();
                for prev in &prev_ids {
                    room.forward_extremities.remove(prev);
                }
                room.forward_extremities.insert(event_id.clone());

                if is_state && !context.soft_failed {
                    if let Some(pair) = state_pair {
                        room.current_state.insert(pair, event_id.clone());
                    }
                }
            }

            inner.events.insert(event_id, event);
            inner.stream_position += 1;
        }

        Ok(PersistedBatch { stream_position: inner.stream_position })
    }

    async fn get_auth_chain_ids(
        &self,
        _room_id: &str,
        event_ids: &[String],
        include_given: bool,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;

        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = event_ids.iter().cloned().collect();
        let mut chain = Vec::new();

        if include_given {
            for id in event_ids {
                if seen.insert(id.clone()) {
                    chain.push(id.clone());
                }
            }
        } else {
            seen.extend(event_ids.iter().cloned());
        }

        while let Some(id) = queue.pop_front() {
            if let Some(event) = inner.events.get(&id) {
                for auth_id in event.auth_event_ids() {
                    if seen.insert(auth_id.clone()) {
                        chain.push(auth_id.clone());
                        queue.push_back(auth_id.clone());
                    }
                }
            }
        }

        Ok(chain)
    }

    async fn get_oldest_event_ids_with_depth_in_room(
        &self,
        room_id: &str,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let inner = self.inner.read().await;
        let mut extremities = Vec::new();

        for event in inner.events.values() {
            if event.room_id != room_id || event.is_outlier() {
                continue;
            }
            let has_missing_parent = event
                .prev_event_ids()
                .iter()
                .any(|prev| !inner.events.contains_key(prev));
            if has_missing_parent {
                extremities.push((event.event_id.clone(), event.depth.unwrap_or(0)));
            }
        }

        Ok(extremities)
    }

    async fn get_forward_extremity_ids(
        &self,
        room_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .rooms
            .get(room_id)
            .map(|r| {
                let mut ids: Vec<String> = r.forward_extremities.iter().cloned().collect();
                ids.sort();
                ids
            })
            .unwrap_or_default())
    }

    async fn get_successor_ids(&self, event_id: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.successors.get(event_id).cloned().unwrap_or_default())
    }

    async fn is_host_joined(&self, room_id: &str, host: &str) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        let room = match inner.rooms.get(room_id) {
            Some(room) => room,
            None => return Ok(false),
        };

        for (key, event_id) in &room.current_state {
            if key.event_type != "m.room.member" {
                continue;
            }
            if domain_of(&key.state_key) != Some(host) {
                continue;
            }
            if let Some(event) = inner.events.get(event_id) {
                if event.membership() == Some(Membership::Join) {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    async fn get_room_create_event(
        &self,
        room_id: &str,
    ) -> Result<Option<Event>, StoreError> {
        let inner = self.inner.read().await;
        let create_id = inner
            .rooms
            .get(room_id)
            .and_then(|r| r.current_state.get(&lattica_entity::StateKey::for_type("m.room.create")));

        match create_id {
            Some(id) => Ok(inner.events.get(id).cloned()),
            None => {
                // Outlier-only rooms (e.g. invite stubs) have no tracked state
                // yet; fall back to a scan.
                Ok(inner
                    .events
                    .values()
                    .find(|e| {
                        e.room_id == room_id
                            && e.event_type == "m.room.create"
                            && e.state_key.as_deref() == Some("")
                    })
                    .cloned())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: &str, room: &str, prevs: &[&str], auths: &[&str], depth: i64) -> Event {
        Event {
            event_id: id.to_string(),
            room_id: room.to_string(),
            sender: "@alice:example.org".to_string(),
            origin_server_ts: depth * 1000,
            event_type: "m.room.message".to_string(),
            content: json!({"body": "x"}),
            prev_events: Some(prevs.iter().map(|s| s.to_string()).collect()),
            auth_events: Some(auths.iter().map(|s| s.to_string()).collect()),
            depth: Some(depth),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn duplicate_persist_is_noop() {
        let store = MemoryEventStore::new();
        let e = event("$a", "!r:x", &[], &[], 1);

        let first = store
            .persist_events_and_notify("!r:x", vec![(e.clone(), EventContext::default())])
            .await
            .unwrap();
        let second = store
            .persist_events_and_notify("!r:x", vec![(e, EventContext::default())])
            .await
            .unwrap();

        assert_eq!(first.stream_position, second.stream_position);
    }

    #[tokio::test]
    async fn forward_extremities_track_the_frontier() {
        let store = MemoryEventStore::new();
        let a = event("$a", "!r:x", &[], &[], 1);
        let b = event("$b", "!r:x", &["$a"], &[], 2);

        store
            .persist_events_and_notify(
                "!r:x",
                vec![
                    (a, EventContext::default()),
                    (b, EventContext::default()),
                ],
            )
            .await
            .unwrap();

        assert_eq!(
            store.get_forward_extremity_ids("!r:x").await.unwrap(),
            vec!["$b".to_string()]
        );
    }

    #[tokio::test]
    async fn auth_chain_walks_transitively() {
        let store = MemoryEventStore::new();
        let a = event("$a", "!r:x", &[], &[], 1);
        let b = event("$b", "!r:x", &["$a"], &["$a"], 2);
        let c = event("$c", "!r:x", &["$b"], &["$b"], 3);

        store
            .persist_events_and_notify(
                "!r:x",
                vec![
                    (a, EventContext::default()),
                    (b, EventContext::default()),
                    (c, EventContext::default()),
                ],
            )
            .await
            .unwrap();

        let mut chain = store
            .get_auth_chain_ids("!r:x", &["$c".to_string()], false)
            .await
            .unwrap();
        chain.sort();
        assert_eq!(chain, vec!["$a".to_string(), "$b".to_string()]);
    }

    #[tokio::test]
    async fn backwards_extremities_are_events_with_missing_parents() {
        let store = MemoryEventStore::new();
        let b = event("$b", "!r:x", &["$missing"], &[], 5);
        store
            .persist_events_and_notify("!r:x", vec![(b, EventContext::default())])
            .await
            .unwrap();

        let backwards = store
            .get_oldest_event_ids_with_depth_in_room("!r:x")
            .await
            .unwrap();
        assert_eq!(backwards, vec![("$b".to_string(), 5)]);
    }

    #[tokio::test]
    async fn rejected_events_never_enter_state() {
        let store = MemoryEventStore::new();
        let mut member = event("$m", "!r:x", &[], &[], 1);
        member.event_type = "m.room.member".to_string();
        member.state_key = Some("@alice:example.org".to_string());
        member.content = json!({"membership": "join"});

        store
            .persist_events_and_notify(
                "!r:x",
                vec![(member, EventContext::rejected("auth failed"))],
            )
            .await
            .unwrap();

        assert!(store.get_current_state_ids("!r:x").await.unwrap().is_empty());
        assert!(!store.is_host_joined("!r:x", "example.org").await.unwrap());

        let stored = store.get_event("$m").await.unwrap().unwrap();
        assert!(stored.is_rejected());
    }
}
