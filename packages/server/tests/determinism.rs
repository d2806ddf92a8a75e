//! End-to-end pipeline tests over an in-memory store: servers that receive
//! the same events in different orders must converge on the same room state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use lattica_entity::types::{Event, Membership, RoomVersion, StateKey};
use lattica_server::config::FederationConfig;
use lattica_server::federation::event_handler::RejectReason;
use lattica_server::federation::keyring::{StaticKeyring, VerifyKey};
use lattica_server::federation::transport::{
    FederationTransport, JoinResponse, MembershipTemplate, TransportError,
};
use lattica_server::{
    EventSigningEngine, FederationEventHandler, PduOutcome, PermissiveRules, StateResolver,
};
use lattica_store::{EventStore, MemoryEventStore};

const ROOM: &str = "!room:example.org";
const ALICE: &str = "@alice:example.org";
const BOB: &str = "@bob:example.org";

/// Transport that serves events out of a fixed map, standing in for the rest
/// of the federation. Membership handshakes are not exercised here.
struct MapTransport {
    events: HashMap<String, Event>,
}

impl MapTransport {
    fn new(events: &[Event]) -> Self {
        Self {
            events: events.iter().map(|e| (e.event_id.clone(), e.clone())).collect(),
        }
    }

    fn unsupported(&self, destination: &str) -> TransportError {
        TransportError::BadResponse {
            destination: destination.to_string(),
            message: "endpoint not served by this fixture".to_string(),
        }
    }
}

#[async_trait]
impl FederationTransport for MapTransport {
    async fn make_membership_event(
        &self,
        destination: &str,
        _room_id: &str,
        _user_id: &str,
        _membership: Membership,
    ) -> Result<MembershipTemplate, TransportError> {
        Err(self.unsupported(destination))
    }

    async fn send_join(
        &self,
        destination: &str,
        _room_id: &str,
        _event: &Event,
    ) -> Result<JoinResponse, TransportError> {
        Err(self.unsupported(destination))
    }

    async fn send_leave(
        &self,
        destination: &str,
        _room_id: &str,
        _event: &Event,
    ) -> Result<(), TransportError> {
        Err(self.unsupported(destination))
    }

    async fn send_knock(
        &self,
        destination: &str,
        _room_id: &str,
        _event: &Event,
    ) -> Result<Vec<Value>, TransportError> {
        Err(self.unsupported(destination))
    }

    async fn send_invite(
        &self,
        destination: &str,
        _room_id: &str,
        _room_version: &RoomVersion,
        _event: &Event,
    ) -> Result<Event, TransportError> {
        Err(self.unsupported(destination))
    }

    async fn get_missing_events(
        &self,
        _destination: &str,
        _room_id: &str,
        _earliest: &[String],
        latest: &[String],
        _limit: u32,
    ) -> Result<Vec<Event>, TransportError> {
        Ok(latest.iter().filter_map(|id| self.events.get(id).cloned()).collect())
    }

    async fn backfill(
        &self,
        _destination: &str,
        _room_id: &str,
        event_ids: &[String],
        _limit: u32,
    ) -> Result<Vec<Event>, TransportError> {
        Ok(event_ids.iter().filter_map(|id| self.events.get(id).cloned()).collect())
    }

    async fn get_event(
        &self,
        destination: &str,
        event_id: &str,
    ) -> Result<Event, TransportError> {
        self.events.get(event_id).cloned().ok_or_else(|| TransportError::Http {
            destination: destination.to_string(),
            status: 404,
            message: format!("{event_id} not found"),
        })
    }
}

fn signing_engine() -> Arc<EventSigningEngine> {
    let signing_key = SigningKey::from_bytes(&[7u8; 32]);
    let mut keyring = StaticKeyring::new();
    keyring.insert(
        "example.org",
        VerifyKey {
            key_id: "ed25519:itest".to_string(),
            key: signing_key.verifying_key(),
            valid_until_ts: None,
        },
    );
    Arc::new(EventSigningEngine::new(
        "example.org",
        "ed25519:itest",
        signing_key,
        Arc::new(keyring),
    ))
}

fn build_event(
    engine: &EventSigningEngine,
    sender: &str,
    event_type: &str,
    state_key: Option<&str>,
    content: Value,
    auth: &[&Event],
    prev: &[&Event],
    depth: i64,
) -> Event {
    let mut event = Event {
        room_id: ROOM.to_string(),
        sender: sender.to_string(),
        event_type: event_type.to_string(),
        state_key: state_key.map(str::to_string),
        content,
        origin_server_ts: 1_700_000_000_000 + depth,
        depth: Some(depth),
        auth_events: Some(auth.iter().map(|e| e.event_id.clone()).collect()),
        prev_events: Some(prev.iter().map(|e| e.event_id.clone()).collect()),
        ..Default::default()
    };
    engine.hash_and_sign(&mut event, &RoomVersion::V10).expect("signing fixture event");
    event
}

/// A small public room on version 10: create, the creator's join, power
/// levels, public join rules, a second member and a message.
fn public_room(engine: &EventSigningEngine) -> Vec<Event> {
    let create = build_event(
        engine,
        ALICE,
        "m.room.create",
        Some(""),
        json!({"creator": ALICE, "room_version": "10"}),
        &[],
        &[],
        1,
    );
    let alice_join = build_event(
        engine,
        ALICE,
        "m.room.member",
        Some(ALICE),
        json!({"membership": "join"}),
        &[&create],
        &[&create],
        2,
    );
    let power_levels = build_event(
        engine,
        ALICE,
        "m.room.power_levels",
        Some(""),
        json!({
            "users": {ALICE: 100},
            "users_default": 0,
            "events_default": 0,
            "state_default": 50,
            "ban": 50,
            "kick": 50,
            "redact": 50,
            "invite": 0,
        }),
        &[&create, &alice_join],
        &[&alice_join],
        3,
    );
    let join_rules = build_event(
        engine,
        ALICE,
        "m.room.join_rules",
        Some(""),
        json!({"join_rule": "public"}),
        &[&create, &alice_join, &power_levels],
        &[&power_levels],
        4,
    );
    let bob_join = build_event(
        engine,
        BOB,
        "m.room.member",
        Some(BOB),
        json!({"membership": "join"}),
        &[&create, &power_levels, &join_rules],
        &[&join_rules],
        5,
    );
    let message = build_event(
        engine,
        BOB,
        "m.room.message",
        None,
        json!({"msgtype": "m.text", "body": "hi"}),
        &[&create, &power_levels, &bob_join],
        &[&bob_join],
        6,
    );
    vec![create, alice_join, power_levels, join_rules, bob_join, message]
}

fn make_handler(
    store: Arc<MemoryEventStore>,
    transport: Arc<dyn FederationTransport>,
) -> FederationEventHandler {
    let config = FederationConfig::new("example.org", "ed25519:itest");
    let resolver = Arc::new(StateResolver::new(store.clone(), &config.cache));
    FederationEventHandler::new(
        config,
        store,
        transport,
        signing_engine(),
        resolver,
        Arc::new(PermissiveRules),
    )
}

async fn current_state(store: &MemoryEventStore) -> BTreeMap<StateKey, String> {
    store
        .get_current_state_ids(ROOM)
        .await
        .expect("reading current state")
        .into_iter()
        .collect()
}

async fn deliver_all(handler: &FederationEventHandler, events: &[&Event]) {
    for event in events {
        handler
            .on_receive_pdu("example.org", (*event).clone())
            .await
            .expect("pipeline should not error for this fixture");
    }
}

#[tokio::test]
async fn in_order_delivery_persists_everything() {
    let engine = signing_engine();
    let events = public_room(&engine);
    let store = Arc::new(MemoryEventStore::new());
    let handler = make_handler(store.clone(), Arc::new(MapTransport::new(&events)));

    for event in &events {
        let outcome = handler
            .on_receive_pdu("example.org", event.clone())
            .await
            .expect("delivery");
        assert_eq!(
            outcome,
            PduOutcome::Persisted { event_id: event.event_id.clone(), soft_failed: false },
            "event {} at depth {:?}",
            event.event_type,
            event.depth
        );
    }

    let state = current_state(&store).await;
    assert_eq!(state.len(), 5);
    assert_eq!(state.get(&StateKey::for_type("m.room.create")), Some(&events[0].event_id));
    assert_eq!(state.get(&StateKey::member(BOB)), Some(&events[4].event_id));
}

#[tokio::test]
async fn shuffled_delivery_converges_on_the_same_state() {
    let engine = signing_engine();
    let events = public_room(&engine);
    let transport = Arc::new(MapTransport::new(&events));

    let [create, alice_join, power_levels, join_rules, bob_join, message]: [&Event; 6] =
        events.iter().collect::<Vec<_>>().try_into().unwrap();

    // The create event has to land first so the room is known; everything
    // after it arrives in whatever order the network produced.
    let orders: Vec<Vec<&Event>> = vec![
        vec![create, alice_join, power_levels, join_rules, bob_join, message],
        vec![create, message, bob_join, join_rules, power_levels, alice_join],
        vec![create, power_levels, alice_join, bob_join, message, join_rules],
    ];

    let mut final_states = Vec::new();
    for order in &orders {
        let store = Arc::new(MemoryEventStore::new());
        let handler = make_handler(store.clone(), transport.clone());
        deliver_all(&handler, order).await;
        final_states.push(current_state(&store).await);
    }

    assert_eq!(final_states[0].len(), 5);
    assert_eq!(final_states[0], final_states[1]);
    assert_eq!(final_states[1], final_states[2]);
}

#[tokio::test]
async fn ancestors_pulled_as_outliers_still_enter_state() {
    let engine = signing_engine();
    let events = public_room(&engine);
    let store = Arc::new(MemoryEventStore::new());
    let handler = make_handler(store.clone(), Arc::new(MapTransport::new(&events)));

    // Only the create event and the newest message are delivered; the whole
    // chain in between arrives as fetched auth events and ancestors, and must
    // not stay stranded as stateless outliers.
    let message = &events[5];
    deliver_all(&handler, &[&events[0]]).await;
    let outcome = handler
        .on_receive_pdu("example.org", message.clone())
        .await
        .expect("delivery");
    assert_eq!(
        outcome,
        PduOutcome::Persisted { event_id: message.event_id.clone(), soft_failed: false }
    );

    let state = current_state(&store).await;
    assert_eq!(state.len(), 5);
    assert_eq!(state.get(&StateKey::member(BOB)), Some(&events[4].event_id));
    assert_eq!(
        state.get(&StateKey::for_type("m.room.power_levels")),
        Some(&events[2].event_id)
    );

    for event in &events {
        let stored = store.get_event(&event.event_id).await.unwrap().unwrap();
        assert!(!stored.is_outlier(), "{} left as outlier", event.event_type);
        assert_eq!(stored.soft_failed, Some(false), "{} soft-failed", event.event_type);
    }
}

#[tokio::test]
async fn redelivery_is_idempotent() {
    let engine = signing_engine();
    let events = public_room(&engine);
    let store = Arc::new(MemoryEventStore::new());
    let handler = make_handler(store.clone(), Arc::new(MapTransport::new(&events)));

    deliver_all(&handler, &events.iter().collect::<Vec<_>>()).await;
    let before = current_state(&store).await;

    for event in [&events[2], &events[5]] {
        let outcome = handler
            .on_receive_pdu("example.org", event.clone())
            .await
            .expect("redelivery");
        assert_eq!(outcome, PduOutcome::AlreadyKnown { event_id: event.event_id.clone() });
    }

    assert_eq!(current_state(&store).await, before);
}

#[tokio::test]
async fn power_grab_is_rejected_and_stays_out_of_state() {
    let engine = signing_engine();
    let events = public_room(&engine);
    let store = Arc::new(MemoryEventStore::new());
    let handler = make_handler(store.clone(), Arc::new(MapTransport::new(&events)));
    deliver_all(&handler, &events.iter().collect::<Vec<_>>()).await;

    let original_pl = events[2].event_id.clone();

    // Bob (power 0) tries to promote himself past state_default 50.
    let grab = build_event(
        &engine,
        BOB,
        "m.room.power_levels",
        Some(""),
        json!({"users": {ALICE: 100, BOB: 100}, "state_default": 50}),
        &[&events[0], &events[2], &events[4]],
        &[&events[5]],
        7,
    );
    let outcome = handler.on_receive_pdu("example.org", grab.clone()).await.expect("delivery");
    assert!(
        matches!(
            outcome,
            PduOutcome::Rejected { ref event_id, reason: RejectReason::AuthFailed(_) }
                if *event_id == grab.event_id
        ),
        "got {outcome:?}"
    );

    // The room keeps moving afterwards and the grab never surfaces.
    let followup = build_event(
        &engine,
        ALICE,
        "m.room.message",
        None,
        json!({"msgtype": "m.text", "body": "still here"}),
        &[&events[0], &events[2], &events[1]],
        &[&events[5]],
        7,
    );
    let outcome = handler.on_receive_pdu("example.org", followup.clone()).await.expect("delivery");
    assert_eq!(
        outcome,
        PduOutcome::Persisted { event_id: followup.event_id.clone(), soft_failed: false }
    );

    let state = current_state(&store).await;
    assert_eq!(state.get(&StateKey::for_type("m.room.power_levels")), Some(&original_pl));
}

#[tokio::test]
async fn event_without_sender_domain_signature_is_rejected() {
    let engine = signing_engine();
    let events = public_room(&engine);
    let store = Arc::new(MemoryEventStore::new());
    let handler = make_handler(store.clone(), Arc::new(MapTransport::new(&events)));
    deliver_all(&handler, &events.iter().collect::<Vec<_>>()).await;

    // Signed by example.org only, but claims a sender on another server.
    let forged = build_event(
        &engine,
        "@mallory:other.org",
        "m.room.message",
        None,
        json!({"msgtype": "m.text", "body": "trust me"}),
        &[&events[0], &events[2], &events[4]],
        &[&events[5]],
        7,
    );
    let outcome = handler.on_receive_pdu("example.org", forged.clone()).await.expect("delivery");
    assert!(
        matches!(outcome, PduOutcome::Rejected { reason: RejectReason::BadSignature(_), .. }),
        "got {outcome:?}"
    );
}

#[tokio::test]
async fn ban_resolved_over_concurrent_rejoin_regardless_of_arrival() {
    let engine = signing_engine();
    let mut events = public_room(&engine);
    let [create, _alice_join, power_levels, _join_rules, bob_join, message] = {
        let refs: Vec<Event> = events.clone();
        refs.try_into().unwrap()
    };

    // Alice bans Bob; concurrently Bob sends a fresh join off the old frontier.
    let ban = build_event(
        &engine,
        ALICE,
        "m.room.member",
        Some(BOB),
        json!({"membership": "ban"}),
        &[&create, &power_levels, &events[1], &bob_join],
        &[&message],
        7,
    );
    let rejoin = build_event(
        &engine,
        BOB,
        "m.room.member",
        Some(BOB),
        json!({"membership": "join"}),
        &[&create, &power_levels, &events[3]],
        &[&message],
        7,
    );
    events.push(ban.clone());
    events.push(rejoin.clone());
    let transport = Arc::new(MapTransport::new(&events));

    for order in [[&ban, &rejoin], [&rejoin, &ban]] {
        let store = Arc::new(MemoryEventStore::new());
        let handler = make_handler(store.clone(), transport.clone());
        deliver_all(&handler, &events[..6].iter().collect::<Vec<_>>()).await;
        for event in order {
            // The rejoin may be rejected or soft-failed depending on whether
            // the ban is already known; it must never end up in the state.
            let _ = handler.on_receive_pdu("example.org", event.clone()).await.expect("delivery");
        }

        let state = current_state(&store).await;
        assert_eq!(
            state.get(&StateKey::member(BOB)),
            Some(&ban.event_id),
            "ban must win, order {:?}",
            order.map(|e| e.content["membership"].as_str().unwrap()),
        );
    }
}
