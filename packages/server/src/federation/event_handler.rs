//! Inbound PDU processing.
//!
//! Every received event walks the same pipeline: hash and signature
//! verification, auth-event resolution (fetching missing ones from the
//! origin), the auth rules, state computation at its position in the graph,
//! then atomic persistence. Rejected events are retained so redelivery is a
//! no-op, but they never contribute to state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use lattica_entity::hashing::{self, HashingError};
use lattica_entity::types::{Event, EventContext, EventIdFormat, RoomVersion, StateMap};
use lattica_store::{EventStore, StoreError};

use crate::config::FederationConfig;
use crate::federation::authorization::{self, auth_types_for_event};
use crate::federation::backfill::{BackfillError, PduSink};
use crate::federation::event_signing::EventSigningEngine;
use crate::federation::linearizer::Linearizer;
use crate::federation::state_resolution::StateResolver;
use crate::federation::transport::FederationTransport;
use crate::hooks::ThirdPartyRules;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Resolution(#[from] crate::federation::state_resolution::StateResolutionError),
    #[error("hashing failed: {0}")]
    Hashing(#[from] HashingError),
    #[error("room {0} is not known to this server")]
    UnknownRoom(String),
    #[error("room version {0} is not supported")]
    UnknownRoomVersion(String),
}

/// Why a PDU was permanently rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    BadSignature(String),
    MissingAuthEvents(String),
    AuthFailed(String),
    Blocked,
}

impl RejectReason {
    fn as_stored(&self) -> String {
        match self {
            Self::BadSignature(detail) => format!("bad_signature: {detail}"),
            Self::MissingAuthEvents(detail) => format!("missing_auth_events: {detail}"),
            Self::AuthFailed(detail) => format!("auth_failed: {detail}"),
            Self::Blocked => "event_blocked".to_string(),
        }
    }
}

/// Terminal state of one PDU's trip through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduOutcome {
    Persisted { event_id: String, soft_failed: bool },
    Rejected { event_id: String, reason: RejectReason },
    AlreadyKnown { event_id: String },
    /// Room join in progress; the event is parked and replayed after.
    Queued { event_id: String },
}

pub struct FederationEventHandler {
    config: FederationConfig,
    store: Arc<dyn EventStore>,
    transport: Arc<dyn FederationTransport>,
    signing: Arc<EventSigningEngine>,
    resolver: Arc<StateResolver>,
    hooks: Arc<dyn ThirdPartyRules>,
    room_locks: Linearizer,
    event_cache: Cache<String, Event>,
    /// Rooms mid-join, mapping to events parked until the join completes.
    join_queues: Mutex<HashMap<String, Vec<(String, Event)>>>,
}

impl FederationEventHandler {
    pub fn new(
        config: FederationConfig,
        store: Arc<dyn EventStore>,
        transport: Arc<dyn FederationTransport>,
        signing: Arc<EventSigningEngine>,
        resolver: Arc<StateResolver>,
        hooks: Arc<dyn ThirdPartyRules>,
    ) -> Self {
        let event_cache = Cache::builder()
            .max_capacity(config.cache.event_cache_capacity)
            .time_to_live(std::time::Duration::from_secs(config.cache.ttl_seconds))
            .build();
        Self {
            config,
            store,
            transport,
            signing,
            resolver,
            hooks,
            room_locks: Linearizer::new(),
            event_cache,
            join_queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Process one PDU received from `origin`.
    #[instrument(skip(self, event), fields(event_id = %event.event_id, room_id = %event.room_id))]
    pub async fn on_receive_pdu(
        &self,
        origin: &str,
        event: Event,
    ) -> Result<PduOutcome, HandlerError> {
        self.handle_pdu(origin, event, 0).await
    }

    fn handle_pdu<'a>(
        &'a self,
        origin: &'a str,
        mut event: Event,
        fetch_depth: u32,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<PduOutcome, HandlerError>> + Send + 'a>,
    > {
        Box::pin(async move {
            let room_id = event.room_id.clone();

            let room_version = match self.room_version_for(&room_id, &event).await? {
                Some(version) => version,
                None => {
                    // Room unknown; park the event if a join is underway.
                    let mut queues = self.join_queues.lock().await;
                    if let Some(queue) = queues.get_mut(&room_id) {
                        let event_id = event.event_id.clone();
                        queue.push((origin.to_string(), event));
                        debug!(event_id = %event_id, "queued event for room mid-join");
                        return Ok(PduOutcome::Queued { event_id });
                    }
                    return Err(HandlerError::UnknownRoom(room_id));
                },
            };

            if let Some(outcome) = self.verify_event_id(&mut event, &room_version).await? {
                return Ok(outcome);
            }

            if let Some(existing) = self.store.get_event(&event.event_id).await? {
                // An event previously fetched as an outlier gets a full pass
                // now that it has been delivered with its history attached.
                if !existing.is_outlier() || existing.is_rejected() {
                    debug!(event_id = %event.event_id, "duplicate delivery ignored");
                    return Ok(PduOutcome::AlreadyKnown { event_id: event.event_id });
                }
                debug!(event_id = %event.event_id, "processing previously seen outlier");
            }

            if let Err(reason) = self.signing.verify_event(&event, &room_version).await {
                return self
                    .reject(event, RejectReason::BadSignature(reason.to_string()))
                    .await;
            }

            let auth_state = match self
                .load_auth_events(origin, &event, fetch_depth)
                .await?
            {
                Ok(auth_state) => auth_state,
                Err(reason) => return self.reject(event, reason).await,
            };

            if let Err(reason) =
                authorization::check(&room_version, &event, &auth_state, false)
            {
                return self
                    .reject(event, RejectReason::AuthFailed(reason.to_string()))
                    .await;
            }

            if !self.hooks.check_event_allowed(&event, &auth_state).await {
                info!(event_id = %event.event_id, "event vetoed by policy hook");
                return self.reject(event, RejectReason::Blocked).await;
            }

            // Ancestor fetching recurses back into this pipeline, so it has
            // to happen before the room lock is taken.
            let unprocessed_prevs = self.unprocessed_prev_events(&event).await?;
            if !unprocessed_prevs.is_empty() {
                self.catch_up_prev_events(origin, &event, fetch_depth).await;
            }

            // From here on we mutate room state; serialize per room.
            let _room_guard = self.room_locks.lock(&room_id).await;

            let unprocessed_prevs = self.unprocessed_prev_events(&event).await?;
            if !unprocessed_prevs.is_empty() {
                warn!(
                    event_id = %event.event_id,
                    unprocessed = unprocessed_prevs.len(),
                    "persisting event with unresolvable ancestry as outlier"
                );
                let event_id = event.event_id.clone();
                self.store
                    .persist_events_and_notify(&room_id, vec![(event, EventContext::for_outlier())])
                    .await?;
                return Ok(PduOutcome::Persisted { event_id, soft_failed: false });
            }

            let state_before = if event.prev_event_ids().is_empty() {
                StateMap::new()
            } else {
                self.resolver
                    .resolve_at_events(&room_id, &room_version, event.prev_event_ids())
                    .await?
            };

            // An event can be validly authorized by its claimed auth events
            // yet fail against the room's actual current state; it is kept
            // but soft-failed so it cannot influence that state.
            let soft_failed = self
                .fails_against_current_state(&room_version, &event)
                .await?;
            if soft_failed {
                info!(event_id = %event.event_id, "soft-failing event against current state");
            }

            let mut state_after = state_before.clone();
            if let Some(pair) = event.state_key_pair() {
                if !soft_failed {
                    state_after.insert(pair, event.event_id.clone());
                }
            }

            let context = EventContext {
                state_before,
                state_after,
                outlier: false,
                rejected_reason: None,
                soft_failed,
            };

            let event_id = event.event_id.clone();
            self.event_cache.insert(event_id.clone(), event.clone()).await;
            self.store
                .persist_events_and_notify(&room_id, vec![(event.clone(), context)])
                .await?;
            self.hooks.on_new_event(&event).await;

            debug!(event_id = %event_id, soft_failed, "event persisted");
            Ok(PduOutcome::Persisted { event_id, soft_failed })
        })
    }

    /// Room version governing `event`. `None` when the room is unknown here.
    async fn room_version_for(
        &self,
        room_id: &str,
        event: &Event,
    ) -> Result<Option<RoomVersion>, HandlerError> {
        let create = if event.event_type == "m.room.create" {
            Some(event.clone())
        } else {
            self.store.get_room_create_event(room_id).await?
        };

        let Some(create) = create else {
            return Ok(None);
        };

        match create.content.get("room_version") {
            None => Ok(Some(RoomVersion::V1)),
            Some(value) => {
                let text = value.as_str().unwrap_or("");
                RoomVersion::parse(text)
                    .map(Some)
                    .ok_or_else(|| HandlerError::UnknownRoomVersion(text.to_string()))
            },
        }
    }

    /// For hash-derived formats the event ID is not trusted from the wire:
    /// it is recomputed, and a mismatch is treated like a bad signature.
    async fn verify_event_id(
        &self,
        event: &mut Event,
        room_version: &RoomVersion,
    ) -> Result<Option<PduOutcome>, HandlerError> {
        if room_version.event_id_format() == EventIdFormat::DomainQualified {
            return Ok(None);
        }

        let pdu = hashing::wire_json(event, room_version)?;
        let computed = hashing::compute_event_id(&pdu, room_version)?;

        if event.event_id.is_empty() {
            event.event_id = computed;
            return Ok(None);
        }
        if event.event_id != computed {
            let claimed = std::mem::replace(&mut event.event_id, computed.clone());
            warn!(claimed = %claimed, computed = %computed, "event id does not match content");
            return Ok(Some(PduOutcome::Rejected {
                event_id: claimed,
                reason: RejectReason::BadSignature("event id does not match content".to_string()),
            }));
        }
        Ok(None)
    }

    /// Build the `(type, state_key) -> Event` snapshot from the event's
    /// claimed auth events, fetching absent ones from the origin.
    async fn load_auth_events(
        &self,
        origin: &str,
        event: &Event,
        fetch_depth: u32,
    ) -> Result<Result<StateMap<Event>, RejectReason>, HandlerError> {
        let auth_ids = event.auth_event_ids().to_vec();
        let mut known = self.store.get_events(&auth_ids).await?;

        let missing: Vec<String> = auth_ids
            .iter()
            .filter(|id| !known.contains_key(*id))
            .cloned()
            .collect();

        if !missing.is_empty() {
            if fetch_depth >= self.config.max_auth_fetch_depth {
                return Ok(Err(RejectReason::MissingAuthEvents(format!(
                    "auth chain deeper than {} while fetching {}",
                    self.config.max_auth_fetch_depth,
                    missing.join(", ")
                ))));
            }

            for auth_id in &missing {
                match self.transport.get_event(origin, auth_id).await {
                    Ok(fetched) => {
                        // Auth ancestors arrive without their own history;
                        // they are validated and stored as outliers.
                        if let Err(error) =
                            self.ingest_outlier(origin, fetched, fetch_depth + 1).await
                        {
                            warn!(auth_id = %auth_id, %error, "failed to ingest auth event");
                        }
                    },
                    Err(error) => {
                        warn!(auth_id = %auth_id, %error, "failed to fetch auth event");
                    },
                }
            }

            known = self.store.get_events(&auth_ids).await?;
            let still_missing: Vec<String> = auth_ids
                .iter()
                .filter(|id| !known.contains_key(*id))
                .cloned()
                .collect();
            if !still_missing.is_empty() {
                return Ok(Err(RejectReason::MissingAuthEvents(still_missing.join(", "))));
            }
        }

        let mut auth_state = StateMap::new();
        for auth_event in known.into_values() {
            if auth_event.is_rejected() {
                continue;
            }
            if let Some(pair) = auth_event.state_key_pair() {
                auth_state.insert(pair, auth_event);
            }
        }
        Ok(Ok(auth_state))
    }

    /// Validate and persist an event fetched out of band (an auth ancestor
    /// or snapshot member) as an outlier. Boxed because it recurses through
    /// `load_auth_events` when the fetched event's own auth chain is absent.
    fn ingest_outlier<'a>(
        &'a self,
        origin: &'a str,
        mut event: Event,
        fetch_depth: u32,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<(), HandlerError>> + Send + 'a>,
    > {
        Box::pin(async move {
            let room_id = event.room_id.clone();
            let Some(room_version) = self.room_version_for(&room_id, &event).await? else {
                return Err(HandlerError::UnknownRoom(room_id));
            };

            if let Some(outcome) = self.verify_event_id(&mut event, &room_version).await? {
                debug!(?outcome, "dropping outlier with bad event id");
                return Ok(());
            }
            if self.store.get_event(&event.event_id).await?.is_some() {
                return Ok(());
            }
            if let Err(error) = self.signing.verify_event(&event, &room_version).await {
                warn!(event_id = %event.event_id, %error, "dropping outlier with bad signature");
                return Ok(());
            }

            // Recursively make sure its own auth chain is known, then auth it.
            let auth_state = match self
                .load_auth_events(origin, &event, fetch_depth)
                .await?
            {
                Ok(auth_state) => auth_state,
                Err(reason) => {
                    self.reject(event, reason).await?;
                    return Ok(());
                },
            };

            let context = match authorization::check(&room_version, &event, &auth_state, false) {
                Ok(()) => EventContext::for_outlier(),
                Err(reason) => EventContext::rejected(format!("auth_failed: {reason}")),
            };

            self.store
                .persist_events_and_notify(&room_id, vec![(event, context)])
                .await?;
            Ok(())
        })
    }

    /// Prev events that cannot anchor a state computation yet: absent from
    /// the store entirely, or held only as outliers with no computed state.
    async fn unprocessed_prev_events(&self, event: &Event) -> Result<Vec<String>, HandlerError> {
        let prev_ids = event.prev_event_ids().to_vec();
        let known = self.store.get_events(&prev_ids).await?;
        Ok(prev_ids
            .into_iter()
            .filter(|id| match known.get(id) {
                None => true,
                Some(prev) => prev.is_outlier() && !prev.is_rejected(),
            })
            .collect())
    }

    /// Best-effort ancestry completion: absent ancestors are fetched from the
    /// origin, and ancestors held only as outliers are re-run through the
    /// pipeline so they gain state before their descendant computes its own.
    async fn catch_up_prev_events(&self, origin: &str, event: &Event, fetch_depth: u32) {
        let prev_ids = event.prev_event_ids().to_vec();
        let known = match self.store.get_events(&prev_ids).await {
            Ok(known) => known,
            Err(error) => {
                warn!(%error, "could not read prev events for missing-event fetch");
                return;
            },
        };

        if known.len() < prev_ids.len() {
            let earliest = match self.store.get_forward_extremity_ids(&event.room_id).await {
                Ok(extremities) => extremities,
                Err(error) => {
                    warn!(%error, "could not enumerate extremities for missing-event fetch");
                    return;
                },
            };

            match self
                .transport
                .get_missing_events(origin, &event.room_id, &earliest, &prev_ids, 10)
                .await
            {
                Ok(mut fetched) => {
                    fetched.sort_by_key(|e| e.depth.unwrap_or(0));
                    for missing in fetched {
                        if let Err(error) =
                            self.handle_pdu(origin, missing, fetch_depth + 1).await
                        {
                            warn!(%error, "failed to process fetched ancestor");
                        }
                    }
                },
                Err(error) => {
                    debug!(%error, "get_missing_events failed");
                },
            }
        }

        let mut outliers: Vec<Event> = known
            .into_values()
            .filter(|prev| prev.is_outlier() && !prev.is_rejected())
            .collect();
        outliers.sort_by_key(|e| e.depth.unwrap_or(0));
        for prev in outliers {
            if let Err(error) = self.handle_pdu(origin, prev, fetch_depth + 1).await {
                warn!(%error, "failed to upgrade outlier ancestor");
            }
        }
    }

    /// The soft-failure check: the event must also pass auth against the
    /// room's current state, not just its claimed auth events.
    async fn fails_against_current_state(
        &self,
        room_version: &RoomVersion,
        event: &Event,
    ) -> Result<bool, HandlerError> {
        let extremities = self.store.get_forward_extremity_ids(&event.room_id).await?;
        if extremities.is_empty() {
            return Ok(false);
        }

        let current_state = self
            .resolver
            .resolve_at_events(&event.room_id, room_version, &extremities)
            .await?;

        let mut auth_state = StateMap::new();
        for key in auth_types_for_event(room_version, event) {
            if let Some(event_id) = current_state.get(&key) {
                if let Some(auth_event) = self.lookup_event(event_id).await? {
                    auth_state.insert(key, auth_event);
                }
            }
        }

        Ok(authorization::check(room_version, event, &auth_state, false).is_err())
    }

    async fn lookup_event(&self, event_id: &str) -> Result<Option<Event>, HandlerError> {
        if let Some(cached) = self.event_cache.get(event_id).await {
            return Ok(Some(cached));
        }
        let event = self.store.get_event(event_id).await?;
        if let Some(event) = &event {
            self.event_cache.insert(event_id.to_string(), event.clone()).await;
        }
        Ok(event)
    }

    /// Persist a permanently rejected event. Retention makes redelivery of
    /// the same event id a no-op.
    async fn reject(
        &self,
        event: Event,
        reason: RejectReason,
    ) -> Result<PduOutcome, HandlerError> {
        let event_id = event.event_id.clone();
        let room_id = event.room_id.clone();
        warn!(event_id = %event_id, reason = %reason.as_stored(), "rejecting event");

        self.store
            .persist_events_and_notify(
                &room_id,
                vec![(event, EventContext::rejected(reason.as_stored()))],
            )
            .await?;
        Ok(PduOutcome::Rejected { event_id, reason })
    }

    /// Start parking events for a room whose join handshake is in flight.
    pub async fn begin_room_join(&self, room_id: &str) {
        self.join_queues
            .lock()
            .await
            .entry(room_id.to_string())
            .or_default();
    }

    /// Finish a join: replay parked events in arrival order. Replay is
    /// best-effort; failures are logged per event.
    pub async fn complete_room_join(&self, room_id: &str) {
        let queued = self.join_queues.lock().await.remove(room_id).unwrap_or_default();
        if queued.is_empty() {
            return;
        }

        info!(room_id = %room_id, count = queued.len(), "replaying events parked during join");
        for (origin, event) in queued {
            if let Err(error) = self.on_receive_pdu(&origin, event).await {
                warn!(room_id = %room_id, %error, "parked event failed on replay");
            }
        }
    }

    /// Abort a pending join, dropping anything parked for the room.
    pub async fn abort_room_join(&self, room_id: &str) {
        self.join_queues.lock().await.remove(room_id);
    }

    /// Persist a room snapshot from a join handshake: the auth chain and
    /// state as outliers, then the join event itself with that state.
    pub async fn persist_join_snapshot(
        &self,
        origin: &str,
        room_version: &RoomVersion,
        join_event: Event,
        state: Vec<Event>,
        auth_chain: Vec<Event>,
    ) -> Result<PduOutcome, HandlerError> {
        let room_id = join_event.room_id.clone();
        let _room_guard = self.room_locks.lock(&room_id).await;

        let mut snapshot = auth_chain;
        snapshot.extend(state.iter().cloned());
        snapshot.sort_by_key(|e| e.depth.unwrap_or(0));
        for event in snapshot {
            if let Err(error) = self.ingest_outlier(origin, event, 0).await {
                warn!(%error, "failed to ingest snapshot event");
            }
        }

        let mut state_before = StateMap::new();
        for state_event in &state {
            if let Some(pair) = state_event.state_key_pair() {
                state_before.insert(pair, state_event.event_id.clone());
            }
        }

        let auth_state = {
            let mut map = StateMap::new();
            for state_event in &state {
                if let Some(pair) = state_event.state_key_pair() {
                    map.insert(pair, state_event.clone());
                }
            }
            map
        };
        if let Err(reason) = authorization::check(room_version, &join_event, &auth_state, false)
        {
            return self
                .reject(join_event, RejectReason::AuthFailed(reason.to_string()))
                .await;
        }

        let mut state_after = state_before.clone();
        if let Some(pair) = join_event.state_key_pair() {
            state_after.insert(pair, join_event.event_id.clone());
        }

        let event_id = join_event.event_id.clone();
        let context = EventContext {
            state_before,
            state_after,
            outlier: false,
            rejected_reason: None,
            soft_failed: false,
        };
        self.store
            .persist_events_and_notify(&room_id, vec![(join_event, context)])
            .await?;

        Ok(PduOutcome::Persisted { event_id, soft_failed: false })
    }
}

#[async_trait]
impl PduSink for FederationEventHandler {
    async fn ingest_backfilled(
        &self,
        origin: &str,
        _room_id: &str,
        mut events: Vec<Event>,
    ) -> Result<(), BackfillError> {
        // Oldest first so ancestors land before their children.
        events.sort_by_key(|e| e.depth.unwrap_or(0));
        for event in events {
            if let Err(error) = self.on_receive_pdu(origin, event).await {
                return Err(BackfillError::Ingest(error.to_string()));
            }
        }
        Ok(())
    }
}
