//! History backfill.
//!
//! Decides when fetching older history is worthwhile, which backwards
//! extremities to extend from, and which remote servers to ask. Backfill is
//! best-effort: a failed pass leaves the room exactly as it was.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use lattica_entity::types::{Event, Membership, StateKey};
use lattica_store::{EventStore, StoreError};

use crate::config::BackfillConfig;
use crate::federation::linearizer::Linearizer;
use crate::federation::transport::FederationTransport;

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("ingesting backfilled events failed: {0}")]
    Ingest(String),
}

/// Consumer of fetched history; implemented by the event handler so
/// backfilled PDUs run through the normal validation pipeline.
#[async_trait]
pub trait PduSink: Send + Sync {
    async fn ingest_backfilled(
        &self,
        origin: &str,
        room_id: &str,
        events: Vec<Event>,
    ) -> Result<(), BackfillError>;
}

pub struct BackfillWalker {
    store: Arc<dyn EventStore>,
    transport: Arc<dyn FederationTransport>,
    sink: Arc<dyn PduSink>,
    config: BackfillConfig,
    server_name: String,
    linearizer: Linearizer,
}

impl BackfillWalker {
    pub fn new(
        store: Arc<dyn EventStore>,
        transport: Arc<dyn FederationTransport>,
        sink: Arc<dyn PduSink>,
        config: BackfillConfig,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transport,
            sink,
            config,
            server_name: server_name.into(),
            linearizer: Linearizer::new(),
        }
    }

    /// Fetch older history for `room_id` if a pagination request at
    /// `current_depth` is close enough to a hole in our timeline. Returns
    /// whether any history was fetched. Single-flighted per room.
    #[instrument(skip(self), fields(room_id = %room_id))]
    pub async fn maybe_backfill(
        &self,
        room_id: &str,
        current_depth: i64,
        limit: u32,
    ) -> Result<bool, BackfillError> {
        let _room_guard = self.linearizer.lock(room_id).await;

        let mut extremities = self
            .store
            .get_oldest_event_ids_with_depth_in_room(room_id)
            .await?;
        if extremities.is_empty() {
            debug!("no backwards extremities, nothing to backfill");
            return Ok(false);
        }

        // Freshest frontier first.
        extremities.sort_by(|a, b| b.1.cmp(&a.1));
        let max_depth = extremities[0].1;

        // Far enough ahead of every hole that fetching now would be wasted
        // work; a later pagination closer to the hole will trigger it.
        if current_depth - 2 * i64::from(limit) > max_depth {
            debug!(
                current_depth,
                max_depth,
                limit,
                "not backfilling, pagination is ahead of the oldest extremity"
            );
            return Ok(false);
        }

        let mut to_request = Vec::new();
        for (event_id, depth) in extremities.iter().take(self.config.max_extremities) {
            if self.extremity_visible(room_id, event_id).await? {
                to_request.push(event_id.clone());
            } else {
                debug!(event_id = %event_id, depth, "skipping extremity invisible to local users");
            }
        }
        if to_request.is_empty() {
            return Ok(false);
        }

        let domains = self.likely_domains(room_id).await?;
        if domains.is_empty() {
            debug!("no remote domains to backfill from");
            return Ok(false);
        }

        let limit = limit.min(self.config.request_limit);
        for domain in &domains {
            match self.transport.backfill(domain, room_id, &to_request, limit).await {
                Ok(events) if events.is_empty() => {
                    debug!(domain = %domain, "remote returned no events");
                    continue;
                },
                Ok(events) => {
                    info!(domain = %domain, count = events.len(), "backfill succeeded");
                    self.sink.ingest_backfilled(domain, room_id, events).await?;
                    return Ok(true);
                },
                Err(error) => {
                    // A definitive remote "no" ends the pass; the caller
                    // still just sees locally-available history.
                    if !error.is_transient() {
                        warn!(domain = %domain, %error, "remote rejected backfill");
                        return Ok(false);
                    }
                    debug!(domain = %domain, %error, "backfill attempt failed, trying next domain");
                },
            }
        }

        Ok(false)
    }

    /// Whether local users could see history through this extremity. The
    /// extremity itself is a hole, so visibility is judged from its known
    /// successors and the room's history-visibility setting.
    async fn extremity_visible(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<bool, BackfillError> {
        let successors = self.store.get_successor_ids(event_id).await?;
        if successors.is_empty() {
            return Ok(false);
        }

        let state = self.store.get_current_state_ids(room_id).await?;
        let visibility = match state.get(&StateKey::for_type("m.room.history_visibility")) {
            Some(visibility_id) => self
                .store
                .get_event(visibility_id)
                .await?
                .and_then(|e| {
                    e.content
                        .get("history_visibility")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "shared".to_string()),
            None => "shared".to_string(),
        };

        match visibility.as_str() {
            "world_readable" | "shared" => Ok(true),
            _ => Ok(self.store.is_host_joined(room_id, &self.server_name).await?),
        }
    }

    /// Remote domains currently joined to the room, ordered by how early
    /// their earliest member joined. Excludes ourselves.
    async fn likely_domains(&self, room_id: &str) -> Result<Vec<String>, BackfillError> {
        let state = self.store.get_current_state_ids(room_id).await?;
        let member_ids: Vec<String> = state
            .iter()
            .filter(|(key, _)| key.event_type == "m.room.member")
            .map(|(_, id)| id.clone())
            .collect();

        let members = self.store.get_events(&member_ids).await?;

        let mut domain_depths: HashMap<String, i64> = HashMap::new();
        for member in members.values() {
            if member.membership() != Some(Membership::Join) {
                continue;
            }
            let Some(domain) = member.state_key.as_deref().and_then(|sk| {
                lattica_entity::types::event::domain_of(sk)
            }) else {
                continue;
            };
            if domain == self.server_name {
                continue;
            }
            let depth = member.depth.unwrap_or(i64::MAX);
            domain_depths
                .entry(domain.to_string())
                .and_modify(|d| *d = (*d).min(depth))
                .or_insert(depth);
        }

        let mut domains: Vec<(String, i64)> = domain_depths.into_iter().collect();
        domains.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(domains.into_iter().map(|(domain, _)| domain).collect())
    }
}
