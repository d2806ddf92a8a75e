//! Federation-facing membership operations.
//!
//! Outbound: joining, knocking on and rejecting invites to rooms another
//! server is resident in. Inbound: answering `make_join`/`make_leave`/
//! `make_knock` template requests and accepting invites for local users.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use lattica_entity::types::event::domain_of;
use lattica_entity::types::{Event, EventContext, Membership, RoomVersion, StateKey, StateMap};
use lattica_store::{EventStore, StoreError};

use crate::federation::authorization::{
    self, auth_types_for_event, user_power_level, AuthorizationError,
};
use crate::federation::event_handler::{FederationEventHandler, HandlerError, PduOutcome};
use crate::federation::event_signing::{EventSigningEngine, SigningError};
use crate::federation::transport::{FederationTransport, JoinResponse, TransportError};
use crate::hooks::ThirdPartyRules;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error("no remote server could satisfy the request, last error: {0}")]
    AllServersFailed(TransportError),
    #[error("no remote servers supplied")]
    NoServers,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("room {0} is not known to this server")]
    UnknownRoom(String),
    #[error("malformed remote template: {0}")]
    BadTemplate(String),
}

impl From<AuthorizationError> for MembershipError {
    fn from(error: AuthorizationError) -> Self {
        Self::Forbidden(error.to_string())
    }
}

/// How a successful remote join handshake becomes local room state.
/// Deployment topologies differ here: a single process persists directly,
/// a split one forwards the snapshot to its writer.
#[async_trait]
pub trait RemoteJoinStrategy: Send + Sync {
    async fn persist_join(
        &self,
        origin: &str,
        room_version: &RoomVersion,
        join_event: Event,
        response: JoinResponse,
    ) -> Result<PduOutcome, MembershipError>;
}

/// In-process persistence via the federation event handler.
pub struct DirectPersistJoin {
    handler: Arc<FederationEventHandler>,
}

impl DirectPersistJoin {
    pub fn new(handler: Arc<FederationEventHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl RemoteJoinStrategy for DirectPersistJoin {
    async fn persist_join(
        &self,
        origin: &str,
        room_version: &RoomVersion,
        join_event: Event,
        response: JoinResponse,
    ) -> Result<PduOutcome, MembershipError> {
        Ok(self
            .handler
            .persist_join_snapshot(
                origin,
                room_version,
                join_event,
                response.state,
                response.auth_chain,
            )
            .await?)
    }
}

pub struct MembershipHandler {
    store: Arc<dyn EventStore>,
    transport: Arc<dyn FederationTransport>,
    signing: Arc<EventSigningEngine>,
    handler: Arc<FederationEventHandler>,
    join_strategy: Arc<dyn RemoteJoinStrategy>,
    hooks: Arc<dyn ThirdPartyRules>,
    server_name: String,
}

impl MembershipHandler {
    pub fn new(
        store: Arc<dyn EventStore>,
        transport: Arc<dyn FederationTransport>,
        signing: Arc<EventSigningEngine>,
        handler: Arc<FederationEventHandler>,
        join_strategy: Arc<dyn RemoteJoinStrategy>,
        hooks: Arc<dyn ThirdPartyRules>,
    ) -> Self {
        let server_name = signing.server_name().to_string();
        Self { store, transport, signing, handler, join_strategy, hooks, server_name }
    }

    /// Join `user_id` to a remote room via the make_join/send_join dance.
    ///
    /// Servers are tried in order until one completes the handshake. Events
    /// arriving for the room while the dance is in flight are parked and
    /// replayed once the join lands.
    #[instrument(skip(self, remote_servers), fields(room_id = %room_id, user_id = %user_id))]
    pub async fn do_invite_join(
        &self,
        remote_servers: &[String],
        room_id: &str,
        user_id: &str,
        extra_content: Value,
    ) -> Result<PduOutcome, MembershipError> {
        if remote_servers.is_empty() {
            return Err(MembershipError::NoServers);
        }

        self.handler.begin_room_join(room_id).await;
        let result = self
            .try_join_via(remote_servers, room_id, user_id, extra_content)
            .await;

        match &result {
            Ok(_) => self.handler.complete_room_join(room_id).await,
            Err(_) => self.handler.abort_room_join(room_id).await,
        }
        result
    }

    async fn try_join_via(
        &self,
        remote_servers: &[String],
        room_id: &str,
        user_id: &str,
        extra_content: Value,
    ) -> Result<PduOutcome, MembershipError> {
        let mut last_error = None;

        for destination in remote_servers {
            let template = match self
                .transport
                .make_membership_event(destination, room_id, user_id, Membership::Join)
                .await
            {
                Ok(template) => template,
                Err(error) => {
                    debug!(destination = %destination, %error, "make_join failed");
                    last_error = Some(error);
                    continue;
                },
            };

            let room_version = template.room_version;
            let mut join_event = self.event_from_template(template.event, &extra_content)?;
            self.signing.hash_and_sign(&mut join_event, &room_version)?;

            match self.transport.send_join(destination, room_id, &join_event).await {
                Ok(response) => {
                    info!(destination = %destination, "join handshake complete");
                    let origin = response.origin.clone();
                    return self
                        .join_strategy
                        .persist_join(&origin, &room_version, join_event, response)
                        .await;
                },
                Err(error) => {
                    warn!(destination = %destination, %error, "send_join failed");
                    last_error = Some(error);
                },
            }
        }

        Err(MembershipError::AllServersFailed(last_error.unwrap_or(
            TransportError::Unreachable {
                destination: String::new(),
                message: "no servers tried".to_string(),
            },
        )))
    }

    /// Knock on a remote room; returns the stripped state the remote shares
    /// with knockers.
    pub async fn do_knock(
        &self,
        remote_servers: &[String],
        room_id: &str,
        user_id: &str,
    ) -> Result<Vec<Value>, MembershipError> {
        let mut last_error = None;

        for destination in remote_servers {
            let template = match self
                .transport
                .make_membership_event(destination, room_id, user_id, Membership::Knock)
                .await
            {
                Ok(template) => template,
                Err(error) => {
                    last_error = Some(error);
                    continue;
                },
            };

            let room_version = template.room_version;
            let mut knock_event = self.event_from_template(template.event, &json!({}))?;
            self.signing.hash_and_sign(&mut knock_event, &room_version)?;

            match self.transport.send_knock(destination, room_id, &knock_event).await {
                Ok(stripped_state) => return Ok(stripped_state),
                Err(error) => {
                    warn!(destination = %destination, %error, "send_knock failed");
                    last_error = Some(error);
                },
            }
        }

        Err(MembershipError::AllServersFailed(last_error.unwrap_or(
            TransportError::Unreachable {
                destination: String::new(),
                message: "no servers tried".to_string(),
            },
        )))
    }

    /// Reject an invite for a room we hold no state of by asking a resident
    /// server to issue the leave on our behalf.
    pub async fn do_remotely_reject_invite(
        &self,
        remote_servers: &[String],
        room_id: &str,
        user_id: &str,
    ) -> Result<(), MembershipError> {
        let mut last_error = None;

        for destination in remote_servers {
            let template = match self
                .transport
                .make_membership_event(destination, room_id, user_id, Membership::Leave)
                .await
            {
                Ok(template) => template,
                Err(error) => {
                    last_error = Some(error);
                    continue;
                },
            };

            let room_version = template.room_version;
            let mut leave_event = self.event_from_template(template.event, &json!({}))?;
            self.signing.hash_and_sign(&mut leave_event, &room_version)?;

            match self.transport.send_leave(destination, room_id, &leave_event).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    last_error = Some(error);
                },
            }
        }

        Err(MembershipError::AllServersFailed(last_error.unwrap_or(
            TransportError::Unreachable {
                destination: String::new(),
                message: "no servers tried".to_string(),
            },
        )))
    }

    fn event_from_template(
        &self,
        template: Value,
        extra_content: &Value,
    ) -> Result<Event, MembershipError> {
        let mut event: Event = serde_json::from_value(template)
            .map_err(|e| MembershipError::BadTemplate(e.to_string()))?;

        if let (Some(content), Some(extra)) =
            (event.content.as_object_mut(), extra_content.as_object())
        {
            for (key, value) in extra {
                content.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        event.origin_server_ts = chrono::Utc::now().timestamp_millis();
        Ok(event)
    }

    /// Answer a remote server's `make_join`: a prototype join event for
    /// `user_id`, built against our current state, or a rejection.
    #[instrument(skip(self), fields(room_id = %room_id, user_id = %user_id))]
    pub async fn on_make_join_request(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<(RoomVersion, Value), MembershipError> {
        let (room_version, prototype) = self
            .build_membership_prototype(room_id, user_id, Membership::Join)
            .await?;
        let template = serde_json::to_value(&prototype)
            .map_err(|e| MembershipError::BadTemplate(e.to_string()))?;
        Ok((room_version, template))
    }

    pub async fn on_make_leave_request(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<(RoomVersion, Value), MembershipError> {
        let (room_version, prototype) = self
            .build_membership_prototype(room_id, user_id, Membership::Leave)
            .await?;
        let template = serde_json::to_value(&prototype)
            .map_err(|e| MembershipError::BadTemplate(e.to_string()))?;
        Ok((room_version, template))
    }

    pub async fn on_make_knock_request(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<(RoomVersion, Value), MembershipError> {
        let (room_version, prototype) = self
            .build_membership_prototype(room_id, user_id, Membership::Knock)
            .await?;
        let template = serde_json::to_value(&prototype)
            .map_err(|e| MembershipError::BadTemplate(e.to_string()))?;
        Ok((room_version, template))
    }

    /// Accept an invite event for one of our users: policy-check it,
    /// countersign it and retain it as an outlier the user can act on.
    pub async fn on_invite_request(
        &self,
        origin: &str,
        room_version: &RoomVersion,
        mut invite: Event,
    ) -> Result<Event, MembershipError> {
        let invitee = invite.state_key.clone().ok_or_else(|| {
            MembershipError::BadTemplate("invite without state_key".to_string())
        })?;

        if domain_of(&invitee) != Some(self.server_name.as_str()) {
            return Err(MembershipError::Forbidden(format!(
                "{invitee} is not a local user"
            )));
        }
        if invite.membership() != Some(Membership::Invite) {
            return Err(MembershipError::BadTemplate(
                "invite event without invite membership".to_string(),
            ));
        }
        if domain_of(&invite.sender) != Some(origin) {
            return Err(MembershipError::Forbidden(
                "invite sender does not belong to the sending server".to_string(),
            ));
        }

        if !self
            .hooks
            .check_can_invite(&invite.sender, &invitee, &invite.room_id)
            .await
        {
            return Err(MembershipError::Forbidden("invite blocked by policy".to_string()));
        }

        self.signing.add_signature(&mut invite, room_version)?;

        // The invite arrives without any room history; keep it as an
        // outlier so the user can later accept or reject it.
        let room_id = invite.room_id.clone();
        self.store
            .persist_events_and_notify(&room_id, vec![(invite.clone(), EventContext::for_outlier())])
            .await?;

        info!(room_id = %invite.room_id, invitee = %invitee, "stored remote invite");
        Ok(invite)
    }

    /// Build an unsigned membership event for `user_id` against our current
    /// state and check it would pass authorization.
    async fn build_membership_prototype(
        &self,
        room_id: &str,
        user_id: &str,
        membership: Membership,
    ) -> Result<(RoomVersion, Event), MembershipError> {
        let create = self
            .store
            .get_room_create_event(room_id)
            .await?
            .ok_or_else(|| MembershipError::UnknownRoom(room_id.to_string()))?;
        let room_version = match create.content.get("room_version") {
            None => RoomVersion::V1,
            Some(value) => RoomVersion::parse(value.as_str().unwrap_or(""))
                .ok_or_else(|| MembershipError::Forbidden("unsupported room version".to_string()))?,
        };

        let current_state_ids = self.store.get_current_state_ids(room_id).await?;
        let state_event_ids: Vec<String> = current_state_ids.values().cloned().collect();
        let state_events = self.store.get_events(&state_event_ids).await?;
        let mut current_state: StateMap<Event> = StateMap::new();
        for event in state_events.into_values() {
            if let Some(pair) = event.state_key_pair() {
                current_state.insert(pair, event);
            }
        }

        let prev_event_ids = self.store.get_forward_extremity_ids(room_id).await?;
        let prev_events = self.store.get_events(&prev_event_ids).await?;
        let depth = prev_events
            .values()
            .filter_map(|e| e.depth)
            .max()
            .unwrap_or(0)
            + 1;

        let mut content = json!({"membership": membership.as_str()});
        if membership == Membership::Join {
            self.maybe_authorise_restricted_join(
                &room_version,
                user_id,
                &current_state,
                &mut content,
            )?;
        }

        let mut prototype = Event {
            event_id: String::new(),
            room_id: room_id.to_string(),
            sender: user_id.to_string(),
            origin_server_ts: chrono::Utc::now().timestamp_millis(),
            event_type: "m.room.member".to_string(),
            state_key: Some(user_id.to_string()),
            content,
            prev_events: Some(prev_event_ids),
            depth: Some(depth),
            ..Default::default()
        };

        let auth_state: StateMap<Event> = auth_types_for_event(&room_version, &prototype)
            .into_iter()
            .filter_map(|key| current_state.get(&key).map(|e| (key, e.clone())))
            .collect();
        prototype.auth_events =
            Some(auth_state.values().map(|e| e.event_id.clone()).collect());

        authorization::check(&room_version, &prototype, &auth_state, false)?;

        Ok((room_version, prototype))
    }

    /// For restricted rooms, pick a local member entitled to authorise the
    /// join and record them on the prototype.
    fn maybe_authorise_restricted_join(
        &self,
        room_version: &RoomVersion,
        user_id: &str,
        current_state: &StateMap<Event>,
        content: &mut Value,
    ) -> Result<(), MembershipError> {
        if !room_version.restricted_joins() {
            return Ok(());
        }

        let join_rule = current_state
            .get(&StateKey::for_type("m.room.join_rules"))
            .and_then(|jr| jr.content.get("join_rule"))
            .and_then(Value::as_str)
            .unwrap_or("invite");
        if join_rule != "restricted" && join_rule != "knock_restricted" {
            return Ok(());
        }

        // An already invited or joined user needs no authoriser.
        let requester_membership = current_state
            .get(&StateKey::member(user_id))
            .and_then(Event::membership);
        if matches!(
            requester_membership,
            Some(Membership::Join) | Some(Membership::Invite)
        ) {
            return Ok(());
        }

        let invite_level = current_state
            .get(&StateKey::for_type("m.room.power_levels"))
            .and_then(|pl| pl.content.get("invite"))
            .and_then(Value::as_i64)
            .unwrap_or(0);

        let mut local_members: Vec<&Event> = current_state
            .iter()
            .filter(|(key, event)| {
                key.event_type == "m.room.member"
                    && event.membership() == Some(Membership::Join)
                    && domain_of(&key.state_key) == Some(self.server_name.as_str())
            })
            .map(|(_, event)| event)
            .collect();
        local_members.sort_by_key(|e| e.state_key.clone());

        let authoriser = local_members
            .into_iter()
            .map(|member| member.state_key.as_deref().unwrap_or(""))
            .find(|member_id| {
                user_power_level(room_version, member_id, current_state) >= invite_level
            })
            .ok_or_else(|| {
                MembershipError::Forbidden(
                    "no local user can authorise this restricted join".to_string(),
                )
            })?;

        content["join_authorised_via_users_server"] = json!(authoriser);
        Ok(())
    }
}
