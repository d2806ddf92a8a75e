use async_trait::async_trait;

use lattica_entity::types::{Event, StateMap};

/// Deployment-specific policy hooks consulted during event processing.
///
/// Hooks run after protocol authorization, so they can only narrow what is
/// allowed, never widen it. The default implementation permits everything.
#[async_trait]
pub trait ThirdPartyRules: Send + Sync {
    /// Whether `event` may be admitted, given the state it was checked
    /// against. A veto rejects the event with an `event_blocked` reason.
    async fn check_event_allowed(
        &self,
        _event: &Event,
        _state: &StateMap<Event>,
    ) -> bool {
        true
    }

    /// Whether a remote user may be invited into a room on this server.
    async fn check_can_invite(&self, _inviter: &str, _invitee: &str, _room_id: &str) -> bool {
        true
    }

    /// Called after an event has been durably persisted. Failures here are
    /// logged and ignored; persistence has already happened.
    async fn on_new_event(&self, _event: &Event) {}
}

/// Hook implementation that applies no additional policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveRules;

#[async_trait]
impl ThirdPartyRules for PermissiveRules {}
