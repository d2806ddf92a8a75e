//! Federation event-authorization and room-state-resolution engine.
//!
//! The crate decides which events are valid members of a room's history and
//! what the authoritative state of the room is, given servers that observe
//! events in different orders. Storage, key fetching, policy and the HTTP
//! layer are injected collaborators.

pub mod config;
pub mod federation;
pub mod hooks;

pub use config::{BackfillConfig, CacheConfig, ConfigError, FederationConfig, RetryConfig};
pub use federation::{
    BackfillWalker, EventSigningEngine, FederationEventHandler, FederationTransport,
    MembershipHandler, PduOutcome, StateResolver,
};
pub use hooks::{PermissiveRules, ThirdPartyRules};
