//! Federation engine: event authorization, state resolution, backfill and
//! the inbound PDU pipeline.

pub mod authorization;
pub mod backfill;
pub mod event_handler;
pub mod event_signing;
pub mod keyring;
pub mod linearizer;
pub mod membership;
pub mod state_resolution;
pub mod transport;

pub use authorization::{auth_types_for_event, check, AuthorizationError};
pub use backfill::{BackfillError, BackfillWalker, PduSink};
pub use event_handler::{FederationEventHandler, HandlerError, PduOutcome, RejectReason};
pub use event_signing::{EventSigningEngine, SigningError};
pub use keyring::{Keyring, KeyringError, StaticKeyring, VerifyKey};
pub use linearizer::Linearizer;
pub use membership::{
    DirectPersistJoin, MembershipError, MembershipHandler, RemoteJoinStrategy,
};
pub use state_resolution::{resolve, StateResolutionError, StateResolver};
pub use transport::{
    FederationTransport, JoinResponse, MatrixFederationClient, MembershipTemplate,
    RetryingTransport, TransportError,
};
