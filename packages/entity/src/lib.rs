//! Pure protocol entity types for the Lattica federation engine.
//!
//! Everything in this crate is deterministic and I/O-free: the PDU event
//! record, room version descriptors, state maps, canonical JSON, hashing and
//! redaction. The engine crates build on these types; nothing here depends on
//! storage or the network.

pub mod hashing;
pub mod redaction;
pub mod types;
pub mod utils;

pub use types::{
    Event, EventContext, Membership, PduBuilder, RoomVersion, StateKey, StateMap,
};
