//! Storage contracts for the Lattica federation engine.
//!
//! The engine never talks to a database directly: it consumes the
//! [`EventStore`] trait, which defines the read/write contract for persisted
//! events and room state. [`MemoryEventStore`] is a complete in-process
//! implementation used by the engine's tests and by embedders that don't need
//! durability.

pub mod error;
pub mod event_store;
pub mod memory;

pub use error::StoreError;
pub use event_store::{EventStore, PersistedBatch};
pub use memory::MemoryEventStore;
