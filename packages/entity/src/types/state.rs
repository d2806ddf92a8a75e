use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Key identifying one slot of room state: `(event_type, state_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub event_type: String,
    pub state_key: String,
}

impl StateKey {
    pub fn new(event_type: impl Into<String>, state_key: impl Into<String>) -> Self {
        Self { event_type: event_type.into(), state_key: state_key.into() }
    }

    /// Convenience for the common empty-state-key singleton slots
    /// (`m.room.create`, `m.room.power_levels`, ...).
    pub fn for_type(event_type: impl Into<String>) -> Self {
        Self::new(event_type, "")
    }

    pub fn member(user_id: impl Into<String>) -> Self {
        Self::new("m.room.member", user_id)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.event_type, self.state_key)
    }
}

/// One room's state at a point in the DAG: at most one value per
/// `(type, state_key)` pair. The value is an event ID when talking to the
/// store and a full `Event` inside the auth and resolution engines.
pub type StateMap<V> = HashMap<StateKey, V>;
