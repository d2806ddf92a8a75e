pub mod event;
pub mod room_version;
pub mod state;

pub use event::{Event, EventContext, Membership, PduBuilder};
pub use room_version::{EventIdFormat, RoomVersion, StateResolutionVersion};
pub use state::{StateKey, StateMap};
