pub mod relay;
mod room;
mod session;
mod signaling;

pub use room::{Participant, Role, RoomRegistry, RosterEntry};
pub use session::ClassroomSession;
pub use signaling::{ClientMessage, ServerMessage};
