pub mod gateway;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod state;

pub use presence::PresenceService;
pub use protocol::ServerEvent;
pub use registry::ConnectionRegistry;
pub use state::{StateBroadcaster, StateKind};
