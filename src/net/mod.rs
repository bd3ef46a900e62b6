//! TCP connection handling: per-session framing/IO and the connection
//! registry that owns the five listening endpoints.

pub mod registry;
pub mod session;

pub use registry::{ListenerPorts, Registry};
pub use session::{Endpoint, Session, SessionEvent, SessionId};
