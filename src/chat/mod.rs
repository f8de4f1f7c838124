//! Chat session fabric
//!
//! Sessions own sockets, the registry actor owns the shared state
//! (session set, nickname index, room map), and listeners glue accepted
//! sockets to new sessions. All three transports (line TCP, WebSocket,
//! WebSocket over TLS) share the same session semantics.

pub mod listener;
pub mod registry;
pub mod room;
pub mod session;

pub use registry::{RegistryHandle, SessionLink};
pub use room::Room;
pub use session::{Session, SessionId, Transport};
