//! CherryRecorder Server
//!
//! A multi-protocol network server terminating four kinds of client
//! traffic on distinct TCP ports:
//!
//! - a line-oriented TCP echo service,
//! - an HTTP/HTTPS front serving health/status and proxying a narrow set
//!   of Places endpoints,
//! - a chat service reachable over three transports (line-framed TCP,
//!   WebSocket, WebSocket over TLS) with rooms, nicknames and private
//!   messages,
//! - optional on-disk message history.
//!
//! The chat core is a session fabric: per-connection [`chat::Session`]s
//! own their sockets and ordered write queues, while a single
//! [`chat::RegistryHandle`] actor owns the shared state (session set,
//! nickname index, room map) and fans broadcasts out into each session's
//! outbox.

pub mod chat;
pub mod config;
pub mod echo;
pub mod error;
pub mod history;
pub mod http;
pub mod tls;

pub use chat::{RegistryHandle, Session, SessionId, Transport};
pub use config::ServerConfig;
pub use error::{ChatError, Result};
pub use history::MessageHistory;
