//! Error handling for the server

use std::fmt;

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Server error types
#[derive(Debug, Clone)]
pub enum ChatError {
    /// Network-related errors
    Network(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// Protocol errors (malformed or oversized frames)
    Protocol(String),
    /// Connection errors (handshake, accept, closed streams)
    Connection(String),
    /// Room not found
    RoomNotFound(String),
    /// User not found
    UserNotFound(String),
    /// Server internal error
    Internal(String),
    /// Configuration error
    Config(String),
    /// Timeout error
    Timeout(String),
    /// Resource limit exceeded
    ResourceLimit(String),
}

impl ChatError {
    /// Create a network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        ChatError::Network(msg.into())
    }

    /// Create a serialization error
    pub fn serialization<T: Into<String>>(msg: T) -> Self {
        ChatError::Serialization(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        ChatError::Protocol(msg.into())
    }

    /// Create a connection error
    pub fn connection<T: Into<String>>(msg: T) -> Self {
        ChatError::Connection(msg.into())
    }

    /// Create a room not found error
    pub fn room_not_found<T: Into<String>>(msg: T) -> Self {
        ChatError::RoomNotFound(msg.into())
    }

    /// Create a user not found error
    pub fn user_not_found<T: Into<String>>(msg: T) -> Self {
        ChatError::UserNotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        ChatError::Internal(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        ChatError::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        ChatError::Timeout(msg.into())
    }

    /// Create a resource limit error
    pub fn resource_limit<T: Into<String>>(msg: T) -> Self {
        ChatError::ResourceLimit(msg.into())
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::Network(msg) => write!(f, "Network error: {}", msg),
            ChatError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            ChatError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ChatError::Connection(msg) => write!(f, "Connection error: {}", msg),
            ChatError::RoomNotFound(msg) => write!(f, "Room not found: {}", msg),
            ChatError::UserNotFound(msg) => write!(f, "User not found: {}", msg),
            ChatError::Internal(msg) => write!(f, "Internal error: {}", msg),
            ChatError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ChatError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            ChatError::ResourceLimit(msg) => write!(f, "Resource limit exceeded: {}", msg),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Network(format!("IO error: {}", err))
    }
}

impl From<std::net::AddrParseError> for ChatError {
    fn from(err: std::net::AddrParseError) -> Self {
        ChatError::Config(format!("Invalid address: {}", err))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                ChatError::Connection("WebSocket closed".to_string())
            }
            WsError::Capacity(e) => ChatError::Protocol(format!("WebSocket capacity: {}", e)),
            WsError::Protocol(e) => ChatError::Protocol(format!("WebSocket protocol: {}", e)),
            other => ChatError::Network(format!("WebSocket error: {}", other)),
        }
    }
}

impl From<rustls::Error> for ChatError {
    fn from(err: rustls::Error) -> Self {
        ChatError::Config(format!("TLS error: {}", err))
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChatError::Timeout(format!("Upstream request timed out: {}", err))
        } else if err.is_connect() {
            ChatError::Connection(format!("Upstream connect error: {}", err))
        } else {
            ChatError::Network(format!("Upstream error: {}", err))
        }
    }
}
