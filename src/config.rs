//! Server configuration loaded from the environment

use std::env;
use std::net::IpAddr;

use crate::error::{ChatError, Result};

/// Configuration for every listener the server runs
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// HTTP front port
    pub http_port: u16,
    /// HTTPS front port (only bound when a certificate is configured)
    pub https_port: u16,
    /// Bind address for the HTTP/HTTPS front
    pub http_bind_ip: IpAddr,
    /// Worker thread count for the runtime (None = tokio default)
    pub worker_threads: Option<usize>,
    /// WebSocket chat port
    pub chat_ws_port: u16,
    /// Line-framed TCP chat port
    pub chat_tcp_port: u16,
    /// WebSocket-over-TLS chat port (only bound when a certificate is configured)
    pub chat_wss_port: u16,
    /// TCP echo port
    pub echo_port: u16,
    /// Message history directory
    pub history_dir: String,
    /// Google Maps API key for the Places proxy (may be empty)
    pub maps_api_key: String,
    /// TLS certificate path (PEM)
    pub cert_path: String,
    /// TLS private key path (PEM)
    pub key_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            https_port: 58080,
            http_bind_ip: "0.0.0.0".parse().unwrap(),
            worker_threads: None,
            chat_ws_port: 33334,
            chat_tcp_port: 33335,
            chat_wss_port: 33336,
            echo_port: 33333,
            history_dir: "history".to_string(),
            maps_api_key: String::new(),
            cert_path: String::new(),
            key_path: String::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset. A set-but-invalid value is an error.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            http_port: env_port("HTTP_PORT", defaults.http_port)?,
            https_port: env_port("HTTPS_PORT", defaults.https_port)?,
            http_bind_ip: match env::var("HTTP_BIND_IP") {
                Ok(v) if !v.is_empty() => v.parse()?,
                _ => defaults.http_bind_ip,
            },
            // 0 means "use all cores", i.e. the runtime default
            worker_threads: match env::var("HTTP_THREADS") {
                Ok(v) if !v.is_empty() => {
                    let threads: usize = v.parse().map_err(|e| {
                        ChatError::config(format!("Invalid HTTP_THREADS '{}': {}", v, e))
                    })?;
                    (threads > 0).then_some(threads)
                }
                _ => None,
            },
            chat_ws_port: env_port("CHAT_SERVER_PORT", defaults.chat_ws_port)?,
            chat_tcp_port: env_port("CHAT_TCP_PORT", defaults.chat_tcp_port)?,
            chat_wss_port: env_port("CHAT_SERVER_SSL_PORT", defaults.chat_wss_port)?,
            echo_port: env_port("ECHO_SERVER_PORT", defaults.echo_port)?,
            history_dir: env::var("HISTORY_DIR").unwrap_or(defaults.history_dir),
            maps_api_key: env::var("GOOGLE_MAPS_API_KEY").unwrap_or_default(),
            cert_path: env::var("CERT_PATH").unwrap_or_default(),
            key_path: env::var("KEY_PATH").unwrap_or_default(),
        })
    }

    /// TLS listeners (HTTPS, WSS) run only when both paths are configured
    pub fn tls_configured(&self) -> bool {
        !self.cert_path.is_empty() && !self.key_path.is_empty()
    }
}

fn env_port(name: &str, default: u16) -> Result<u16> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| ChatError::config(format!("Invalid port in {}: {}", name, v))),
        _ => Ok(default),
    }
}
