//! TCP echo service
//!
//! Sanity endpoint independent of the chat core: whatever bytes arrive are
//! written straight back until the peer closes the connection. No framing.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ECHO_BUFFER_SIZE: usize = 1024;

/// Accept loop for the echo service
pub async fn run_echo_server(listener: TcpListener, shutdown: CancellationToken) {
    info!(
        "Echo server listening on {}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Echo server shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_echo_connection(stream, addr));
                }
                Err(e) => {
                    error!("Echo accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_echo_connection(mut stream: TcpStream, addr: SocketAddr) {
    debug!("[Echo {}] Connected", addr);
    let mut buf = [0u8; ECHO_BUFFER_SIZE];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                debug!("[Echo {}] Connection closed by peer (EOF)", addr);
                break;
            }
            Ok(n) => {
                if let Err(e) = stream.write_all(&buf[..n]).await {
                    warn!("[Echo {}] Write error: {}", addr, e);
                    break;
                }
            }
            Err(e) => {
                warn!("[Echo {}] Read error: {}", addr, e);
                break;
            }
        }
    }
}
