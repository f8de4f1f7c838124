//! Chat listeners and transport loops
//!
//! Three accept loops of identical shape hand sockets to new sessions: the
//! line-framed TCP listener, the WebSocket listener, and the WebSocket-over-
//! TLS listener. Accept errors are logged and the loop continues;
//! cancellation exits cleanly. Each connection runs one read loop plus one
//! writer task draining the session's ordered outbox.

use std::net::SocketAddr;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chat::registry::RegistryHandle;
use crate::chat::session::{
    Session, Transport, MAX_WS_MESSAGE_SIZE, WRITE_QUEUE_CAP, WRITE_TIMEOUT,
};

/// Accept loop for the line-framed TCP chat transport
pub async fn run_chat_tcp_listener(
    listener: TcpListener,
    registry: RegistryHandle,
    shutdown: CancellationToken,
) {
    info!(
        "TCP chat listener on {}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("TCP chat listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("New TCP chat connection from {}", addr);
                    let registry = registry.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_tcp_chat_connection(stream, addr, registry, shutdown).await;
                    });
                }
                Err(e) => {
                    error!("TCP chat accept error: {}", e);
                }
            }
        }
    }
}

/// Accept loop for the WebSocket chat transport
pub async fn run_chat_ws_listener(
    listener: TcpListener,
    registry: RegistryHandle,
    shutdown: CancellationToken,
) {
    info!(
        "WebSocket chat listener on {}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("WebSocket chat listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("New WebSocket connection from {}", addr);
                    let registry = registry.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_ws_connection(stream, addr, Transport::WebSocket, registry, shutdown)
                            .await;
                    });
                }
                Err(e) => {
                    error!("WebSocket accept error: {}", e);
                }
            }
        }
    }
}

/// Accept loop for the WebSocket-over-TLS chat transport
pub async fn run_chat_wss_listener(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: RegistryHandle,
    shutdown: CancellationToken,
) {
    info!(
        "WSS chat listener on {}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("WSS chat listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("New WSS connection from {}", addr);
                    let acceptor = acceptor.clone();
                    let registry = registry.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                handle_ws_connection(
                                    tls_stream,
                                    addr,
                                    Transport::WebSocketTls,
                                    registry,
                                    shutdown,
                                )
                                .await;
                            }
                            Err(e) => {
                                warn!("[{}] TLS handshake failed: {}", addr, e);
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("WSS accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_tcp_chat_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: RegistryHandle,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let cancel = shutdown.child_token();
    let (outbox_tx, outbox_rx) = mpsc::channel(WRITE_QUEUE_CAP);
    let mut session = Session::new(addr, Transport::TcpLine, registry, outbox_tx, cancel.clone());
    let remote_id = session.remote_id().to_string();

    let writer = tokio::spawn(write_tcp_frames(
        write_half,
        outbox_rx,
        remote_id.clone(),
        cancel.clone(),
    ));

    session.start().await;

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read_line(&mut line) => match result {
                Ok(0) => {
                    info!("[Session {}] Connection closed by peer (EOF).", remote_id);
                    break;
                }
                Ok(_) => {
                    let frame = line.trim_end_matches(['\r', '\n']).to_string();
                    if !frame.is_empty() {
                        session.process_frame(&frame).await;
                    }
                }
                Err(e) => {
                    // resets and aborted reads are normal terminations
                    if e.kind() == std::io::ErrorKind::ConnectionReset {
                        info!("[Session {}] Connection reset by peer.", remote_id);
                    } else {
                        error!("[Session {}] Read error: {}", remote_id, e);
                    }
                    break;
                }
            }
        }
    }

    session.finish().await;
    cancel.cancel();
    drop(session);
    let _ = writer.await;
    info!("[Session {}] Destroyed.", remote_id);
}

async fn handle_ws_connection<S>(
    stream: S,
    addr: SocketAddr,
    transport: Transport,
    registry: RegistryHandle,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let server_header = match transport {
        Transport::WebSocketTls => "CherryRecorder/1.0 (WSS)",
        _ => "CherryRecorder/1.0",
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_WS_MESSAGE_SIZE);

    let callback = move |_req: &tokio_tungstenite::tungstenite::handshake::server::Request,
                         mut resp: tokio_tungstenite::tungstenite::handshake::server::Response| {
        resp.headers_mut()
            .insert(header::SERVER, HeaderValue::from_static(server_header));
        Ok(resp)
    };

    let ws = match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
        .await
    {
        Ok(ws) => ws,
        Err(e) => {
            warn!("[{}] WebSocket handshake failed: {}", addr, e);
            return;
        }
    };
    debug!("[{}] WebSocket connection accepted", addr);

    let (sink, mut ws_read) = ws.split();
    let cancel = shutdown.child_token();
    let (outbox_tx, outbox_rx) = mpsc::channel(WRITE_QUEUE_CAP);
    let mut session = Session::new(addr, transport, registry, outbox_tx, cancel.clone());
    let remote_id = session.remote_id().to_string();

    let writer = tokio::spawn(write_ws_frames(
        sink,
        outbox_rx,
        remote_id.clone(),
        cancel.clone(),
    ));

    session.start().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = ws_read.next() => match next {
                Some(Ok(Message::Text(text))) => {
                    let frame = text.trim_end_matches(['\r', '\n']).to_string();
                    if !frame.is_empty() {
                        session.process_frame(&frame).await;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!("[Session {}] Binary frame received, closing", remote_id);
                    break;
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("[Session {}] Connection closed", remote_id);
                    break;
                }
                Some(Ok(_)) => {} // ping/pong handled by the library
                Some(Err(e)) => {
                    warn!("[Session {}] Read failed: {}", remote_id, e);
                    break;
                }
            }
        }
    }

    session.finish().await;
    cancel.cancel();
    drop(session);
    let _ = writer.await;
    info!("[Session {}] Destroyed.", remote_id);
}

/// Single writer per session: pops one frame at a time and writes it fully,
/// preserving delivery order. A write failure or timeout drops the rest of
/// the queue and tears the session down.
async fn write_tcp_frames(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<String>,
    remote_id: String,
    cancel: CancellationToken,
) {
    while let Some(msg) = rx.recv().await {
        let framed = format!("{}\r\n", msg);
        match timeout(WRITE_TIMEOUT, write_half.write_all(framed.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("[Session {}] Write error: {}", remote_id, e);
                break;
            }
            Err(_) => {
                warn!("[Session {}] Write timed out", remote_id);
                break;
            }
        }
    }
    rx.close();
    cancel.cancel();
    let _ = write_half.shutdown().await;
}

async fn write_ws_frames<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<String>,
    remote_id: String,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let framed = format!("{}\r\n", msg);
        match timeout(WRITE_TIMEOUT, sink.send(Message::Text(framed))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("[Session {}] Write failed: {}", remote_id, e);
                break;
            }
            Err(_) => {
                warn!("[Session {}] Write timed out", remote_id);
                break;
            }
        }
    }
    rx.close();
    cancel.cancel();
    let _ = sink.close().await;
}
