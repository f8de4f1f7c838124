//! WebSocket transport tests
//!
//! The WS transport shares the session semantics with the TCP transport;
//! these tests cover what is WS-specific: the handshake decorator, text
//! framing, `/pm`, and binary frames being a protocol violation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cherryrecorder_server::chat::{listener, RegistryHandle};
use cherryrecorder_server::history::MessageHistory;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn start_ws_server() -> SocketAddr {
    let history_dir = std::env::temp_dir().join(format!("cherry-ws-{}", uuid::Uuid::new_v4()));
    let registry = RegistryHandle::new(Arc::new(MessageHistory::new(history_dir)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener::run_chat_ws_listener(
        listener,
        registry,
        CancellationToken::new(),
    ));
    addr
}

struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    async fn connect(addr: SocketAddr) -> (Self, String) {
        let (stream, response) = connect_async(format!("ws://{}/", addr)).await.unwrap();
        let server_header = response
            .headers()
            .get("server")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        (Self { stream }, server_header)
    }

    async fn send_frame(&mut self, text: &str) {
        self.stream
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    /// Next text frame with the trailing CRLF stripped
    async fn recv_frame(&mut self) -> String {
        loop {
            let msg = timeout(RECV_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return text.trim_end_matches(['\r', '\n']).to_string();
            }
        }
    }

    async fn expect_frame_containing(&mut self, needle: &str) -> String {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "did not receive a frame containing {:?} in time",
                needle
            );
            let frame = self.recv_frame().await;
            if frame.contains(needle) {
                return frame;
            }
        }
    }

    async fn drain_welcome(&mut self) {
        for _ in 0..5 {
            self.recv_frame().await;
        }
    }

    /// Expect the server to end the connection
    async fn expect_close(&mut self) {
        loop {
            match timeout(RECV_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for close")
            {
                None => return,
                Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return,
            }
        }
    }
}

#[tokio::test]
async fn test_ws_handshake_header_and_welcome() {
    let addr = start_ws_server().await;
    let (mut client, server_header) = WsClient::connect(addr).await;

    assert_eq!(server_header, "CherryRecorder/1.0");
    assert_eq!(
        client.recv_frame().await,
        "Welcome to the CherryRecorder Chat Server!"
    );
    assert!(client.recv_frame().await.starts_with("Your temporary ID is: "));
    assert_eq!(
        client.recv_frame().await,
        "Please set your nickname using /nick <nickname>"
    );
}

#[tokio::test]
async fn test_ws_private_message_round_trip() {
    let addr = start_ws_server().await;
    let (mut alice, _) = WsClient::connect(addr).await;
    let (mut bob, _) = WsClient::connect(addr).await;
    alice.drain_welcome().await;
    bob.drain_welcome().await;

    alice.send_frame("/nick alice").await;
    alice.expect_frame_containing("변경되었습니다").await;
    bob.send_frame("/nick bob").await;
    bob.expect_frame_containing("변경되었습니다").await;

    alice.send_frame("/pm bob secret hello").await;
    assert_eq!(
        bob.expect_frame_containing("PM from").await,
        "[PM from alice]: secret hello"
    );
    assert_eq!(
        alice.expect_frame_containing("* To bob").await,
        "* To bob: secret hello"
    );

    // unknown receiver is rejected with the error line
    alice.send_frame("/pm nobody hi").await;
    alice
        .expect_frame_containing("Error: 사용자 'nobody'을(를) 찾을 수 없거나")
        .await;
}

#[tokio::test]
async fn test_ws_help_includes_pm() {
    let addr = start_ws_server().await;
    let (mut client, _) = WsClient::connect(addr).await;
    client.drain_welcome().await;

    client.send_frame("/help").await;
    client.expect_frame_containing("--- 도움말 ---").await;
    client
        .expect_frame_containing("/pm <닉네임> <메시지> - 개인 메시지")
        .await;
}

#[tokio::test]
async fn test_ws_binary_frame_closes_session() {
    let addr = start_ws_server().await;
    let (mut client, _) = WsClient::connect(addr).await;
    client.drain_welcome().await;

    client
        .stream
        .send(Message::Binary(vec![0x01, 0x02, 0x03]))
        .await
        .unwrap();

    client.expect_close().await;
}

#[tokio::test]
async fn test_ws_and_tcp_share_the_registry() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let history_dir = std::env::temp_dir().join(format!("cherry-mixed-{}", uuid::Uuid::new_v4()));
    let registry = RegistryHandle::new(Arc::new(MessageHistory::new(history_dir)));
    let shutdown = CancellationToken::new();

    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = ws_listener.local_addr().unwrap();
    tokio::spawn(listener::run_chat_ws_listener(
        ws_listener,
        registry.clone(),
        shutdown.clone(),
    ));

    let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tcp_addr = tcp_listener.local_addr().unwrap();
    tokio::spawn(listener::run_chat_tcp_listener(
        tcp_listener,
        registry,
        shutdown,
    ));

    let (mut ws_client, _) = WsClient::connect(ws_addr).await;
    ws_client.drain_welcome().await;
    ws_client.send_frame("/nick ws_user").await;
    ws_client.expect_frame_containing("변경되었습니다").await;

    let stream = TcpStream::connect(tcp_addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    for _ in 0..5 {
        line.clear();
        timeout(RECV_TIMEOUT, reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
    }

    write_half.write_all(b"/nick tcp_user\n").await.unwrap();

    // the WS client sees the TCP user's join notice through the shared registry
    ws_client
        .expect_frame_containing("* 사용자 'tcp_user'님이 입장했습니다.")
        .await;

    // and the TCP user's global chat reaches the WS client
    write_half.write_all(b"hello across transports\n").await.unwrap();
    assert_eq!(
        ws_client.expect_frame_containing("hello across").await,
        "[tcp_user]: hello across transports"
    );
}
