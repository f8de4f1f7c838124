//! Per-connection session state and command processing
//!
//! One `Session` owns one client connection end-to-end: it registers with
//! the registry, parses inbound frames into commands or chat payloads, and
//! queues outbound frames on its bounded outbox. The transport read/write
//! loops live in [`crate::chat::listener`]; everything protocol-visible
//! (command grammar, response strings, validation limits) is here so the
//! three transports behave identically.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chat::registry::{RegistryHandle, SessionLink};

/// Maximum pending frames per session before deliveries are dropped
pub const WRITE_QUEUE_CAP: usize = 100;

/// Per-frame socket write timeout
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum inbound WebSocket text message size (1 MiB)
pub const MAX_WS_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum nickname length in characters
pub const MAX_NICKNAME_LEN: usize = 20;

/// Maximum room name length in characters
pub const MAX_ROOM_NAME_LEN: usize = 30;

/// Stable identifier for one live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which framing a session uses. Framing differs; all other behavior is
/// identical, except `/pm` which only the WebSocket variants accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    TcpLine,
    WebSocket,
    WebSocketTls,
}

impl Transport {
    pub fn name(&self) -> &'static str {
        match self {
            Transport::TcpLine => "tcp",
            Transport::WebSocket => "ws",
            Transport::WebSocketTls => "wss",
        }
    }

    pub fn supports_pm(&self) -> bool {
        matches!(self, Transport::WebSocket | Transport::WebSocketTls)
    }
}

/// One live client connection
pub struct Session {
    id: SessionId,
    remote_id: String,
    nickname: String,
    current_room: String,
    authenticated: bool,
    transport: Transport,
    registry: RegistryHandle,
    outbox: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        remote_addr: SocketAddr,
        transport: Transport,
        registry: RegistryHandle,
        outbox: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Self {
        let remote_id = remote_addr.to_string();
        info!("[Session {}] Created ({})", remote_id, transport.name());
        Self {
            id: SessionId::new(),
            nickname: remote_id.clone(),
            remote_id,
            current_room: String::new(),
            authenticated: false,
            transport,
            registry,
            outbox,
            cancel,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn set_nickname(&mut self, nickname: impl Into<String>) {
        self.nickname = nickname.into();
    }

    pub fn current_room(&self) -> &str {
        &self.current_room
    }

    pub fn set_current_room(&mut self, room: impl Into<String>) {
        self.current_room = room.into();
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn set_authenticated(&mut self, authenticated: bool) {
        self.authenticated = authenticated;
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Register with the registry and send the welcome banner
    pub async fn start(&self) {
        self.registry
            .join(SessionLink {
                id: self.id,
                remote_id: self.remote_id.clone(),
                outbox: self.outbox.clone(),
                cancel: self.cancel.clone(),
            })
            .await;

        self.deliver("Welcome to the CherryRecorder Chat Server!");
        self.deliver(format!("Your temporary ID is: {}", self.remote_id));
        self.deliver("Please set your nickname using /nick <nickname>");
        self.deliver("Enter /help for a list of commands.");
        self.deliver("Enter /join <roomname> to join or create a room.");
    }

    /// Queue a frame for sending. Never blocks; a full queue drops the
    /// frame with a warning, a closed queue means the session is ending.
    pub fn deliver(&self, msg: impl Into<String>) {
        match self.outbox.try_send(msg.into()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    "[Session {}] outbound queue full, dropping message",
                    self.remote_id
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Begin teardown. Idempotent; the transport loops observe the token,
    /// drain the write queue and announce the leave to the registry.
    pub fn stop_session(&self) {
        self.cancel.cancel();
    }

    /// Deregister from the registry. Called exactly once by the transport
    /// loop after the read half has ended.
    pub async fn finish(&self) {
        self.registry.leave(self.id).await;
    }

    /// Process one inbound frame: a command when the first byte is `/`,
    /// otherwise a chat payload routed to the current room or globally.
    pub async fn process_frame(&mut self, frame: &str) {
        if frame.is_empty() {
            return;
        }

        info!("[Session {}] Received: {}", self.remote_id, frame);

        if !frame.starts_with('/') {
            self.send_chat(frame).await;
            return;
        }

        let (cmd, arg) = split_command(frame);
        match cmd {
            "/nick" => self.cmd_nick(arg).await,
            "/join" => self.cmd_join(arg).await,
            "/leave" => self.cmd_leave().await,
            "/users" => self.cmd_users().await,
            "/pm" if self.transport.supports_pm() => self.cmd_pm(arg).await,
            "/quit" => {
                self.deliver("* 연결을 종료합니다...");
                self.stop_session();
            }
            "/help" => self.cmd_help(),
            _ => {
                self.deliver(format!(
                    "Error: 알 수 없는 명령어 '{}'. '/help'를 입력하여 도움말을 확인하세요.",
                    cmd
                ));
            }
        }
    }

    async fn cmd_nick(&mut self, arg: &str) {
        if let Err(msg) = validate_nickname(arg) {
            self.deliver(msg);
            return;
        }

        let previous = self.nickname.clone();
        if self.registry.try_register_nickname(arg, self.id).await {
            self.nickname = arg.to_string();
            self.deliver(format!("* 닉네임이 '{}'(으)로 변경되었습니다.", arg));

            if previous == arg {
                // idempotent re-registration, nothing to announce
                return;
            }
            if previous == self.remote_id {
                self.registry.broadcast(
                    format!("* 사용자 '{}'님이 입장했습니다.", arg),
                    Some(self.id),
                );
            } else {
                self.registry.broadcast(
                    format!("* 사용자 '{}'의 닉네임이 '{}'(으)로 변경되었습니다.", previous, arg),
                    Some(self.id),
                );
            }
        } else {
            self.deliver(format!(
                "Error: 닉네임 '{}'은(는) 이미 사용 중이거나 유효하지 않습니다.",
                arg
            ));
        }
    }

    async fn cmd_join(&mut self, arg: &str) {
        if let Err(msg) = validate_room_name(arg) {
            self.deliver(msg);
            return;
        }

        if self.registry.join_room(arg, self.id).await {
            // confirmation and notices were delivered by the registry
            self.current_room = arg.to_string();
        } else {
            // a failed switch has already left the previous room
            self.current_room.clear();
            self.deliver(format!("Error: '{}' 방 입장에 실패했습니다.", arg));
        }
    }

    async fn cmd_leave(&mut self) {
        if self.current_room.is_empty() {
            self.deliver("Error: 현재 어떤 방에도 없습니다.");
            return;
        }

        let room = self.current_room.clone();
        if self.registry.leave_room(&room, self.id).await {
            self.current_room.clear();
        } else {
            self.deliver(format!("Error: '{}' 방 퇴장에 실패했습니다.", room));
        }
    }

    async fn cmd_users(&self) {
        let users = self.registry.get_user_list().await;
        self.deliver(format!("* 현재 접속 중인 사용자 ({}):", users.len()));
        for user in users {
            if user == self.nickname {
                self.deliver(format!("  - {} (You)", user));
            } else {
                self.deliver(format!("  - {}", user));
            }
        }
    }

    async fn cmd_pm(&self, arg: &str) {
        let (target, message) = match arg.split_once(char::is_whitespace) {
            Some((target, message)) if !target.is_empty() && !message.trim().is_empty() => {
                (target, message.trim())
            }
            _ => {
                self.deliver("Error: 사용법: /pm <닉네임> <메시지>");
                return;
            }
        };

        if !self.registry.send_private_message(message, self.id, target).await {
            self.deliver(format!(
                "Error: 사용자 '{}'을(를) 찾을 수 없거나 오프라인 상태입니다.",
                target
            ));
        }
    }

    fn cmd_help(&self) {
        self.deliver("--- 도움말 ---");
        self.deliver("/nick <닉네임> - 닉네임 변경");
        self.deliver("/join <방이름> - 방 입장/생성");
        self.deliver("/leave - 현재 방 퇴장");
        if self.transport.supports_pm() {
            self.deliver("/pm <닉네임> <메시지> - 개인 메시지");
        }
        self.deliver("/users - 현재 접속자 목록 보기");
        self.deliver("/quit - 채팅 종료");
        self.deliver("/help - 도움말 표시");
        self.deliver("-------------");
    }

    async fn send_chat(&self, text: &str) {
        if self.current_room.is_empty() {
            self.registry
                .broadcast(format!("[{}]: {}", self.nickname, text), Some(self.id));
        } else {
            let formatted = format!("[{} @ {}]: {}", self.nickname, self.current_room, text);
            if !self
                .registry
                .broadcast_to_room(&self.current_room, formatted, Some(self.id))
                .await
            {
                warn!(
                    "[Session {}] room '{}' vanished during broadcast",
                    self.remote_id, self.current_room
                );
                self.deliver(format!("Error: '{}' 방을 찾을 수 없습니다.", self.current_room));
            }
        }
    }
}

fn split_command(frame: &str) -> (&str, &str) {
    match frame.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (frame, ""),
    }
}

/// Validate a requested nickname, returning the client-facing error line on
/// failure. Reserved names are rejected by the registry.
pub fn validate_nickname(nick: &str) -> Result<(), String> {
    if nick.is_empty() {
        Err("Error: 닉네임은 비어있을 수 없습니다.".to_string())
    } else if nick.contains(char::is_whitespace) {
        Err("Error: 닉네임에 공백 문자를 포함할 수 없습니다.".to_string())
    } else if nick.chars().count() > MAX_NICKNAME_LEN {
        Err("Error: 닉네임은 20자를 초과할 수 없습니다.".to_string())
    } else {
        Ok(())
    }
}

/// Validate a room name, returning the client-facing error line on failure
pub fn validate_room_name(room: &str) -> Result<(), String> {
    if room.is_empty() {
        Err("Error: 방 이름은 비어있을 수 없습니다.".to_string())
    } else if room.contains(char::is_whitespace) {
        Err("Error: 방 이름에 공백 문자를 포함할 수 없습니다.".to_string())
    } else if room.chars().count() > MAX_ROOM_NAME_LEN {
        Err("Error: 방 이름은 30자를 초과할 수 없습니다.".to_string())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nickname_boundaries() {
        assert!(validate_nickname(&"a".repeat(20)).is_ok());
        assert!(validate_nickname(&"a".repeat(21)).is_err());
        assert!(validate_nickname("").is_err());
        assert!(validate_nickname("name with space").is_err());
        assert!(validate_nickname("tab\there").is_err());
        assert!(validate_nickname("ok_name").is_ok());
    }

    #[test]
    fn test_room_name_boundaries() {
        assert!(validate_room_name(&"r".repeat(30)).is_ok());
        assert!(validate_room_name(&"r".repeat(31)).is_err());
        assert!(validate_room_name("").is_err());
        assert!(validate_room_name("two words").is_err());
        assert!(validate_room_name("testroom").is_ok());
    }

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("/nick alice"), ("/nick", "alice"));
        assert_eq!(split_command("/users"), ("/users", ""));
        assert_eq!(split_command("/pm bob hello there"), ("/pm", "bob hello there"));
        assert_eq!(split_command("/join  room "), ("/join", "room"));
    }

    #[test]
    fn test_transport_pm_support() {
        assert!(!Transport::TcpLine.supports_pm());
        assert!(Transport::WebSocket.supports_pm());
        assert!(Transport::WebSocketTls.supports_pm());
    }
}
