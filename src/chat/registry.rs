//! Chat registry actor
//!
//! Single source of truth for the session set, the nickname index and the
//! room map. All mutations run inside one actor task consuming a mailbox;
//! operations are exposed as `async fn`s on [`RegistryHandle`] that post a
//! command and await a oneshot reply. Broadcast fan-out snapshots the
//! recipient set inside the actor and then pushes into each session's own
//! bounded outbox, so a slow receiver can never stall the registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::room::Room;
use crate::chat::session::SessionId;
use crate::history::MessageHistory;

/// Nicknames that can never be registered
const RESERVED_NICKNAMES: [&str; 2] = ["Server", "system"];

/// Everything the registry needs to track one live session
#[derive(Debug)]
pub struct SessionLink {
    pub id: SessionId,
    pub remote_id: String,
    pub outbox: mpsc::Sender<String>,
    pub cancel: CancellationToken,
}

struct SessionEntry {
    remote_id: String,
    nickname: String,
    current_room: String,
    outbox: mpsc::Sender<String>,
    cancel: CancellationToken,
}

enum RegistryCommand {
    Join {
        link: SessionLink,
        reply: oneshot::Sender<()>,
    },
    Leave {
        id: SessionId,
        reply: oneshot::Sender<()>,
    },
    TryRegisterNickname {
        nick: String,
        id: SessionId,
        reply: oneshot::Sender<bool>,
    },
    UnregisterNickname {
        nick: String,
    },
    FindSession {
        nick: String,
        reply: oneshot::Sender<Option<SessionId>>,
    },
    UserList {
        reply: oneshot::Sender<Vec<String>>,
    },
    JoinRoom {
        room: String,
        id: SessionId,
        reply: oneshot::Sender<bool>,
    },
    LeaveRoom {
        room: String,
        id: SessionId,
        reply: oneshot::Sender<bool>,
    },
    Broadcast {
        msg: String,
        sender: Option<SessionId>,
    },
    BroadcastToRoom {
        room: String,
        msg: String,
        sender: Option<SessionId>,
        reply: oneshot::Sender<bool>,
    },
    PrivateMessage {
        msg: String,
        sender: SessionId,
        receiver_nick: String,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the registry actor
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<RegistryCommand>,
}

impl RegistryHandle {
    /// Spawn the registry actor and return a handle to it
    pub fn new(history: Arc<MessageHistory>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Registry {
            sessions: HashMap::new(),
            nicknames: HashMap::new(),
            rooms: HashMap::new(),
            history,
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    /// Register a new session with the registry. No notice is broadcast;
    /// the join announcement happens on the first `/nick`.
    pub async fn join(&self, link: SessionLink) {
        self.request(|reply| RegistryCommand::Join { link, reply }, ())
            .await
    }

    /// Remove a session: leaves its room, releases its nickname and, when a
    /// user-assigned nickname was set, broadcasts the leave notice.
    pub async fn leave(&self, id: SessionId) {
        self.request(|reply| RegistryCommand::Leave { id, reply }, ())
            .await
    }

    /// Attempt to claim a nickname for a session. Succeeds when the name is
    /// free, already held by the same session, or held only by a stale
    /// entry (which is evicted). Reserved names always fail.
    pub async fn try_register_nickname(&self, nick: &str, id: SessionId) -> bool {
        if RESERVED_NICKNAMES.contains(&nick) {
            debug!("Rejected reserved nickname '{}'", nick);
            return false;
        }
        self.request(
            |reply| RegistryCommand::TryRegisterNickname {
                nick: nick.to_string(),
                id,
                reply,
            },
            false,
        )
        .await
    }

    /// Drop a nickname from the index; silently no-op when absent
    pub fn unregister_nickname(&self, nick: &str) {
        let _ = self.tx.send(RegistryCommand::UnregisterNickname {
            nick: nick.to_string(),
        });
    }

    /// Look up the session currently holding a nickname; stale entries
    /// count as absent and are evicted.
    pub async fn find_session_by_nickname(&self, nick: &str) -> Option<SessionId> {
        self.request(
            |reply| RegistryCommand::FindSession {
                nick: nick.to_string(),
                reply,
            },
            None,
        )
        .await
    }

    /// Snapshot of live nicknames; stale entries are evicted as a side effect
    pub async fn get_user_list(&self) -> Vec<String> {
        self.request(|reply| RegistryCommand::UserList { reply }, Vec::new())
            .await
    }

    /// Move a session into a room, creating it on first join. The registry
    /// delivers the confirmation and member list to the joiner and the join
    /// notice to its peers.
    pub async fn join_room(&self, room: &str, id: SessionId) -> bool {
        self.request(
            |reply| RegistryCommand::JoinRoom {
                room: room.to_string(),
                id,
                reply,
            },
            false,
        )
        .await
    }

    /// Remove a session from a room; fails when the room is unknown or the
    /// session is not a member. Empty rooms are destroyed.
    pub async fn leave_room(&self, room: &str, id: SessionId) -> bool {
        self.request(
            |reply| RegistryCommand::LeaveRoom {
                room: room.to_string(),
                id,
                reply,
            },
            false,
        )
        .await
    }

    /// Broadcast to every session except the sender
    pub fn broadcast(&self, msg: impl Into<String>, sender: Option<SessionId>) {
        let _ = self.tx.send(RegistryCommand::Broadcast {
            msg: msg.into(),
            sender,
        });
    }

    /// Broadcast to a room's members except the sender; false when the room
    /// does not exist
    pub async fn broadcast_to_room(
        &self,
        room: &str,
        msg: impl Into<String>,
        sender: Option<SessionId>,
    ) -> bool {
        self.request(
            |reply| RegistryCommand::BroadcastToRoom {
                room: room.to_string(),
                msg: msg.into(),
                sender,
                reply,
            },
            false,
        )
        .await
    }

    /// Deliver a private message; false when the receiver nickname is not
    /// held by a live session
    pub async fn send_private_message(
        &self,
        msg: &str,
        sender: SessionId,
        receiver_nick: &str,
    ) -> bool {
        self.request(
            |reply| RegistryCommand::PrivateMessage {
                msg: msg.to_string(),
                sender,
                receiver_nick: receiver_nick.to_string(),
                reply,
            },
            false,
        )
        .await
    }

    /// Stop every session and clear all registry state
    pub async fn shutdown(&self) {
        self.request(|reply| RegistryCommand::Shutdown { reply }, ())
            .await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
        default: T,
    ) -> T {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(make(reply_tx)).is_err() {
            return default;
        }
        reply_rx.await.unwrap_or(default)
    }
}

struct Registry {
    sessions: HashMap<SessionId, SessionEntry>,
    nicknames: HashMap<String, SessionId>,
    rooms: HashMap<String, Room>,
    history: Arc<MessageHistory>,
}

impl Registry {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RegistryCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                RegistryCommand::Join { link, reply } => {
                    self.handle_join(link);
                    let _ = reply.send(());
                }
                RegistryCommand::Leave { id, reply } => {
                    self.handle_leave(id);
                    let _ = reply.send(());
                }
                RegistryCommand::TryRegisterNickname { nick, id, reply } => {
                    let _ = reply.send(self.handle_try_register_nickname(nick, id));
                }
                RegistryCommand::UnregisterNickname { nick } => {
                    if self.nicknames.remove(&nick).is_some() {
                        info!("Nickname '{}' unregistered", nick);
                    }
                }
                RegistryCommand::FindSession { nick, reply } => {
                    let _ = reply.send(self.handle_find_session(&nick));
                }
                RegistryCommand::UserList { reply } => {
                    let _ = reply.send(self.handle_user_list());
                }
                RegistryCommand::JoinRoom { room, id, reply } => {
                    let _ = reply.send(self.handle_join_room(room, id));
                }
                RegistryCommand::LeaveRoom { room, id, reply } => {
                    let _ = reply.send(self.handle_leave_room(&room, id));
                }
                RegistryCommand::Broadcast { msg, sender } => {
                    self.handle_broadcast(&msg, sender);
                }
                RegistryCommand::BroadcastToRoom {
                    room,
                    msg,
                    sender,
                    reply,
                } => {
                    let _ = reply.send(self.handle_broadcast_to_room(&room, &msg, sender));
                }
                RegistryCommand::PrivateMessage {
                    msg,
                    sender,
                    receiver_nick,
                    reply,
                } => {
                    let _ = reply.send(self.handle_private_message(&msg, sender, &receiver_nick));
                }
                RegistryCommand::Shutdown { reply } => {
                    self.handle_shutdown();
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    fn handle_join(&mut self, link: SessionLink) {
        info!(
            "Client '{}' joined. Total sessions: {}",
            link.remote_id,
            self.sessions.len() + 1
        );
        self.sessions.insert(
            link.id,
            SessionEntry {
                nickname: link.remote_id.clone(),
                remote_id: link.remote_id,
                current_room: String::new(),
                outbox: link.outbox,
                cancel: link.cancel,
            },
        );
    }

    fn handle_leave(&mut self, id: SessionId) {
        let (nickname, remote_id, current_room) = match self.sessions.get(&id) {
            Some(entry) => (
                entry.nickname.clone(),
                entry.remote_id.clone(),
                entry.current_room.clone(),
            ),
            None => return,
        };

        if !current_room.is_empty() {
            self.remove_from_room(&current_room, &id, &nickname, false);
        }

        if self.nicknames.get(&nickname) == Some(&id) {
            self.nicknames.remove(&nickname);
        }

        self.sessions.remove(&id);
        info!(
            "Client '{}' ({}) left. Total sessions: {}",
            nickname,
            remote_id,
            self.sessions.len()
        );

        if nickname != remote_id {
            self.handle_broadcast(&format!("* 사용자 '{}'님이 퇴장했습니다.", nickname), None);
        }
    }

    fn handle_try_register_nickname(&mut self, nick: String, id: SessionId) -> bool {
        let old_nick = match self.sessions.get(&id) {
            Some(entry) => entry.nickname.clone(),
            None => return false,
        };

        match self.nicknames.get(&nick) {
            Some(holder) if *holder == id => return true,
            Some(holder) if self.sessions.contains_key(holder) => {
                debug!("Nickname '{}' already in use by an active session", nick);
                return false;
            }
            Some(_) => {
                info!("Removing expired nickname entry: '{}'", nick);
                self.nicknames.remove(&nick);
            }
            None => {}
        }

        if old_nick != nick && self.nicknames.get(&old_nick) == Some(&id) {
            self.nicknames.remove(&old_nick);
        }
        self.nicknames.insert(nick.clone(), id);
        if let Some(entry) = self.sessions.get_mut(&id) {
            entry.nickname = nick.clone();
        }
        info!("Nickname '{}' registered", nick);
        true
    }

    fn handle_find_session(&mut self, nick: &str) -> Option<SessionId> {
        match self.nicknames.get(nick) {
            Some(id) if self.sessions.contains_key(id) => Some(*id),
            Some(_) => {
                info!("Removing expired nickname entry: '{}'", nick);
                self.nicknames.remove(nick);
                None
            }
            None => None,
        }
    }

    fn handle_user_list(&mut self) -> Vec<String> {
        let sessions = &self.sessions;
        self.nicknames.retain(|nick, id| {
            let live = sessions.contains_key(id);
            if !live {
                info!("Removing expired nickname '{}' during user list scan", nick);
            }
            live
        });
        self.nicknames.keys().cloned().collect()
    }

    fn handle_join_room(&mut self, room_name: String, id: SessionId) -> bool {
        let (nickname, old_room) = match self.sessions.get(&id) {
            Some(entry) => (entry.nickname.clone(), entry.current_room.clone()),
            None => return false,
        };

        // Re-joining the current room is a no-op success.
        if old_room == room_name {
            self.deliver_to(&id, format!("* 이미 '{}' 방에 있습니다.", room_name));
            return true;
        }

        if !old_room.is_empty() {
            self.remove_from_room(&old_room, &id, &nickname, false);
        }

        let created = !self.rooms.contains_key(&room_name);
        let join_result = {
            let room = self
                .rooms
                .entry(room_name.clone())
                .or_insert_with(|| Room::new(room_name.clone()));
            if room.join(id) {
                Ok(room.members())
            } else {
                Err(room.is_empty())
            }
        };

        let member_ids = match join_result {
            Ok(members) => members,
            Err(now_empty) => {
                if created && now_empty {
                    self.rooms.remove(&room_name);
                }
                self.deliver_to(&id, format!("Error: 방 '{}'이(가) 꽉 찼습니다.", room_name));
                return false;
            }
        };
        if created {
            info!("Created new room: {}", room_name);
        }

        if let Some(entry) = self.sessions.get_mut(&id) {
            entry.current_room = room_name.clone();
        }

        let mut member_names = Vec::with_capacity(member_ids.len());
        for member_id in &member_ids {
            if let Some(member) = self.sessions.get(member_id) {
                if *member_id == id {
                    member_names.push(format!("{} (You)", member.nickname));
                } else {
                    member_names.push(member.nickname.clone());
                }
            }
        }

        self.deliver_to(&id, format!("* '{}' 방에 입장했습니다.", room_name));
        self.deliver_to(
            &id,
            format!("* 현재 멤버 ({}): {}", member_names.len(), member_names.join(", ")),
        );

        let notice = format!("* 사용자 '{}'님이 {} 방에 입장했습니다.", nickname, room_name);
        for member_id in member_ids {
            if member_id != id {
                self.deliver_to(&member_id, notice.clone());
            }
        }

        info!("User '{}' joined room '{}'", nickname, room_name);
        true
    }

    fn handle_leave_room(&mut self, room_name: &str, id: SessionId) -> bool {
        let nickname = match self.sessions.get(&id) {
            Some(entry) => entry.nickname.clone(),
            None => return false,
        };
        self.remove_from_room(room_name, &id, &nickname, true)
    }

    /// Shared removal path for `/leave`, room switches and disconnects.
    /// Broadcasts the peer notice, clears `current_room` and destroys the
    /// room when it becomes empty.
    fn remove_from_room(
        &mut self,
        room_name: &str,
        id: &SessionId,
        nickname: &str,
        notify_leaver: bool,
    ) -> bool {
        let remaining = {
            let room = match self.rooms.get_mut(room_name) {
                Some(room) => room,
                None => return false,
            };
            if !room.leave(id) {
                return false;
            }
            room.members()
        };

        if remaining.is_empty() {
            self.rooms.remove(room_name);
            info!("Room '{}' is empty, removing.", room_name);
        }

        if let Some(entry) = self.sessions.get_mut(id) {
            entry.current_room.clear();
        }

        let notice = format!("* 사용자 '{}'님이 {} 방에 퇴장했습니다.", nickname, room_name);
        for member_id in remaining {
            self.deliver_to(&member_id, notice.clone());
        }

        if notify_leaver {
            self.deliver_to(id, format!("* '{}' 방에서 퇴장했습니다.", room_name));
        }

        info!("User '{}' left room '{}'", nickname, room_name);
        true
    }

    fn handle_broadcast(&self, msg: &str, sender: Option<SessionId>) {
        let sender_nick = sender
            .and_then(|sid| self.sessions.get(&sid))
            .map(|entry| entry.nickname.clone());

        for id in self.sessions.keys() {
            if Some(*id) != sender {
                self.deliver_to(id, msg.to_string());
            }
        }

        self.history
            .log_global_message(msg, sender_nick.as_deref().unwrap_or(""));
    }

    fn handle_broadcast_to_room(&self, room_name: &str, msg: &str, sender: Option<SessionId>) -> bool {
        let room = match self.rooms.get(room_name) {
            Some(room) => room,
            None => {
                warn!("broadcast_to_room: room '{}' not found", room_name);
                return false;
            }
        };

        let sender_nick = sender
            .and_then(|sid| self.sessions.get(&sid))
            .map(|entry| entry.nickname.clone());

        for member_id in room.members() {
            if Some(member_id) != sender {
                self.deliver_to(&member_id, msg.to_string());
            }
        }

        self.history
            .log_room_message(room_name, msg, sender_nick.as_deref().unwrap_or(""));
        true
    }

    fn handle_private_message(&mut self, msg: &str, sender: SessionId, receiver_nick: &str) -> bool {
        let sender_nick = match self.sessions.get(&sender) {
            Some(entry) => entry.nickname.clone(),
            None => return false,
        };

        let receiver_id = match self.handle_find_session(receiver_nick) {
            Some(id) => id,
            None => return false,
        };

        self.deliver_to(&receiver_id, format!("[PM from {}]: {}", sender_nick, msg));
        self.deliver_to(&sender, format!("* To {}: {}", receiver_nick, msg));
        self.history.log_private_message(msg, &sender_nick, receiver_nick);
        info!("PM sent from {} to {}", sender_nick, receiver_nick);
        true
    }

    fn handle_shutdown(&mut self) {
        info!("Registry shutting down; closing {} sessions", self.sessions.len());
        for (_, entry) in self.sessions.drain() {
            entry.cancel.cancel();
        }
        self.nicknames.clear();
        self.rooms.clear();
    }

    /// Post a frame into a session's own ordered outbox. Never blocks the
    /// actor; a full queue drops the frame with a warning.
    fn deliver_to(&self, id: &SessionId, msg: String) {
        if let Some(entry) = self.sessions.get(id) {
            match entry.outbox.try_send(msg) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "[Session {}] outbound queue full, dropping message",
                        entry.remote_id
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::session::WRITE_QUEUE_CAP;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_registry() -> RegistryHandle {
        let dir = std::env::temp_dir().join(format!("cherry-registry-{}", uuid::Uuid::new_v4()));
        RegistryHandle::new(Arc::new(MessageHistory::new(dir)))
    }

    async fn fake_session(
        registry: &RegistryHandle,
        port: u16,
    ) -> (SessionId, mpsc::Receiver<String>) {
        let id = SessionId::new();
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAP);
        registry
            .join(SessionLink {
                id,
                remote_id: format!("127.0.0.1:{}", port),
                outbox: tx,
                cancel: CancellationToken::new(),
            })
            .await;
        (id, rx)
    }

    async fn next_msg(rx: &mut mpsc::Receiver<String>) -> String {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_nickname_registration_is_idempotent() {
        let registry = test_registry();
        let (id, _rx) = fake_session(&registry, 1000).await;

        assert!(registry.try_register_nickname("alice", id).await);
        assert!(registry.try_register_nickname("alice", id).await);
        assert_eq!(registry.get_user_list().await, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_nickname_rejected() {
        let registry = test_registry();
        let (a, _rx_a) = fake_session(&registry, 1000).await;
        let (b, _rx_b) = fake_session(&registry, 1001).await;

        assert!(registry.try_register_nickname("dup_nick", a).await);
        assert!(!registry.try_register_nickname("dup_nick", b).await);
    }

    #[tokio::test]
    async fn test_reserved_nicknames_rejected() {
        let registry = test_registry();
        let (id, _rx) = fake_session(&registry, 1000).await;

        assert!(!registry.try_register_nickname("Server", id).await);
        assert!(!registry.try_register_nickname("system", id).await);
    }

    #[tokio::test]
    async fn test_rename_releases_old_nickname() {
        let registry = test_registry();
        let (a, _rx_a) = fake_session(&registry, 1000).await;
        let (b, _rx_b) = fake_session(&registry, 1001).await;

        assert!(registry.try_register_nickname("first", a).await);
        assert!(registry.try_register_nickname("second", a).await);
        // the old name is free again
        assert!(registry.try_register_nickname("first", b).await);

        let mut users = registry.get_user_list().await;
        users.sort();
        assert_eq!(users, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn test_leave_releases_nickname_for_reuse() {
        let registry = test_registry();
        let (a, _rx_a) = fake_session(&registry, 1000).await;
        assert!(registry.try_register_nickname("ghost", a).await);
        registry.leave(a).await;

        let (b, _rx_b) = fake_session(&registry, 1001).await;
        assert!(registry.try_register_nickname("ghost", b).await);
        assert_eq!(registry.get_user_list().await, vec!["ghost".to_string()]);
    }

    #[tokio::test]
    async fn test_find_session_by_nickname() {
        let registry = test_registry();
        let (a, _rx_a) = fake_session(&registry, 1000).await;
        registry.try_register_nickname("findme", a).await;

        assert_eq!(registry.find_session_by_nickname("findme").await, Some(a));
        assert_eq!(registry.find_session_by_nickname("ghost").await, None);

        registry.leave(a).await;
        assert_eq!(registry.find_session_by_nickname("findme").await, None);
    }

    #[tokio::test]
    async fn test_join_room_delivers_confirmation_and_notice() {
        let registry = test_registry();
        let (a, mut rx_a) = fake_session(&registry, 1000).await;
        let (b, mut rx_b) = fake_session(&registry, 1001).await;
        registry.try_register_nickname("user1", a).await;
        registry.try_register_nickname("user2", b).await;

        assert!(registry.join_room("testroom", a).await);
        assert_eq!(next_msg(&mut rx_a).await, "* 'testroom' 방에 입장했습니다.");
        assert_eq!(next_msg(&mut rx_a).await, "* 현재 멤버 (1): user1 (You)");

        assert!(registry.join_room("testroom", b).await);
        assert_eq!(next_msg(&mut rx_b).await, "* 'testroom' 방에 입장했습니다.");
        let members_line = next_msg(&mut rx_b).await;
        assert!(members_line.starts_with("* 현재 멤버 (2): "));
        assert!(members_line.contains("user1"));
        assert!(members_line.contains("user2 (You)"));

        // the earlier member sees the join notice
        assert_eq!(
            next_msg(&mut rx_a).await,
            "* 사용자 'user2'님이 testroom 방에 입장했습니다."
        );
    }

    #[tokio::test]
    async fn test_rejoining_current_room_is_quiet_for_peers() {
        let registry = test_registry();
        let (a, mut rx_a) = fake_session(&registry, 1000).await;
        let (b, mut rx_b) = fake_session(&registry, 1001).await;
        registry.try_register_nickname("user1", a).await;
        registry.try_register_nickname("user2", b).await;
        registry.join_room("room", a).await;
        registry.join_room("room", b).await;

        // drain setup traffic
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        assert!(registry.join_room("room", a).await);
        assert_eq!(next_msg(&mut rx_a).await, "* 이미 'room' 방에 있습니다.");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_switching_rooms_notifies_old_room() {
        let registry = test_registry();
        let (a, mut rx_a) = fake_session(&registry, 1000).await;
        let (b, mut rx_b) = fake_session(&registry, 1001).await;
        registry.try_register_nickname("mover", a).await;
        registry.try_register_nickname("stayer", b).await;
        registry.join_room("old", a).await;
        registry.join_room("old", b).await;
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        assert!(registry.join_room("new", a).await);
        assert_eq!(
            next_msg(&mut rx_b).await,
            "* 사용자 'mover'님이 old 방에 퇴장했습니다."
        );
        assert_eq!(next_msg(&mut rx_a).await, "* 'new' 방에 입장했습니다.");
    }

    #[tokio::test]
    async fn test_leave_room_requires_membership() {
        let registry = test_registry();
        let (a, mut rx_a) = fake_session(&registry, 1000).await;
        registry.try_register_nickname("alone", a).await;

        assert!(!registry.leave_room("nowhere", a).await);

        registry.join_room("somewhere", a).await;
        while rx_a.try_recv().is_ok() {}
        assert!(registry.leave_room("somewhere", a).await);
        assert_eq!(next_msg(&mut rx_a).await, "* 'somewhere' 방에서 퇴장했습니다.");
        // the room was destroyed with its last member
        assert!(!registry.leave_room("somewhere", a).await);
    }

    #[tokio::test]
    async fn test_room_broadcast_excludes_sender() {
        let registry = test_registry();
        let (a, mut rx_a) = fake_session(&registry, 1000).await;
        let (b, mut rx_b) = fake_session(&registry, 1001).await;
        registry.try_register_nickname("user1", a).await;
        registry.try_register_nickname("user2", b).await;
        registry.join_room("testroom", a).await;
        registry.join_room("testroom", b).await;
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        let msg = "[user1 @ testroom]: Hello from user1 in testroom";
        assert!(registry.broadcast_to_room("testroom", msg, Some(a)).await);
        assert_eq!(next_msg(&mut rx_b).await, msg);
        assert!(rx_a.try_recv().is_err());

        assert!(!registry.broadcast_to_room("missing", "x", Some(a)).await);
    }

    #[tokio::test]
    async fn test_private_message_round_trip() {
        let registry = test_registry();
        let (a, mut rx_a) = fake_session(&registry, 1000).await;
        let (b, mut rx_b) = fake_session(&registry, 1001).await;
        registry.try_register_nickname("sender", a).await;
        registry.try_register_nickname("receiver", b).await;

        assert!(registry.send_private_message("hello there", a, "receiver").await);
        assert_eq!(next_msg(&mut rx_b).await, "[PM from sender]: hello there");
        assert_eq!(next_msg(&mut rx_a).await, "* To receiver: hello there");

        assert!(!registry.send_private_message("void", a, "nobody").await);
    }

    #[tokio::test]
    async fn test_disconnect_broadcast_requires_user_nickname() {
        let registry = test_registry();
        let (observer, mut rx_observer) = fake_session(&registry, 1000).await;
        registry.try_register_nickname("observer2", observer).await;

        // a session that never set a nickname leaves silently
        let (silent, _rx_silent) = fake_session(&registry, 1001).await;
        registry.leave(silent).await;
        assert!(rx_observer.try_recv().is_err());

        // a named session's departure is announced
        let (named, _rx_named) = fake_session(&registry, 1002).await;
        registry.try_register_nickname("dropper", named).await;
        while rx_observer.try_recv().is_ok() {}
        registry.leave(named).await;
        assert_eq!(
            next_msg(&mut rx_observer).await,
            "* 사용자 'dropper'님이 퇴장했습니다."
        );
    }

    #[tokio::test]
    async fn test_messages_reach_history_streams() {
        let dir = std::env::temp_dir().join(format!("cherry-registry-{}", uuid::Uuid::new_v4()));
        let history = Arc::new(MessageHistory::new(&dir));
        let registry = RegistryHandle::new(history.clone());

        let (a, mut rx_a) = fake_session(&registry, 1000).await;
        let (b, _rx_b) = fake_session(&registry, 1001).await;
        registry.try_register_nickname("alice", a).await;
        registry.try_register_nickname("bob", b).await;

        registry.broadcast("[alice]: hello world", Some(a));
        registry.join_room("logroom", a).await;
        while rx_a.try_recv().is_ok() {}
        registry
            .broadcast_to_room("logroom", "[alice @ logroom]: in room", Some(a))
            .await;
        registry.send_private_message("psst", a, "bob").await;

        // a further call serializes behind the writes above
        registry.get_user_list().await;

        let global = history.load_global_history(0);
        assert!(global.iter().any(|l| l.contains("[alice]: [alice]: hello world")));

        let room = history.load_room_history("logroom", 0);
        assert_eq!(room.len(), 1);
        assert!(room[0].contains("[alice @ logroom]: in room"));

        let private = history.load_private_history("alice", "bob", 0);
        assert_eq!(private.len(), 1);
        assert!(private[0].contains("[alice -> bob]: psst"));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_disabled_history_logs_nothing() {
        let dir = std::env::temp_dir().join(format!("cherry-registry-{}", uuid::Uuid::new_v4()));
        let history = Arc::new(MessageHistory::new(&dir));
        history.set_enabled(false);
        let registry = RegistryHandle::new(history.clone());

        let (a, _rx_a) = fake_session(&registry, 1000).await;
        let (b, _rx_b) = fake_session(&registry, 1001).await;
        registry.try_register_nickname("alice", a).await;
        registry.try_register_nickname("bob", b).await;
        registry.send_private_message("psst", a, "bob").await;
        registry.get_user_list().await;

        history.set_enabled(true);
        assert!(history.load_private_history("alice", "bob", 0).is_empty());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_sessions() {
        let registry = test_registry();
        let id = SessionId::new();
        let (tx, _rx) = mpsc::channel(WRITE_QUEUE_CAP);
        let cancel = CancellationToken::new();
        registry
            .join(SessionLink {
                id,
                remote_id: "127.0.0.1:9".to_string(),
                outbox: tx,
                cancel: cancel.clone(),
            })
            .await;

        registry.shutdown().await;
        assert!(cancel.is_cancelled());
        assert!(registry.get_user_list().await.is_empty());
    }
}
