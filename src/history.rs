//! On-disk message history
//!
//! Three write-only streams: global, per-room, and per-user-pair (private).
//! Each entry is one timestamped text line. Writes across all streams are
//! serialized by a single mutex; history is a low-rate stream.

use std::fs;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Local;
use tracing::{error, info};

/// Append-only text log store under a base directory
pub struct MessageHistory {
    base_dir: PathBuf,
    enabled: AtomicBool,
    write_lock: Mutex<()>,
}

impl MessageHistory {
    /// Create the store, ensuring the `global/`, `private/` and `rooms/`
    /// subdirectories exist. A filesystem failure disables the store
    /// instead of failing construction.
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        let base_dir = base_dir.as_ref().to_path_buf();
        let mut enabled = true;

        for sub in ["global", "private", "rooms"] {
            if let Err(e) = fs::create_dir_all(base_dir.join(sub)) {
                error!("Failed to initialize history directory {:?}: {}", sub, e);
                enabled = false;
            }
        }

        if enabled {
            info!("MessageHistory initialized with directory: {}", base_dir.display());
        }

        Self {
            base_dir,
            enabled: AtomicBool::new(enabled),
            write_lock: Mutex::new(()),
        }
    }

    pub fn set_enabled(&self, enable: bool) {
        self.enabled.store(enable, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Append to the global stream. An empty sender is logged as `system`.
    pub fn log_global_message(&self, message: &str, sender: &str) {
        let sender = if sender.is_empty() { "system" } else { sender };
        let entry = format!("{} [{}]: {}", timestamp(), sender, message);
        self.append(self.base_dir.join("global").join("history.txt"), &entry);
    }

    /// Append to a room stream
    pub fn log_room_message(&self, room_name: &str, message: &str, sender: &str) {
        let sender = if sender.is_empty() { "system" } else { sender };
        let entry = format!("{} [{}]: {}", timestamp(), sender, message);
        self.append(self.base_dir.join("rooms").join(format!("{}.txt", room_name)), &entry);
    }

    /// Append to a private stream. (A,B) and (B,A) share one file keyed by
    /// the lexicographically smaller nickname first.
    pub fn log_private_message(&self, message: &str, sender: &str, receiver: &str) {
        let entry = format!("{} [{} -> {}]: {}", timestamp(), sender, receiver, message);
        self.append(self.pair_path(sender, receiver), &entry);
    }

    /// Last `limit` lines of the global stream (all lines when limit is 0)
    pub fn load_global_history(&self, limit: usize) -> Vec<String> {
        self.read_tail(self.base_dir.join("global").join("history.txt"), limit)
    }

    /// Last `limit` lines of a room stream
    pub fn load_room_history(&self, room_name: &str, limit: usize) -> Vec<String> {
        self.read_tail(self.base_dir.join("rooms").join(format!("{}.txt", room_name)), limit)
    }

    /// Last `limit` lines of a private stream
    pub fn load_private_history(&self, user1: &str, user2: &str, limit: usize) -> Vec<String> {
        self.read_tail(self.pair_path(user1, user2), limit)
    }

    fn pair_path(&self, a: &str, b: &str) -> PathBuf {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        self.base_dir.join("private").join(format!("{}_{}.txt", first, second))
    }

    fn append(&self, path: PathBuf, entry: &str) {
        if !self.is_enabled() {
            return;
        }
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{}", entry));
        if let Err(e) = result {
            error!("Failed to write history entry to {}: {}", path.display(), e);
        }
    }

    fn read_tail(&self, path: PathBuf, limit: usize) -> Vec<String> {
        if !self.is_enabled() {
            return Vec::new();
        }
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .map_while(|l| l.ok())
            .filter(|l| !l.trim().is_empty())
            .collect();

        if limit == 0 || limit >= lines.len() {
            lines
        } else {
            lines[lines.len() - limit..].to_vec()
        }
    }
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_history() -> (MessageHistory, PathBuf) {
        let dir = std::env::temp_dir().join(format!("cherry-history-{}", uuid::Uuid::new_v4()));
        (MessageHistory::new(&dir), dir)
    }

    #[test]
    fn test_global_log_and_tail() {
        let (history, dir) = temp_history();
        assert!(history.is_enabled());

        for i in 0..5 {
            history.log_global_message(&format!("message {}", i), "alice");
        }

        let all = history.load_global_history(0);
        assert_eq!(all.len(), 5);
        assert!(all[0].contains("[alice]: message 0"));

        let tail = history.load_global_history(2);
        assert_eq!(tail.len(), 2);
        assert!(tail[0].contains("message 3"));
        assert!(tail[1].contains("message 4"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_private_pair_shares_file() {
        let (history, dir) = temp_history();

        history.log_private_message("hi bob", "alice", "bob");
        history.log_private_message("hi alice", "bob", "alice");

        let from_either_side = history.load_private_history("bob", "alice", 0);
        assert_eq!(from_either_side.len(), 2);
        assert!(from_either_side[0].contains("[alice -> bob]: hi bob"));
        assert!(from_either_side[1].contains("[bob -> alice]: hi alice"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_room_log_keyed_by_room() {
        let (history, dir) = temp_history();

        history.log_room_message("lobby", "hello", "alice");
        history.log_room_message("other", "elsewhere", "bob");

        let lobby = history.load_room_history("lobby", 0);
        assert_eq!(lobby.len(), 1);
        assert!(lobby[0].contains("[alice]: hello"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_empty_sender_logged_as_system() {
        let (history, dir) = temp_history();

        history.log_global_message("notice", "");
        let all = history.load_global_history(0);
        assert!(all[0].contains("[system]: notice"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_file_returns_empty() {
        let (history, dir) = temp_history();
        assert!(history.load_room_history("nope", 10).is_empty());
        assert!(history.load_private_history("a", "b", 10).is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_disabled_store_skips_writes() {
        let (history, dir) = temp_history();
        history.set_enabled(false);
        history.log_global_message("dropped", "alice");
        history.set_enabled(true);
        assert!(history.load_global_history(0).is_empty());
        let _ = fs::remove_dir_all(dir);
    }
}
