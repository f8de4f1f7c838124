//! Chat room membership
//!
//! A room is a named set of session ids with a capacity limit. Rooms are
//! created lazily on the first join and destroyed when the last member
//! leaves; only the registry actor touches them, so the methods here are
//! plain synchronous mutations.

use std::collections::HashSet;

use crate::chat::session::SessionId;

/// Default maximum number of participants per room
pub const DEFAULT_ROOM_CAPACITY: usize = 100;

/// A chat room
#[derive(Debug)]
pub struct Room {
    name: String,
    capacity: usize,
    members: HashSet<SessionId>,
}

impl Room {
    /// Create an empty room with the default capacity
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: DEFAULT_ROOM_CAPACITY,
            members: HashSet::new(),
        }
    }

    /// Create an empty room with an explicit capacity
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            members: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a member. Fails when the room is at capacity.
    pub fn join(&mut self, id: SessionId) -> bool {
        if self.is_full() && !self.members.contains(&id) {
            return false;
        }
        self.members.insert(id);
        true
    }

    /// Remove a member; returns whether removal occurred
    pub fn leave(&mut self, id: &SessionId) -> bool {
        self.members.remove(id)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.members.contains(id)
    }

    pub fn participant_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Snapshot of the current member ids
    pub fn members(&self) -> Vec<SessionId> {
        self.members.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_leave() {
        let mut room = Room::new("lobby");
        let a = SessionId::new();
        let b = SessionId::new();

        assert!(room.join(a));
        assert!(room.join(b));
        assert_eq!(room.participant_count(), 2);
        assert!(room.contains(&a));

        assert!(room.leave(&a));
        assert!(!room.leave(&a));
        assert_eq!(room.participant_count(), 1);
        assert!(!room.is_empty());
        assert!(room.leave(&b));
        assert!(room.is_empty());
    }

    #[test]
    fn test_capacity_limit() {
        let mut room = Room::with_capacity("tiny", 2);
        let a = SessionId::new();
        let b = SessionId::new();
        let c = SessionId::new();

        assert!(room.join(a));
        assert!(room.join(b));
        assert!(room.is_full());
        assert!(!room.join(c));
        // re-joining an existing member is not a capacity violation
        assert!(room.join(a));
        assert_eq!(room.participant_count(), 2);
    }
}
