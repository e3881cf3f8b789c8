//! Room struct definition
//!
//! Live membership of one named room. Only the hub mutates rooms.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{ClientId, ClientIdentity, RoomId};

/// Chat room
///
/// Holds the identities currently connected to the room. A room lives in
/// the hub's table only while it has at least one member.
#[derive(Debug)]
pub struct Room {
    /// Room id
    pub id: RoomId,
    /// Current members: ClientId -> ClientIdentity
    members: HashMap<ClientId, ClientIdentity>,
    /// Room creation time (first join)
    pub created_at: DateTime<Utc>,
}

/// Summary of a live room for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub member_count: usize,
    pub created_at: DateTime<Utc>,
}

impl Room {
    /// Create a new empty room
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Add a member
    ///
    /// Returns false if a member with the same connection id was replaced.
    pub fn add(&mut self, identity: ClientIdentity) -> bool {
        self.members
            .insert(identity.connection_id.clone(), identity)
            .is_none()
    }

    /// Remove a member
    ///
    /// Returns the removed identity, or None if it was not a member.
    pub fn remove(&mut self, client_id: &ClientId) -> Option<ClientIdentity> {
        self.members.remove(client_id)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Iterate over the member connection ids
    pub fn member_ids(&self) -> impl Iterator<Item = &ClientId> {
        self.members.keys()
    }

    /// Copy of the current members
    pub fn members(&self) -> Vec<ClientIdentity> {
        self.members.values().cloned().collect()
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_id: self.id.clone(),
            member_count: self.members.len(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str) -> ClientIdentity {
        ClientIdentity::new(ClientId::new(), name, RoomId::from("movie1"))
    }

    #[test]
    fn test_room_creation() {
        let room = Room::new(RoomId::from("movie1"));

        assert_eq!(room.id, RoomId::from("movie1"));
        assert!(room.is_empty());
        assert_eq!(room.member_count(), 0);
    }

    #[test]
    fn test_room_add() {
        let mut room = Room::new(RoomId::from("movie1"));
        let a = member("a");
        let b = member("b");

        assert!(room.add(a.clone()));
        assert_eq!(room.member_ids().collect::<Vec<_>>(), vec![&a.connection_id]);

        assert!(room.add(b.clone()));
        assert_eq!(room.member_count(), 2);

        // Same connection id replaces rather than duplicates
        assert!(!room.add(a.clone()));
        assert_eq!(room.member_count(), 2);
    }

    #[test]
    fn test_room_remove_until_empty() {
        let mut room = Room::new(RoomId::from("movie1"));
        let a = member("a");
        let b = member("b");
        room.add(a.clone());
        room.add(b.clone());

        assert_eq!(room.remove(&b.connection_id), Some(b.clone()));
        assert!(!room.is_empty());

        // Removing twice is harmless
        assert!(room.remove(&b.connection_id).is_none());

        room.remove(&a.connection_id);
        assert!(room.is_empty());
    }

    #[test]
    fn test_room_summary() {
        let mut room = Room::new(RoomId::from("movie1"));
        room.add(member("a"));

        let summary = room.summary();
        assert_eq!(summary.room_id, RoomId::from("movie1"));
        assert_eq!(summary.member_count, 1);
        assert_eq!(summary.created_at, room.created_at);
    }
}
