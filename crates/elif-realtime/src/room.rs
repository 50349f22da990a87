//! Rooms: named, ephemeral groups of clients
//!
//! A room only exists while it has members. The hub creates rooms on first
//! join and deletes them once empty; [`RoomManager::cleanup`] reaps any that
//! slipped through.

use crate::client::{Client, ClientId};
use crate::error::RealtimeResult;
use crate::message::Message;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of delivering one frame to many clients
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Clients skipped because their queue was full or closed
    pub dropped: Vec<ClientId>,
}

impl DeliveryReport {
    pub fn total_attempted(&self) -> usize {
        self.delivered + self.dropped.len()
    }

    pub fn has_drops(&self) -> bool {
        !self.dropped.is_empty()
    }
}

/// Non-blocking fan-out of an encoded frame; a full queue skips only that client.
pub(crate) fn deliver<'a, I>(frame: &Bytes, clients: I) -> DeliveryReport
where
    I: IntoIterator<Item = &'a Arc<Client>>,
{
    let mut report = DeliveryReport::default();

    for client in clients {
        match client.enqueue(frame.clone()) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                debug!(client_id = %client.id(), error = %e, "Dropped message for client");
                report.dropped.push(client.id());
            }
        }
    }

    report
}

/// A named set of clients
#[derive(Debug)]
pub struct Room {
    name: String,
    created_at: DateTime<Utc>,
    members: RwLock<HashMap<ClientId, Arc<Client>>>,
}

impl Room {
    pub fn new<T: Into<String>>(name: T) -> Self {
        Self {
            name: name.into(),
            created_at: Utc::now(),
            members: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Add a member; returns false if it was already present
    pub fn add(&self, client: Arc<Client>) -> bool {
        let id = client.id();
        let added = self.members.write().insert(id, client).is_none();
        if added {
            debug!(room = %self.name, client_id = %id, "Client added to room");
        }
        added
    }

    pub fn remove(&self, id: ClientId) -> Option<Arc<Client>> {
        let removed = self.members.write().remove(&id);
        if removed.is_some() {
            debug!(room = %self.name, client_id = %id, "Client removed from room");
        }
        removed
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.members.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn members(&self) -> Vec<Arc<Client>> {
        self.members.read().values().cloned().collect()
    }

    pub fn member_ids(&self) -> Vec<ClientId> {
        self.members.read().keys().copied().collect()
    }

    /// Send to every member
    pub fn broadcast(&self, message: &Message) -> RealtimeResult<DeliveryReport> {
        let frame = message.encode()?;
        Ok(self.deliver(&frame, None))
    }

    /// Send to every member but `excluded`
    pub fn broadcast_except(
        &self,
        message: &Message,
        excluded: ClientId,
    ) -> RealtimeResult<DeliveryReport> {
        let frame = message.encode()?;
        Ok(self.deliver(&frame, Some(excluded)))
    }

    pub(crate) fn deliver(&self, frame: &Bytes, excluded: Option<ClientId>) -> DeliveryReport {
        // Snapshot so no lock is held while enqueueing.
        let members: Vec<Arc<Client>> = self
            .members
            .read()
            .values()
            .filter(|client| Some(client.id()) != excluded)
            .cloned()
            .collect();

        deliver(frame, &members)
    }
}

/// Name-keyed index of rooms
#[derive(Debug, Default)]
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing room, or a new one stored atomically
    pub fn get_or_create(&self, name: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.read().get(name) {
            return room.clone();
        }

        let mut rooms = self.rooms.write();
        rooms
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(room = %name, "Created room");
                Arc::new(Room::new(name))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Room>> {
        let removed = self.rooms.write().remove(name);
        if removed.is_some() {
            info!(room = %name, "Deleted room");
        }
        removed
    }

    /// Delete the room if it has no members left
    pub fn remove_if_empty(&self, name: &str) -> bool {
        let mut rooms = self.rooms.write();
        let empty = rooms.get(name).is_some_and(|room| room.is_empty());
        if empty {
            rooms.remove(name);
            info!(room = %name, "Deleted empty room");
        }
        empty
    }

    /// Remove every room with zero members
    pub fn cleanup(&self) -> usize {
        let mut rooms = self.rooms.write();
        let before = rooms.len();
        rooms.retain(|_, room| !room.is_empty());
        let removed = before - rooms.len();

        if removed > 0 {
            info!("Cleaned up {} empty rooms", removed);
        }
        removed
    }

    /// Room name to member count
    pub fn stats(&self) -> BTreeMap<String, usize> {
        self.rooms
            .read()
            .iter()
            .map(|(name, room)| (name.clone(), room.len()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.read().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.rooms.read().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.rooms.write().clear();
    }
}
