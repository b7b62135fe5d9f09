//! Connection registry and best-effort event delivery.
//!
//! Each persistent connection is registered under its authenticated
//! participant id (never a client-asserted field). A participant may hold
//! any number of simultaneous connections (tabs, devices); business
//! connections additionally join a business-wide room used for multi-seat
//! dashboard delivery.
//!
//! Delivery is push-only and at-most-once per connection: events go into
//! each connection's bounded outbound queue with `try_send`, and a full
//! queue drops rather than blocks. A participant with zero connections
//! receives nothing; durability lives in the message store, and a
//! reconnecting client reconciles through the synchronization API.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::gateway::protocol::ServerEvent;
use crate::identity::Role;

pub type ConnectionId = Uuid;

struct ConnectionEntry {
    participant_id: String,
    role: Role,
    sender: mpsc::Sender<ServerEvent>,
}

/// Snapshot of the routing tables, exposed on the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStats {
    pub connections: usize,
    pub participants: usize,
    pub business_rooms: usize,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Default)]
pub struct SessionManager {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    participants: DashMap<String, HashSet<ConnectionId>>,
    business_rooms: DashMap<String, HashSet<ConnectionId>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to an authenticated identity and add it to the
    /// routing tables. Returns the handle used to unregister.
    pub fn register(
        &self,
        participant_id: &str,
        role: Role,
        sender: mpsc::Sender<ServerEvent>,
    ) -> ConnectionId {
        let conn_id = Uuid::new_v4();
        self.connections.insert(
            conn_id,
            ConnectionEntry {
                participant_id: participant_id.to_string(),
                role,
                sender,
            },
        );
        self.participants
            .entry(participant_id.to_string())
            .or_default()
            .insert(conn_id);
        if role == Role::Business {
            self.business_rooms
                .entry(participant_id.to_string())
                .or_default()
                .insert(conn_id);
        }
        conn_id
    }

    /// Remove a connection from every index. Persisted state is untouched.
    pub fn unregister(&self, conn_id: ConnectionId) -> Option<String> {
        let (_, entry) = self.connections.remove(&conn_id)?;

        if let Some(mut conns) = self.participants.get_mut(&entry.participant_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                drop(conns);
                self.participants.remove(&entry.participant_id);
            }
        }
        if entry.role == Role::Business {
            if let Some(mut room) = self.business_rooms.get_mut(&entry.participant_id) {
                room.remove(&conn_id);
                if room.is_empty() {
                    drop(room);
                    self.business_rooms.remove(&entry.participant_id);
                }
            }
        }
        Some(entry.participant_id)
    }

    /// Push an event to every connection of one participant. Returns the
    /// number of connections that accepted it.
    pub fn deliver_to_participant(&self, participant_id: &str, event: &ServerEvent) -> usize {
        let Some(conns) = self.participants.get(participant_id) else {
            return 0;
        };
        let targets: Vec<ConnectionId> = conns.iter().copied().collect();
        drop(conns);
        self.deliver_to(&targets, event)
    }

    /// Push an event to every seat of a business room.
    pub fn deliver_to_business(&self, business_id: &str, event: &ServerEvent) -> usize {
        let Some(room) = self.business_rooms.get(business_id) else {
            return 0;
        };
        let targets: Vec<ConnectionId> = room.iter().copied().collect();
        drop(room);
        self.deliver_to(&targets, event)
    }

    /// Push an event to one specific connection (negative acks go only to
    /// the originator).
    pub fn deliver_to_connection(&self, conn_id: ConnectionId, event: ServerEvent) -> bool {
        let Some(entry) = self.connections.get(&conn_id) else {
            return false;
        };
        match entry.sender.try_send(event) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn deliver_to(&self, targets: &[ConnectionId], event: &ServerEvent) -> usize {
        let mut accepted = 0;
        for conn_id in targets {
            if let Some(entry) = self.connections.get(conn_id) {
                match entry.sender.try_send(event.clone()) {
                    Ok(()) => {
                        accepted += 1;
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        accepted
    }

    pub fn is_online(&self, participant_id: &str) -> bool {
        self.participants
            .get(participant_id)
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            connections: self.connections.len(),
            participants: self.participants.len(),
            business_rooms: self.business_rooms.len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
