//! Process-local registry of live connections, keyed by room.
//!
//! Each connection owns an unbounded channel drained by its writer task. The
//! registry only holds the sending half, so delivery never awaits and the
//! lock is never held across an `.await`.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use pairchat_core::RoomId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Identifier for a live connection, unique within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Sending half of a connection's outbound queue.
pub type ConnSender = mpsc::UnboundedSender<String>;

type Rooms = HashMap<RoomId, HashMap<ConnId, ConnSender>>;

/// Live connections grouped by room.
#[derive(Default)]
pub struct ConnectionRegistry {
    rooms: Mutex<Rooms>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh connection id.
    pub fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register `conn` under `room_id`. Re-joining replaces the sender.
    pub fn join(&self, conn: ConnId, room_id: &RoomId, sender: ConnSender) {
        let mut rooms = self.lock();
        rooms.entry(room_id.clone()).or_default().insert(conn, sender);
        tracing::debug!(room_id = %room_id, %conn, "connection joined");
    }

    /// Deregister `conn` from `room_id`, dropping the room entry once empty.
    ///
    /// Returns whether the connection was registered.
    pub fn leave(&self, conn: ConnId, room_id: &RoomId) -> bool {
        let mut rooms = self.lock();
        let Some(conns) = rooms.get_mut(room_id) else {
            return false;
        };
        let removed = conns.remove(&conn).is_some();
        if conns.is_empty() {
            rooms.remove(room_id);
        }
        if removed {
            tracing::debug!(room_id = %room_id, %conn, "connection left");
        }
        removed
    }

    /// Send `payload` to every connection in `room_id` except `exclude`.
    ///
    /// Connections whose queue is closed are deregistered. Returns how many
    /// connections accepted the payload.
    pub fn deliver_local(&self, room_id: &RoomId, payload: &str, exclude: Option<ConnId>) -> usize {
        let mut rooms = self.lock();
        let Some(conns) = rooms.get_mut(room_id) else {
            return 0;
        };

        let mut delivered = 0;
        conns.retain(|conn, sender| {
            if Some(*conn) == exclude {
                return true;
            }
            if sender.send(payload.to_string()).is_ok() {
                delivered += 1;
                true
            } else {
                tracing::debug!(room_id = %room_id, %conn, "dropping dead connection");
                false
            }
        });

        if conns.is_empty() {
            rooms.remove(room_id);
        }
        delivered
    }

    /// Number of live connections in a room.
    pub fn connection_count(&self, room_id: &RoomId) -> usize {
        self.lock().get(room_id).map_or(0, HashMap::len)
    }

    /// Number of rooms with at least one live connection.
    pub fn room_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Rooms> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry").field("rooms", &self.room_count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(id: &str) -> RoomId {
        RoomId::from(id)
    }

    #[test]
    fn deliver_reaches_every_member_but_the_originator() {
        let registry = ConnectionRegistry::new();
        let (a, b) = (registry.next_conn_id(), registry.next_conn_id());
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.join(a, &room("r1"), tx_a);
        registry.join(b, &room("r1"), tx_b);

        let delivered = registry.deliver_local(&room("r1"), "hi", Some(a));

        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), "hi");
    }

    #[test]
    fn deliver_is_scoped_to_the_room() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.join(registry.next_conn_id(), &room("r1"), tx);

        assert_eq!(registry.deliver_local(&room("r2"), "hi", None), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dead_connection_is_dropped_on_first_failed_delivery() {
        let registry = ConnectionRegistry::new();
        let (alive, dead) = (registry.next_conn_id(), registry.next_conn_id());
        let (tx_alive, _rx_alive) = mpsc::unbounded_channel();
        let (tx_dead, rx_dead) = mpsc::unbounded_channel();
        registry.join(alive, &room("r1"), tx_alive);
        registry.join(dead, &room("r1"), tx_dead);
        drop(rx_dead);

        assert_eq!(registry.deliver_local(&room("r1"), "hi", None), 1);
        assert_eq!(registry.connection_count(&room("r1")), 1);
    }

    #[test]
    fn leaving_last_connection_removes_room() {
        let registry = ConnectionRegistry::new();
        let conn = registry.next_conn_id();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.join(conn, &room("r1"), tx);
        assert_eq!(registry.room_count(), 1);

        assert!(registry.leave(conn, &room("r1")));
        assert_eq!(registry.room_count(), 0);
        assert!(!registry.leave(conn, &room("r1")));
    }

    #[test]
    fn conn_ids_are_unique() {
        let registry = ConnectionRegistry::new();
        assert_ne!(registry.next_conn_id(), registry.next_conn_id());
    }
}
