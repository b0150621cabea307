use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use duet_core::{ConnectionId, Role, SessionId};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// The room a connection currently belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Membership {
    pub session_id: SessionId,
    pub role: Role,
}

/// A live connection's outbound side.
struct Connection {
    tx: mpsc::Sender<String>,
    slot: Mutex<Slot>,
    last_seen: AtomicU64,
}

/// Room membership plus the closed flag. Room table edits for a connection
/// happen while this lock is held, so a join can never land after the
/// connection was unregistered.
#[derive(Default)]
struct Slot {
    membership: Option<Membership>,
    closed: bool,
}

impl Connection {
    fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            slot: Mutex::new(Slot::default()),
            last_seen: AtomicU64::new(now_secs()),
        }
    }

    fn touch(&self) {
        self.last_seen.store(now_secs(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_seen.load(Ordering::Relaxed);
        Duration::from_secs(now_secs().saturating_sub(last))
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Live connections and the rooms they have joined.
///
/// A connection is in at most one room. Membership is ephemeral and starts
/// empty on every process start.
pub struct SessionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    rooms: DashMap<SessionId, HashMap<ConnectionId, Role>>,
    max_send_queue: usize,
}

impl SessionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection and return its ID + outbound queue.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.connections.insert(id.clone(), Arc::new(Connection::new(tx)));
        (id, rx)
    }

    /// Drop a connection and its room membership. Closing the queue ends the
    /// connection's writer task.
    pub fn unregister(&self, id: &ConnectionId) {
        let Some((_, conn)) = self.connections.remove(id) else {
            return;
        };
        let mut slot = conn.slot.lock();
        slot.closed = true;
        if let Some(previous) = slot.membership.take() {
            self.remove_from_room(&previous.session_id, id);
        }
    }

    /// Put a connection in the room for `session_id`, moving it out of any
    /// other room. Returns `false` if the connection is gone.
    pub fn join(&self, id: &ConnectionId, session_id: &SessionId, role: Role) -> bool {
        let Some(conn) = self.connection(id) else {
            return false;
        };

        let mut slot = conn.slot.lock();
        if slot.closed {
            return false;
        }
        let previous = slot.membership.replace(Membership {
            session_id: session_id.clone(),
            role,
        });
        if let Some(prev) = previous {
            if prev.session_id != *session_id {
                self.remove_from_room(&prev.session_id, id);
            }
        }

        self.rooms
            .entry(session_id.clone())
            .or_default()
            .insert(id.clone(), role);
        true
    }

    /// Remove a connection from its room, if any. Nobody is notified.
    pub fn leave(&self, id: &ConnectionId) -> Option<Membership> {
        let conn = self.connection(id)?;
        let mut slot = conn.slot.lock();
        let previous = slot.membership.take()?;
        self.remove_from_room(&previous.session_id, id);
        Some(previous)
    }

    fn remove_from_room(&self, session_id: &SessionId, id: &ConnectionId) {
        if let Some(mut room) = self.rooms.get_mut(session_id) {
            room.remove(id);
        }
        self.rooms.remove_if(session_id, |_, room| room.is_empty());
    }

    fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn membership(&self, id: &ConnectionId) -> Option<Membership> {
        self.connection(id)?.slot.lock().membership.clone()
    }

    /// Queue a frame for one connection. A full queue drops the frame.
    pub fn send_to(&self, id: &ConnectionId, frame: &str) -> bool {
        let Some(conn) = self.connection(id) else {
            return false;
        };
        match conn.tx.try_send(frame.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    connection_id = %id,
                    frame_len = frame.len(),
                    "send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Deliver to every member of the room, sender included. Returns how many
    /// connections accepted the frame.
    pub fn broadcast(&self, session_id: &SessionId, frame: &str) -> usize {
        self.broadcast_filtered(session_id, frame, None)
    }

    /// Deliver to every member of the room except `except`.
    pub fn broadcast_except(
        &self,
        session_id: &SessionId,
        except: &ConnectionId,
        frame: &str,
    ) -> usize {
        self.broadcast_filtered(session_id, frame, Some(except))
    }

    fn broadcast_filtered(
        &self,
        session_id: &SessionId,
        frame: &str,
        except: Option<&ConnectionId>,
    ) -> usize {
        let mut delivered = 0;
        for (id, _) in self.members(session_id) {
            if Some(&id) == except {
                continue;
            }
            if self.send_to(&id, frame) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Current members of a room with the role each joined under.
    pub fn members(&self, session_id: &SessionId) -> Vec<(ConnectionId, Role)> {
        self.rooms
            .get(session_id)
            .map(|room| room.iter().map(|(id, role)| (id.clone(), *role)).collect())
            .unwrap_or_default()
    }

    pub fn has_members(&self, session_id: &SessionId) -> bool {
        self.rooms.contains_key(session_id)
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Note inbound traffic (including pongs) for liveness.
    pub fn record_activity(&self, id: &ConnectionId) {
        if let Some(conn) = self.connections.get(id) {
            conn.touch();
        }
    }

    /// Remove connections silent for longer than `timeout`.
    pub fn cleanup_dead_connections(&self, timeout: Duration) -> usize {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.value().idle_for() >= timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(connection_id = %id, "cleaned up dead connection");
        }
        dead.len()
    }

    #[cfg(test)]
    fn backdate(&self, id: &ConnectionId, secs: u64) {
        if let Some(conn) = self.connections.get(id) {
            conn.last_seen.fetch_sub(secs, Ordering::Relaxed);
        }
    }
}
