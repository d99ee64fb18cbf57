//! Session Registry: connection id -> last-known player transform.
//!
//! Owned by the relay task. Nothing else mutates it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::ServerMsg;
use crate::vec3::Vec3;

/// Opaque connection identifier, assigned at connect time.
pub type ConnectionId = String;

/// Last reported position and heading of a player.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: f64,
}

/// One connected client.
#[derive(Debug)]
pub struct Session {
    pub id: ConnectionId,
    /// None until the first `updatePosition`.
    pub transform: Option<Transform>,
    outbound: mpsc::Sender<ServerMsg>,
    /// Set once the outbound queue overflows. The relay drops lagging sessions.
    lagging: AtomicBool,
}

impl Session {
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<ServerMsg>) -> Self {
        Self {
            id,
            transform: None,
            outbound,
            lagging: AtomicBool::new(false),
        }
    }

    /// Queue a message for this client without waiting. Returns false if the
    /// socket task is gone or its queue is full; a full queue marks the
    /// session as lagging.
    pub fn send(&self, msg: ServerMsg) -> bool {
        match self.outbound.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !self.lagging.swap(true, Ordering::Relaxed) {
                    tracing::warn!(connection_id = %self.id, "Outbound queue full, client is not reading");
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_lagging(&self) -> bool {
        self.lagging.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<ConnectionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Returns false (and keeps the existing one) if the id is taken.
    pub fn register(&mut self, session: Session) -> bool {
        if self.sessions.contains_key(&session.id) {
            return false;
        }
        self.sessions.insert(session.id.clone(), session);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Overwrite the stored transform. Returns false if the session is unknown.
    pub fn update_transform(&mut self, id: &str, transform: Transform) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.transform = Some(transform);
                true
            }
            None => false,
        }
    }

    /// All sessions except `id`.
    pub fn peers_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Session> + 'a {
        self.sessions.values().filter(move |s| s.id != id)
    }

    /// Unicast. Unknown targets are dropped silently; returns whether it was queued.
    pub fn send_to(&self, id: &str, msg: ServerMsg) -> bool {
        match self.sessions.get(id) {
            Some(session) => session.send(msg),
            None => false,
        }
    }

    /// Send to every session except `sender`. Returns the number of sessions reached.
    pub fn broadcast_except(&self, sender: &str, msg: &ServerMsg) -> usize {
        self.peers_of(sender)
            .filter(|s| s.send(msg.clone()))
            .count()
    }

    /// Sessions whose outbound queue has overflowed.
    pub fn lagging(&self) -> Vec<ConnectionId> {
        self.sessions
            .values()
            .filter(|s| s.is_lagging())
            .map(|s| s.id.clone())
            .collect()
    }

    /// Send to every registered session.
    pub fn broadcast_all(&self, msg: &ServerMsg) -> usize {
        self.sessions
            .values()
            .filter(|s| s.send(msg.clone()))
            .count()
    }
}
