//! The registry of connected sessions and the single loop allowed to change it.
//!
//! Every join, leave and broadcast flows through one unbounded channel into
//! [`Dispatcher::run`], which applies them strictly one at a time. That gives a
//! total order over all registry changes and deliveries without putting a lock
//! around the client list: the [`Registry`] is owned by the loop and nobody
//! else can reach it.

use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Process-unique identity of one accepted connection.
pub type SessionId = u64;

/// The registry's view of a session: enough to address it, never the socket.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub outbound: mpsc::UnboundedSender<Bytes>,
}

/// Snapshot row returned by [`DispatcherHandle::members`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: SocketAddr,
}

#[derive(Debug)]
pub enum Event {
    Add(SessionEntry),
    Remove(SessionId),
    Broadcast { from: SessionId, payload: Bytes },
    Members(oneshot::Sender<Vec<SessionInfo>>),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("dispatcher is no longer running")]
pub struct DispatcherClosed;

/// Ordered set of active sessions.
///
/// Insertion order is kept so fan-out is deterministic. Lookups are linear;
/// the set is only ever touched from the dispatcher loop.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: Vec<SessionEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entry` unless its id is already present.
    pub fn add(&mut self, entry: SessionEntry) -> bool {
        if self.contains(entry.id) {
            return false;
        }
        self.sessions.push(entry);
        true
    }

    /// Removes the session with `id`. Removing an absent id is a no-op.
    pub fn remove(&mut self, id: SessionId) -> Option<SessionEntry> {
        let index = self.sessions.iter().position(|entry| entry.id == id)?;
        Some(self.sessions.remove(index))
    }

    /// Queues `payload` on every registered session, returning how many
    /// queues accepted it.
    pub fn broadcast(&self, payload: &Bytes) -> usize {
        self.sessions
            .iter()
            .filter(|entry| match entry.outbound.send(payload.clone()) {
                Ok(()) => true,
                Err(_) => {
                    // Writer already gone; its Remove is queued behind us.
                    debug!(session = entry.id, "dropping payload for closed session");
                    false
                }
            })
            .count()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.iter().any(|entry| entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn members(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| SessionInfo {
                id: entry.id,
                peer: entry.peer,
            })
            .collect()
    }

    fn peer_of(&self, id: SessionId) -> Option<SocketAddr> {
        self.sessions
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.peer)
    }
}

/// Cloneable sender side of the dispatcher's event intake.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    events: mpsc::UnboundedSender<Event>,
}

impl DispatcherHandle {
    pub fn add(&self, entry: SessionEntry) -> Result<(), DispatcherClosed> {
        self.send(Event::Add(entry))
    }

    pub fn remove(&self, id: SessionId) -> Result<(), DispatcherClosed> {
        self.send(Event::Remove(id))
    }

    pub fn broadcast(&self, from: SessionId, payload: Bytes) -> Result<(), DispatcherClosed> {
        self.send(Event::Broadcast { from, payload })
    }

    /// Returns the registry contents as seen after every event sent before
    /// this call.
    pub async fn members(&self) -> Result<Vec<SessionInfo>, DispatcherClosed> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Event::Members(reply_tx))?;
        reply_rx.await.map_err(|_| DispatcherClosed)
    }

    fn send(&self, event: Event) -> Result<(), DispatcherClosed> {
        self.events.send(event).map_err(|_| DispatcherClosed)
    }
}

/// Owner of the [`Registry`]; see the module docs.
pub struct Dispatcher {
    events: mpsc::UnboundedReceiver<Event>,
    registry: Registry,
}

impl Dispatcher {
    pub fn channel() -> (Self, DispatcherHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            events: events_rx,
            registry: Registry::new(),
        };
        (dispatcher, DispatcherHandle { events: events_tx })
    }

    /// Processes events until every [`DispatcherHandle`] has been dropped.
    pub async fn run(mut self) -> Registry {
        while let Some(event) = self.events.recv().await {
            self.handle(event);
        }
        debug!(remaining = self.registry.len(), "dispatcher stopped");
        self.registry
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Add(entry) => {
                let (id, peer) = (entry.id, entry.peer);
                if self.registry.add(entry) {
                    info!(session = id, %peer, online = self.registry.len(), "join");
                } else {
                    debug!(session = id, "ignoring duplicate add");
                }
            }
            Event::Remove(id) => match self.registry.remove(id) {
                Some(entry) => {
                    info!(session = id, peer = %entry.peer, online = self.registry.len(), "leave");
                }
                None => debug!(session = id, "remove for unknown session ignored"),
            },
            Event::Broadcast { from, payload } => {
                let delivered = self.registry.broadcast(&payload);
                match self.registry.peer_of(from) {
                    Some(peer) => debug!(
                        session = from,
                        %peer,
                        payload = %String::from_utf8_lossy(&payload),
                        delivered,
                        "broadcast"
                    ),
                    None => debug!(
                        session = from,
                        payload = %String::from_utf8_lossy(&payload),
                        delivered,
                        "broadcast from departed session"
                    ),
                }
            }
            Event::Members(reply) => {
                let _ = reply.send(self.registry.members());
            }
        }
    }
}
