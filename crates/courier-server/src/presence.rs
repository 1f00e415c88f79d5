//! Connection registry: who is online, and through which connection.
//!
//! At most one live connection is recorded per user. A newer connection for
//! the same user replaces the older one, which is closed. Every presence
//! change is published on a broadcast channel so sessions can refresh the
//! online flag in their recipient lists.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use courier_shared::UserId;

use crate::connection::{ConnectionHandle, ConnectionId};

const PRESENCE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Online { user: UserId, connection: ConnectionId },
    Offline { user: UserId, connection: ConnectionId },
}

impl PresenceEvent {
    pub fn user(&self) -> &UserId {
        match self {
            PresenceEvent::Online { user, .. } | PresenceEvent::Offline { user, .. } => user,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, PresenceEvent::Online { .. })
    }
}

/// Result of registering a connection.
#[derive(Debug)]
pub enum Registration {
    /// The user had no live connection.
    CameOnline,
    /// The user was already connected; the previous connection was closed.
    Replaced(ConnectionHandle),
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<UserId, ConnectionHandle>>>,
    events: broadcast::Sender<PresenceEvent>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(PRESENCE_CHANNEL_CAPACITY);
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Record `handle` as the user's live connection.
    pub async fn register(&self, handle: ConnectionHandle) -> Registration {
        let user = handle.user().clone();
        let connection = handle.id();

        let previous = {
            let mut connections = self.connections.write().await;
            connections.insert(user.clone(), handle)
        };

        let registration = match previous {
            Some(old) if old.is_live() => {
                info!(
                    user = %user,
                    old = %old.id(),
                    new = %connection,
                    "Replacing existing connection"
                );
                old.close();
                Registration::Replaced(old)
            }
            Some(old) => {
                old.close();
                Registration::CameOnline
            }
            None => Registration::CameOnline,
        };

        debug!(user = %user, connection = %connection, "User online");
        // No subscribers is fine.
        let _ = self.events.send(PresenceEvent::Online { user, connection });

        registration
    }

    /// Remove the user's entry if it still belongs to `connection`.
    ///
    /// Returns `false` when a newer connection has taken over, in which case
    /// the registry is left untouched.
    pub async fn unregister(&self, user: &UserId, connection: ConnectionId) -> bool {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(user) {
                Some(current) if current.id() == connection => {
                    connections.remove(user);
                    true
                }
                _ => false,
            }
        };

        if removed {
            debug!(user = %user, connection = %connection, "User offline");
            let _ = self.events.send(PresenceEvent::Offline {
                user: user.clone(),
                connection,
            });
        }
        removed
    }

    /// The user's live connection, if any. A handle that is already closing
    /// counts as offline.
    pub async fn lookup(&self, user: &UserId) -> Option<ConnectionHandle> {
        let connections = self.connections.read().await;
        connections.get(user).filter(|h| h.is_live()).cloned()
    }

    pub async fn is_online(&self, user: &UserId) -> bool {
        self.lookup(user).await.is_some()
    }

    pub async fn online_count(&self) -> usize {
        let connections = self.connections.read().await;
        connections.values().filter(|h| h.is_live()).count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }
}
