use crate::types::LedgerEvent;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// One live socket.
pub struct Connection {
    pub user_id: String,
    /// Only this user's events reach an admin subscriber when set.
    pub watch: Option<String>,
    pub tx: mpsc::UnboundedSender<String>,
}

/// Live sockets keyed by user, plus the admin trade-feed channel.
///
/// Owned by the application state; sockets register on connect and must
/// unregister on disconnect.
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, Connection>,
    /// user id -> connection ids
    users: DashMap<String, HashSet<Uuid>>,
    admins: DashSet<Uuid>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a socket for `user_id`.
    pub fn register(&self, user_id: &str, tx: mpsc::UnboundedSender<String>) -> Uuid {
        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            Connection {
                user_id: user_id.to_string(),
                watch: None,
                tx,
            },
        );
        self.users.entry(user_id.to_string()).or_default().insert(id);
        debug!("Registered connection {} for {}", id, user_id);
        id
    }

    /// Drop a socket from the user index and the admin channel.
    pub fn unregister(&self, id: Uuid) {
        self.admins.remove(&id);
        if let Some((_, conn)) = self.connections.remove(&id) {
            let now_empty = match self.users.get_mut(&conn.user_id) {
                Some(mut ids) => {
                    ids.remove(&id);
                    ids.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.users.remove_if(&conn.user_id, |_, ids| ids.is_empty());
            }
            debug!("Unregistered connection {}", id);
        }
    }

    /// Join the admin channel, optionally watching a single user.
    pub fn subscribe_admin(&self, id: Uuid, watch: Option<String>) -> bool {
        match self.connections.get_mut(&id) {
            Some(mut conn) => {
                conn.watch = watch;
                self.admins.insert(id);
                true
            }
            None => false,
        }
    }

    /// Send to one connection.
    pub fn send_to(&self, id: Uuid, event: &LedgerEvent) -> bool {
        let Ok(json) = serde_json::to_string(event) else {
            return false;
        };
        self.connections
            .get(&id)
            .map(|c| c.tx.send(json).is_ok())
            .unwrap_or(false)
    }

    /// Send to every socket the user has open. Returns the number reached.
    pub fn send_to_user(&self, user_id: &str, event: &LedgerEvent) -> usize {
        let Ok(json) = serde_json::to_string(event) else {
            return 0;
        };
        let ids: Vec<Uuid> = self
            .users
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        ids.iter()
            .filter_map(|id| self.connections.get(id))
            .filter(|c| c.tx.send(json.clone()).is_ok())
            .count()
    }

    /// Send to admin subscribers whose watch filter matches.
    pub fn broadcast_admin(&self, event: &LedgerEvent) -> usize {
        let Ok(json) = serde_json::to_string(event) else {
            return 0;
        };
        let ids: Vec<Uuid> = self.admins.iter().map(|id| *id).collect();

        ids.iter()
            .filter_map(|id| self.connections.get(id))
            .filter(|c| match (&c.watch, event.user_id()) {
                (Some(watched), Some(owner)) => watched == owner,
                _ => true,
            })
            .filter(|c| c.tx.send(json.clone()).is_ok())
            .count()
    }

    /// Deliver a settlement event to its owner and the admin channel.
    pub fn publish(&self, event: &LedgerEvent) {
        if let Some(user_id) = event.user_id() {
            self.send_to_user(user_id, event);
        }
        self.broadcast_admin(event);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn admin_count(&self) -> usize {
        self.admins.len()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.users.get(user_id).is_some_and(|ids| !ids.is_empty())
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self {
            connections: DashMap::new(),
            users: DashMap::new(),
            admins: DashSet::new(),
        }
    }
}
