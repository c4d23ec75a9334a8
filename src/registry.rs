//! The process-wide connection registry.
//!
//! Tracks every live websocket on this instance, indexed by user, admin,
//! app and open database, plus the set of connected client ids used to
//! reject a second simultaneous connection from the same client.
//!
//! The registry never touches sockets. Each connection runs its own task
//! and listens on an event channel; the registry routes [`ConnEvent`]s
//! into those channels and cancels connection tasks for bulk closes.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protos::peer::{NotifyTransaction, NotifyUpdatedUser};

/// Identifies one live websocket.
#[derive(
    derive_more::From,
    derive_more::Into,
    derive_more::Display,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// The raw id, as sent in the welcome message.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Who is on the other end of a connection, as established by the outer
/// authentication layer.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// The authenticated user.
    pub user_id: String,
    /// The admin owning the app the user belongs to.
    pub admin_id: String,
    /// The app the user belongs to.
    pub app_id: String,
    /// The logical client, stable across reconnects of one device.
    pub client_id: String,
}

/// Events routed to a connection task.
#[derive(Debug, Clone)]
pub enum ConnEvent {
    /// A transaction committed to a database this connection has open.
    Transaction(Arc<NotifyTransaction>),
    /// The connection's user profile changed.
    UpdatedUser(Arc<NotifyUpdatedUser>),
}

/// A second simultaneous connection from an already-connected client.
#[derive(Debug, thiserror::Error)]
#[error("client already connected")]
pub struct DuplicateClient;

/// Manages all currently connected clients.
#[derive(Debug, Default, Clone)]
pub struct Connections(Arc<Inner>);

#[derive(Debug, Default)]
struct Inner {
    conns: DashMap<ConnectionId, ConnectionHandle>,
    by_user: DashMap<String, HashSet<ConnectionId>>,
    by_admin: DashMap<String, HashSet<ConnectionId>>,
    by_app: DashMap<String, HashSet<ConnectionId>>,
    by_database: DashMap<String, HashSet<ConnectionId>>,
    /// Client ids with a live connection, each owned by exactly one.
    unique_clients: DashMap<String, ConnectionId>,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct ConnectionHandle {
    identity: ClientIdentity,
    open_databases: HashSet<String>,
    events: mpsc::Sender<ConnEvent>,
    cancel: CancellationToken,
}

impl Connections {
    /// Register a new connection.
    ///
    /// Fails when the client id already has a live connection; the caller
    /// closes the new socket with the dedicated status code, the existing
    /// connection stays untouched.
    pub fn register(
        &self,
        identity: ClientIdentity,
        events: mpsc::Sender<ConnEvent>,
        cancel: CancellationToken,
    ) -> Result<ConnectionId, DuplicateClient> {
        let id = ConnectionId(self.0.next_id.fetch_add(1, Ordering::Relaxed));
        match self.0.unique_clients.entry(identity.client_id.clone()) {
            Entry::Occupied(_) => {
                warn!(
                    "User {} attempted to open multiple socket connections from client {}",
                    identity.user_id, identity.client_id
                );
                return Err(DuplicateClient);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(id);
            }
        }
        self.0
            .by_user
            .entry(identity.user_id.clone())
            .or_default()
            .insert(id);
        self.0
            .by_admin
            .entry(identity.admin_id.clone())
            .or_default()
            .insert(id);
        self.0
            .by_app
            .entry(identity.app_id.clone())
            .or_default()
            .insert(id);
        info!("Websocket {id} connected from user {}", identity.user_id);
        self.0.conns.insert(
            id,
            ConnectionHandle {
                identity,
                open_databases: HashSet::new(),
                events,
                cancel,
            },
        );
        Ok(id)
    }

    /// Remove a connection from every index.
    pub fn close(&self, id: ConnectionId) {
        let Some((_, handle)) = self.0.conns.remove(&id) else {
            return;
        };
        let identity = &handle.identity;
        self.0
            .unique_clients
            .remove_if(&identity.client_id, |_, held| *held == id);
        unindex(&self.0.by_user, &identity.user_id, id);
        unindex(&self.0.by_admin, &identity.admin_id, id);
        unindex(&self.0.by_app, &identity.app_id, id);
        for database_id in &handle.open_databases {
            unindex(&self.0.by_database, database_id, id);
        }
        debug!(connection_id = %id, "connection unregistered");
    }

    /// Index a connection under a database it opened.
    pub fn open_database(&self, id: ConnectionId, database_id: &str) {
        let Some(mut handle) = self.0.conns.get_mut(&id) else {
            return;
        };
        let newly_opened = handle.open_databases.insert(database_id.to_owned());
        drop(handle);
        if newly_opened {
            self.0
                .by_database
                .entry(database_id.to_owned())
                .or_default()
                .insert(id);
        }
    }

    /// Route a committed transaction to every connection watching its
    /// database. Returns how many connections it reached.
    ///
    /// A connection whose channel is full misses the event; the periodic
    /// resync on its ping tick catches it up.
    pub fn push_transaction(&self, notification: Arc<NotifyTransaction>) -> usize {
        self.route(
            &self.0.by_database,
            &notification.transaction.database_id.clone(),
            ConnEvent::Transaction(notification),
        )
    }

    /// Route a user profile change to every connection of that user.
    pub fn push_updated_user(&self, notification: Arc<NotifyUpdatedUser>) -> usize {
        self.route(
            &self.0.by_user,
            &notification.user_id.clone(),
            ConnEvent::UpdatedUser(notification),
        )
    }

    fn route(
        &self,
        index: &DashMap<String, HashSet<ConnectionId>>,
        key: &str,
        event: ConnEvent,
    ) -> usize {
        let ids = {
            let Some(set) = index.get(key) else { return 0 };
            set.iter().copied().collect::<Vec<_>>()
        };
        let mut reached = 0;
        for id in ids {
            let Some(conn) = self.0.conns.get(&id) else {
                continue;
            };
            match conn.events.try_send(event.clone()) {
                Ok(()) => reached += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(connection_id = %id, "connection too busy, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connection_id = %id, "connection gone, dropping event");
                }
            }
        }
        reached
    }

    /// Cancel every connection of a user. Used when the account goes away.
    pub fn close_for_user(&self, user_id: &str) -> usize {
        self.cancel_all(&self.0.by_user, user_id)
    }

    /// Cancel every connection under an admin.
    pub fn close_for_admin(&self, admin_id: &str) -> usize {
        self.cancel_all(&self.0.by_admin, admin_id)
    }

    /// Cancel every connection of an app.
    pub fn close_for_app(&self, app_id: &str) -> usize {
        self.cancel_all(&self.0.by_app, app_id)
    }

    fn cancel_all(&self, index: &DashMap<String, HashSet<ConnectionId>>, key: &str) -> usize {
        let ids = {
            let Some(set) = index.get(key) else { return 0 };
            set.iter().copied().collect::<Vec<_>>()
        };
        for id in &ids {
            if let Some(conn) = self.0.conns.get(id) {
                conn.cancel.cancel();
            }
        }
        ids.len()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.0.conns.len()
    }

    /// Whether no connection is live.
    pub fn is_empty(&self) -> bool {
        self.0.conns.is_empty()
    }
}

fn unindex(index: &DashMap<String, HashSet<ConnectionId>>, key: &str, id: ConnectionId) {
    let Some(mut ids) = index.get_mut(key) else {
        return;
    };
    ids.remove(&id);
    let emptied = ids.is_empty();
    drop(ids);
    if emptied {
        index.remove_if(key, |_, ids| ids.is_empty());
    }
}
