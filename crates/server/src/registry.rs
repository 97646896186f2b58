//! The session registry: the live mapping from authenticated user to its
//! websocket connection. This is the single source of truth for "is this
//! user currently reachable" and is shared by the socket tasks and all
//! three background loops.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use crewline_core::ServerFrame;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::auth::Identity;

/// What the socket task is asked to put on the wire next.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerFrame),
    /// Websocket-level ping, sent by the liveness monitor.
    Probe,
    /// Close the socket and run the normal teardown path.
    Close,
}

/// One live, authenticated websocket connection. Owned by its socket task;
/// everyone else holds it through the registry and talks to it over the
/// outbound channel, so no caller ever blocks on another connection's I/O.
pub struct Connection {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub role: String,
    alive: AtomicBool,
    joined: StdMutex<HashSet<Uuid>>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    pub fn open(identity: Identity) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            connection_id: Uuid::new_v4(),
            user_id: identity.user_id,
            tenant_id: identity.tenant_id,
            role: identity.role,
            alive: AtomicBool::new(true),
            joined: StdMutex::new(HashSet::new()),
            outbound: tx,
        });
        (connection, rx)
    }

    /// Queue a frame for this connection. `false` means the socket task is
    /// already gone.
    pub fn push(&self, frame: ServerFrame) -> bool {
        self.outbound.send(Outbound::Frame(frame)).is_ok()
    }

    pub fn send_probe(&self) -> bool {
        self.outbound.send(Outbound::Probe).is_ok()
    }

    pub fn request_close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Clear the alive flag, returning whether it was set. The liveness
    /// monitor is the only caller.
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Record a conversation in this connection's local cache.
    pub fn join(&self, conversation_id: Uuid) {
        self.joined
            .lock()
            .expect("joined set lock poisoned")
            .insert(conversation_id);
    }

    #[cfg(test)]
    pub fn has_joined(&self, conversation_id: Uuid) -> bool {
        self.joined
            .lock()
            .expect("joined set lock poisoned")
            .contains(&conversation_id)
    }
}

/// Registry entries are whole-connection replace/delete keyed by user id,
/// so a single map-wide lock is enough.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning the entry it replaced. A newer
    /// connection for the same user always wins.
    pub async fn register(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write().await;
        connections.insert(connection.user_id, connection)
    }

    /// Remove the entry for this connection's user, but only if it is still
    /// the registered one. Returns whether a removal happened, which is the
    /// teardown path's cue to broadcast `offline` exactly once.
    pub async fn remove_if_current(&self, connection: &Arc<Connection>) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(&connection.user_id) {
            Some(current) if current.connection_id == connection.connection_id => {
                connections.remove(&connection.user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, user_id: Uuid) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&user_id).cloned()
    }

    #[cfg(test)]
    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.connections.read().await.contains_key(&user_id)
    }

    /// Queue a frame for a user's live connection, if any.
    pub async fn push_frame(&self, user_id: Uuid, frame: ServerFrame) -> bool {
        match self.get(user_id).await {
            Some(connection) => connection.push(frame),
            None => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn identity(user_id: Uuid) -> Identity {
        Identity {
            user_id,
            tenant_id: Uuid::new_v4(),
            role: "member".into(),
        }
    }

    #[tokio::test]
    async fn register_replaces_prior_entry_for_same_user() {
        let registry = ConnectionRegistry::new();
        let user_id = Uuid::new_v4();

        let (first, _first_rx) = Connection::open(identity(user_id));
        let (second, _second_rx) = Connection::open(identity(user_id));

        assert!(registry.register(first.clone()).await.is_none());
        let replaced = registry
            .register(second.clone())
            .await
            .expect("first entry replaced");
        assert_eq!(replaced.connection_id, first.connection_id);
        assert_eq!(registry.len().await, 1);

        // The stale connection can no longer deregister the user.
        assert!(!registry.remove_if_current(&first).await);
        assert!(registry.is_online(user_id).await);
        assert!(registry.remove_if_current(&second).await);
        assert!(!registry.is_online(user_id).await);
    }

    #[tokio::test]
    async fn push_frame_reaches_only_live_connections() {
        let registry = ConnectionRegistry::new();
        let user_id = Uuid::new_v4();
        let (connection, mut rx) = Connection::open(identity(user_id));
        registry.register(connection).await;

        let frame = ServerFrame::Pong {
            timestamp: Utc::now(),
        };
        assert!(registry.push_frame(user_id, frame.clone()).await);
        assert!(!registry.push_frame(Uuid::new_v4(), frame).await);

        match rx.try_recv() {
            Ok(Outbound::Frame(ServerFrame::Pong { .. })) => {}
            other => panic!("unexpected outbound item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_receiver_fails_the_push() {
        let registry = ConnectionRegistry::new();
        let user_id = Uuid::new_v4();
        let (connection, rx) = Connection::open(identity(user_id));
        registry.register(connection).await;
        drop(rx);

        assert!(
            !registry
                .push_frame(
                    user_id,
                    ServerFrame::Pong {
                        timestamp: Utc::now()
                    }
                )
                .await
        );
    }

    #[test]
    fn joined_cache_is_local_to_the_connection() {
        let (connection, _rx) = Connection::open(identity(Uuid::new_v4()));
        let conversation_id = Uuid::new_v4();

        assert!(!connection.has_joined(conversation_id));
        connection.join(conversation_id);
        assert!(connection.has_joined(conversation_id));
    }
}
