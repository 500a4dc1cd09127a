//! Connection registry
//!
//! In-memory, bidirectional map between users and their live connections.
//! This is the single source of truth for presence: a user is online iff
//! they own at least one registered connection.
//!
//! All state sits behind one lock. Callers never see the maps, and the lock
//! is never held across an await on I/O.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use helpline_shared::events::ServerEvent;
use helpline_shared::{ConnectionId, UserId};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use super::connection::{Connection, ConnectionInfo, ConnectionMeta};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Connection {0} is registered to another user")]
    AlreadyExists(ConnectionId),
    #[error("Connection {0} is not registered")]
    NotFound(ConnectionId),
}

/// Presence transitions produced by registry mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEvent {
    /// The user's first connection registered
    UserCameOnline(UserId),
    /// The user's last connection closed
    UserWentOffline(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// The connection id was already registered to this user and got updated in place
    pub refreshed: bool,
    /// The user had no connections before this call
    pub came_online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistered {
    pub info: ConnectionInfo,
    pub presence: Option<PresenceEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub connections: usize,
    pub online_users: usize,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Connection>,
    /// Per-user room: every connection the user currently owns
    rooms: HashMap<UserId, HashSet<ConnectionId>>,
}

impl RegistryInner {
    fn remove(&mut self, connection_id: &ConnectionId) -> Option<Unregistered> {
        let conn = self.connections.remove(connection_id)?;
        let mut presence = None;
        if let Some(room) = self.rooms.get_mut(&conn.user_id) {
            room.remove(connection_id);
            if room.is_empty() {
                self.rooms.remove(&conn.user_id);
                presence = Some(PresenceEvent::UserWentOffline(conn.user_id));
            }
        }
        Some(Unregistered {
            info: conn.info(),
            presence,
        })
    }
}

/// Shared registry handle
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `user_id`.
    ///
    /// Re-registering an id the same user already owns updates it in place
    /// (new sender, device and meta, fresh heartbeat). An id owned by a
    /// different user is rejected.
    pub async fn register(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        device_id: Option<String>,
        meta: ConnectionMeta,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<Registration, RegistryError> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.connections.get_mut(&connection_id) {
            if existing.user_id != user_id {
                tracing::warn!(
                    connection_id = %connection_id,
                    owner = %existing.user_id,
                    claimed_by = %user_id,
                    "Connection id already registered to another user"
                );
                return Err(RegistryError::AlreadyExists(connection_id));
            }
            existing.sender = sender;
            existing.device_id = device_id;
            existing.meta = meta;
            existing.last_heartbeat = Instant::now();
            tracing::debug!(connection_id = %connection_id, user_id = %user_id, "Connection re-registered");
            return Ok(Registration {
                refreshed: true,
                came_online: false,
            });
        }

        let conn = Connection::new(connection_id.clone(), user_id, device_id, meta, sender);
        inner.connections.insert(connection_id.clone(), conn);
        let room = inner.rooms.entry(user_id).or_default();
        let came_online = room.is_empty();
        room.insert(connection_id.clone());

        tracing::info!(
            connection_id = %connection_id,
            user_id = %user_id,
            total_connections = inner.connections.len(),
            "Connection registered"
        );

        Ok(Registration {
            refreshed: false,
            came_online,
        })
    }

    /// Remove a connection. Reports `UserWentOffline` when it was the user's last one.
    pub async fn unregister(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Unregistered, RegistryError> {
        let mut inner = self.inner.write().await;
        let removed = inner
            .remove(connection_id)
            .ok_or_else(|| RegistryError::NotFound(connection_id.clone()))?;

        tracing::info!(
            connection_id = %connection_id,
            user_id = %removed.info.user_id,
            remaining_connections = inner.connections.len(),
            went_offline = removed.presence.is_some(),
            "Connection unregistered"
        );
        Ok(removed)
    }

    /// Remove a connection only if it is still bound to `sender`.
    ///
    /// Used when a socket closes: if the client already re-registered the
    /// same id over a new socket, the newer registration is left alone.
    pub async fn release(
        &self,
        connection_id: &ConnectionId,
        sender: &mpsc::UnboundedSender<ServerEvent>,
    ) -> Option<Unregistered> {
        let mut inner = self.inner.write().await;
        let owned = inner
            .connections
            .get(connection_id)
            .is_some_and(|conn| conn.sender.same_channel(sender));
        if !owned {
            return None;
        }
        let removed = inner.remove(connection_id);
        if let Some(removed) = &removed {
            tracing::info!(
                connection_id = %connection_id,
                user_id = %removed.info.user_id,
                "Connection released on socket close"
            );
        }
        removed
    }

    /// Refresh the heartbeat. `NotFound` means the caller must re-register.
    pub async fn touch(&self, connection_id: &ConnectionId) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        let conn = inner
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RegistryError::NotFound(connection_id.clone()))?;
        conn.last_heartbeat = Instant::now();
        Ok(())
    }

    pub async fn list_connections(&self, user_id: UserId) -> Vec<ConnectionInfo> {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(&user_id)
            .map(|room| {
                room.iter()
                    .filter_map(|id| inner.connections.get(id))
                    .map(Connection::info)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        let inner = self.inner.read().await;
        inner.rooms.get(&user_id).is_some_and(|room| !room.is_empty())
    }

    /// Send `event` to every connection of `user_id`. Returns how many accepted it;
    /// zero means the user is offline, which is not an error.
    pub async fn broadcast(&self, user_id: UserId, event: &ServerEvent) -> usize {
        self.broadcast_except(user_id, None, event).await
    }

    /// Like [`broadcast`](Self::broadcast) but skips one connection (the originating device)
    pub async fn broadcast_except(
        &self,
        user_id: UserId,
        except: Option<&ConnectionId>,
        event: &ServerEvent,
    ) -> usize {
        let inner = self.inner.read().await;
        let Some(room) = inner.rooms.get(&user_id) else {
            return 0;
        };

        let mut delivered = 0;
        for connection_id in room {
            if Some(connection_id) == except {
                continue;
            }
            let Some(conn) = inner.connections.get(connection_id) else {
                continue;
            };
            match conn.send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::debug!(
                    connection_id = %connection_id,
                    user_id = %user_id,
                    "Dropped event for closed connection"
                ),
            }
        }
        delivered
    }

    /// Connections whose last heartbeat is more than `timeout` ago
    pub async fn stale_connections(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        inner
            .connections
            .values()
            .filter(|conn| conn.is_silent_for(timeout, now))
            .map(|conn| conn.id.clone())
            .collect()
    }

    /// Remove a connection only if it is still silent for longer than `timeout`.
    /// A heartbeat that lands after the stale scan keeps it registered.
    pub async fn evict_if_stale(
        &self,
        connection_id: &ConnectionId,
        timeout: Duration,
    ) -> Option<Unregistered> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let silent = inner
            .connections
            .get(connection_id)
            .is_some_and(|conn| conn.is_silent_for(timeout, now));
        if !silent {
            return None;
        }
        inner.remove(connection_id)
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        RegistryStats {
            connections: inner.connections.len(),
            online_users: inner.rooms.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (
        mpsc::UnboundedSender<ServerEvent>,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    fn ping() -> ServerEvent {
        ServerEvent::Error {
            code: "PING".into(),
            message: "ping".into(),
        }
    }

    async fn register(
        registry: &ConnectionRegistry,
        user: i64,
        id: &str,
    ) -> (Registration, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = channel();
        let reg = registry
            .register(UserId(user), id.into(), None, ConnectionMeta::default(), tx)
            .await
            .unwrap();
        (reg, rx)
    }

    #[tokio::test]
    async fn test_online_iff_connections_exist() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.is_online(UserId(1)).await);

        let (first, _rx1) = register(&registry, 1, "a").await;
        let (second, _rx2) = register(&registry, 1, "b").await;
        assert!(first.came_online);
        assert!(!second.came_online);
        assert!(registry.is_online(UserId(1)).await);
        assert_eq!(registry.list_connections(UserId(1)).await.len(), 2);

        let removed = registry.unregister(&"a".into()).await.unwrap();
        assert_eq!(removed.presence, None);
        assert!(registry.is_online(UserId(1)).await);

        let removed = registry.unregister(&"b".into()).await.unwrap();
        assert_eq!(removed.presence, Some(PresenceEvent::UserWentOffline(UserId(1))));
        assert!(!registry.is_online(UserId(1)).await);
        assert!(registry.list_connections(UserId(1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_offline_emitted_exactly_once() {
        let registry = ConnectionRegistry::new();
        let (_, _rx) = register(&registry, 1, "a").await;

        assert!(registry.unregister(&"a".into()).await.unwrap().presence.is_some());
        assert_eq!(
            registry.unregister(&"a".into()).await,
            Err(RegistryError::NotFound("a".into()))
        );
    }

    #[tokio::test]
    async fn test_reregister_same_user_updates_in_place() {
        let registry = ConnectionRegistry::new();
        let (_, mut old_rx) = register(&registry, 1, "a").await;
        let (again, mut new_rx) = register(&registry, 1, "a").await;

        assert!(again.refreshed);
        assert!(!again.came_online);
        assert_eq!(registry.stats().await.connections, 1);

        assert_eq!(registry.broadcast(UserId(1), &ping()).await, 1);
        assert!(new_rx.try_recv().is_ok());
        assert!(old_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reregister_other_user_conflicts() {
        let registry = ConnectionRegistry::new();
        let (_, _rx) = register(&registry, 1, "a").await;

        let (tx, _rx2) = channel();
        let result = registry
            .register(UserId(2), "a".into(), None, ConnectionMeta::default(), tx)
            .await;
        assert_eq!(result, Err(RegistryError::AlreadyExists("a".into())));
        assert_eq!(registry.list_connections(UserId(1)).await.len(), 1);
        assert!(!registry.is_online(UserId(2)).await);
    }

    #[tokio::test]
    async fn test_broadcast_counts_and_except() {
        let registry = ConnectionRegistry::new();
        let (_, mut rx_a) = register(&registry, 1, "a").await;
        let (_, mut rx_b) = register(&registry, 1, "b").await;

        assert_eq!(registry.broadcast(UserId(2), &ping()).await, 0);
        assert_eq!(registry.broadcast(UserId(1), &ping()).await, 2);
        assert_eq!(
            registry
                .broadcast_except(UserId(1), Some(&"a".into()), &ping())
                .await,
            1
        );

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_channels() {
        let registry = ConnectionRegistry::new();
        let (_, rx_a) = register(&registry, 1, "a").await;
        let (_, _rx_b) = register(&registry, 1, "b").await;
        drop(rx_a);
        assert_eq!(registry.broadcast(UserId(1), &ping()).await, 1);
    }

    #[tokio::test]
    async fn test_touch_unknown_requires_reconnect() {
        let registry = ConnectionRegistry::new();
        assert_eq!(
            registry.touch(&"ghost".into()).await,
            Err(RegistryError::NotFound("ghost".into()))
        );
    }

    #[tokio::test]
    async fn test_release_ignores_newer_socket() {
        let registry = ConnectionRegistry::new();
        let (old_tx, _old_rx) = channel();
        registry
            .register(UserId(1), "a".into(), None, ConnectionMeta::default(), old_tx.clone())
            .await
            .unwrap();
        let (_, _new_rx) = register(&registry, 1, "a").await;

        assert!(registry.release(&"a".into(), &old_tx).await.is_none());
        assert!(registry.is_online(UserId(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_connections() {
        let registry = ConnectionRegistry::new();
        let (_, _rx_a) = register(&registry, 1, "a").await;
        tokio::time::advance(Duration::from_secs(200)).await;
        let (_, _rx_b) = register(&registry, 2, "b").await;
        tokio::time::advance(Duration::from_secs(101)).await;

        let stale = registry.stale_connections(Duration::from_secs(300)).await;
        assert_eq!(stale, vec![ConnectionId::from("a")]);

        registry.touch(&"a".into()).await.unwrap();
        assert!(registry
            .stale_connections(Duration::from_secs(300))
            .await
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_if_stale_spares_touched_connection() {
        let registry = ConnectionRegistry::new();
        let (_, _rx_a) = register(&registry, 1, "a").await;
        let (_, _rx_b) = register(&registry, 1, "b").await;
        tokio::time::advance(Duration::from_secs(301)).await;

        let timeout = Duration::from_secs(300);
        assert_eq!(registry.stale_connections(timeout).await.len(), 2);
        registry.touch(&"a".into()).await.unwrap();

        assert!(registry.evict_if_stale(&"a".into(), timeout).await.is_none());
        let evicted = registry.evict_if_stale(&"b".into(), timeout).await.unwrap();
        assert_eq!(evicted.info.id, ConnectionId::from("b"));
        assert_eq!(evicted.presence, None);
        assert!(registry.evict_if_stale(&"b".into(), timeout).await.is_none());
        assert!(registry.is_online(UserId(1)).await);
    }

    #[tokio::test]
    async fn test_concurrent_registrations_stay_consistent() {
        let registry = ConnectionRegistry::new();
        let mut handles = Vec::new();
        let mut receivers = Vec::new();
        for i in 0..50 {
            let registry = registry.clone();
            let (tx, rx) = channel();
            receivers.push(rx);
            handles.push(tokio::spawn(async move {
                registry
                    .register(
                        UserId(i % 5),
                        format!("conn-{}", i).into(),
                        None,
                        ConnectionMeta::default(),
                        tx,
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stats = registry.stats().await;
        assert_eq!(stats.connections, 50);
        assert_eq!(stats.online_users, 5);
        for user in 0..5 {
            assert_eq!(registry.list_connections(UserId(user)).await.len(), 10);
        }
    }
}
