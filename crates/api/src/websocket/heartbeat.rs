//! Heartbeat monitor
//!
//! Periodically evicts connections that stopped sending heartbeats, then
//! purges old server-side connection records. Worst-case detection latency
//! is `interval + timeout`.

use std::sync::Arc;
use std::time::Duration;

use helpline_shared::StorageGateway;
use tokio::task::JoinHandle;

use super::registry::ConnectionRegistry;
use crate::presence::AgentPresence;

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub went_offline: usize,
    pub purged_records: u64,
}

#[derive(Clone)]
pub struct HeartbeatMonitor {
    registry: ConnectionRegistry,
    presence: AgentPresence,
    storage: Arc<dyn StorageGateway>,
    interval: Duration,
    timeout: Duration,
    record_grace: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: ConnectionRegistry,
        presence: AgentPresence,
        storage: Arc<dyn StorageGateway>,
        interval: Duration,
        timeout: Duration,
        record_grace: Duration,
    ) -> Self {
        Self {
            registry,
            presence,
            storage,
            interval,
            timeout,
            record_grace,
        }
    }

    /// Evict every connection silent for longer than the timeout
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for connection_id in self.registry.stale_connections(self.timeout).await {
            // Closed or touched between the scan and now
            let Some(removed) = self
                .registry
                .evict_if_stale(&connection_id, self.timeout)
                .await
            else {
                continue;
            };
            report.evicted += 1;
            tracing::info!(
                connection_id = %connection_id,
                user_id = %removed.info.user_id,
                "Evicted silent connection"
            );
            if let Err(e) = self.storage.close_connection(&connection_id).await {
                tracing::warn!(error = %e, connection_id = %connection_id, "Failed to close connection record");
            }
            if let Some(event) = removed.presence {
                report.went_offline += 1;
                self.presence.handle(event).await;
            }
        }

        let grace = time::Duration::try_from(self.record_grace).unwrap_or(time::Duration::MAX);
        match self.storage.purge_stale_connections(grace).await {
            Ok(purged) => report.purged_records = purged,
            Err(e) => tracing::warn!(error = %e, "Failed to purge stale connection records"),
        }

        if report.evicted > 0 || report.purged_records > 0 {
            tracing::info!(
                evicted = report.evicted,
                went_offline = report.went_offline,
                purged_records = report.purged_records,
                "Heartbeat sweep complete"
            );
        }
        report
    }

    /// Run sweeps on a fixed interval until the handle is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            tracing::info!(
                interval_secs = self.interval.as_secs(),
                timeout_secs = self.timeout.as_secs(),
                "Heartbeat monitor started"
            );

            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::ConnectionMeta;
    use helpline_shared::events::ServerEvent;
    use helpline_shared::{AgentStatus, ConnectionRecord, MemoryStorage, User, UserId, UserRole};
    use tokio::sync::mpsc;

    const INTERVAL: Duration = Duration::from_secs(30);
    const TIMEOUT: Duration = Duration::from_secs(300);

    struct Fixture {
        storage: Arc<MemoryStorage>,
        registry: ConnectionRegistry,
        monitor: HeartbeatMonitor,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .insert_user(User {
                id: UserId(7),
                username: "agent".into(),
                email: "agent@example.com".into(),
                role: UserRole::CustomerService,
            })
            .await;
        let registry = ConnectionRegistry::new();
        let presence = AgentPresence::new(storage.clone(), registry.clone());
        let monitor = HeartbeatMonitor::new(
            registry.clone(),
            presence,
            storage.clone(),
            INTERVAL,
            TIMEOUT,
            Duration::from_secs(120),
        );
        Fixture {
            storage,
            registry,
            monitor,
        }
    }

    async fn connect(
        registry: &ConnectionRegistry,
        user: i64,
        id: &str,
    ) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry
            .register(UserId(user), id.into(), None, ConnectionMeta::default(), tx)
            .await
            .unwrap();
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_evicted_before_timeout() {
        let f = fixture().await;
        let _rx = connect(&f.registry, 1, "a").await;

        tokio::time::advance(TIMEOUT).await;
        assert_eq!(f.monitor.sweep().await.evicted, 0);
        assert!(f.registry.is_online(UserId(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_after_timeout_with_offline_event() {
        let f = fixture().await;
        let _rx = connect(&f.registry, 7, "agent-conn").await;
        f.storage
            .set_agent_status(UserId(7), AgentStatus::Online)
            .await
            .unwrap();

        tokio::time::advance(TIMEOUT + Duration::from_secs(1)).await;
        let report = f.monitor.sweep().await;

        assert_eq!(report.evicted, 1);
        assert_eq!(report.went_offline, 1);
        assert!(!f.registry.is_online(UserId(7)).await);
        assert_eq!(f.storage.agent_status(UserId(7)).await, AgentStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_connection_alive() {
        let f = fixture().await;
        let _rx = connect(&f.registry, 1, "a").await;

        for _ in 0..20 {
            tokio::time::advance(INTERVAL).await;
            f.registry.touch(&"a".into()).await.unwrap();
            assert_eq!(f.monitor.sweep().await.evicted, 0);
        }
        assert!(f.registry.is_online(UserId(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_does_not_block_eviction() {
        let f = fixture().await;
        let _rx = connect(&f.registry, 1, "a").await;
        f.storage.set_unavailable(true);

        tokio::time::advance(TIMEOUT + Duration::from_secs(1)).await;
        let report = f.monitor.sweep().await;
        assert_eq!(report.evicted, 1);
        assert_eq!(report.purged_records, 0);
        assert!(!f.registry.is_online(UserId(1)).await);
    }

    #[tokio::test]
    async fn test_sweep_purges_old_records() {
        let f = fixture().await;
        f.storage
            .record_connection(ConnectionRecord {
                connection_id: "old".into(),
                user_id: UserId(1),
                device_id: None,
                remote_addr: None,
                user_agent: None,
            })
            .await
            .unwrap();
        f.storage
            .backdate_connection(&"old".into(), time::Duration::minutes(3))
            .await;

        assert_eq!(f.monitor.sweep().await.purged_records, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_evicts_within_interval_plus_timeout() {
        let f = fixture().await;
        let _rx = connect(&f.registry, 1, "a").await;
        let handle = f.monitor.clone().spawn();

        tokio::time::sleep(TIMEOUT + INTERVAL + Duration::from_secs(1)).await;
        assert!(!f.registry.is_online(UserId(1)).await);
        handle.abort();
    }
}
