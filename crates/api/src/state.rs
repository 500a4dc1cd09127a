//! Shared application state

use std::sync::Arc;

use helpline_shared::StorageGateway;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::delivery::retry::RetryPolicy;
use crate::delivery::MessageDeliveryCoordinator;
use crate::presence::AgentPresence;
use crate::session_router::SessionRouter;
use crate::websocket::heartbeat::HeartbeatMonitor;
use crate::websocket::registry::ConnectionRegistry;

/// State handed to every axum handler and socket task
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<dyn StorageGateway>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub registry: ConnectionRegistry,
    pub presence: AgentPresence,
    pub delivery: MessageDeliveryCoordinator,
    pub router: SessionRouter,
}

impl AppState {
    pub fn new(
        config: Config,
        storage: Arc<dyn StorageGateway>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        let presence = AgentPresence::new(storage.clone(), registry.clone());
        let delivery = MessageDeliveryCoordinator::new(
            storage.clone(),
            registry.clone(),
            config.recall_window,
            RetryPolicy {
                attempts: config.status_retry_attempts,
                delay: config.status_retry_delay,
            },
        );
        let router = SessionRouter::new(
            storage.clone(),
            registry.clone(),
            presence.clone(),
            delivery.clone(),
        );

        Self {
            config: Arc::new(config),
            storage,
            verifier,
            registry,
            presence,
            delivery,
            router,
        }
    }

    pub fn heartbeat_monitor(&self) -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            self.registry.clone(),
            self.presence.clone(),
            self.storage.clone(),
            self.config.heartbeat_interval,
            self.config.heartbeat_timeout,
            self.config.stale_connection_grace,
        )
    }
}
