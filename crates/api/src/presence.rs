//! Agent presence side effects
//!
//! The registry decides when a user goes offline or comes back; this module
//! applies what that means for agents (stored status, `agent_status_changed`
//! fan-out). An agent that drops and reconnects gets the status it last chose.

use std::collections::HashMap;
use std::sync::Arc;

use helpline_shared::events::ServerEvent;
use helpline_shared::{AgentStatus, StorageGateway, UserId};
use tokio::sync::RwLock;

use crate::error::{ApiError, ApiResult};
use crate::websocket::registry::{ConnectionRegistry, PresenceEvent};

#[derive(Clone)]
pub struct AgentPresence {
    storage: Arc<dyn StorageGateway>,
    registry: ConnectionRegistry,
    /// Status each agent last chose, restored when they reconnect
    chosen: Arc<RwLock<HashMap<UserId, AgentStatus>>>,
}

impl AgentPresence {
    pub fn new(storage: Arc<dyn StorageGateway>, registry: ConnectionRegistry) -> Self {
        Self {
            storage,
            registry,
            chosen: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Explicit status change requested by an agent
    pub async fn set_status(&self, agent_id: UserId, status: AgentStatus) -> ApiResult<()> {
        let user = self
            .storage
            .get_user(agent_id)
            .await?
            .ok_or(ApiError::NotFound("user"))?;
        if !user.role.is_agent() {
            return Err(ApiError::Forbidden);
        }

        self.storage.set_agent_status(agent_id, status).await?;
        self.chosen.write().await.insert(agent_id, status);
        let notified = self
            .notify_online_agents(&ServerEvent::AgentStatusChanged { agent_id, status })
            .await;

        tracing::info!(agent_id = %agent_id, status = %status, notified, "Agent status updated");
        Ok(())
    }

    pub async fn handle(&self, event: PresenceEvent) {
        match event {
            PresenceEvent::UserCameOnline(user_id) => self.on_user_online(user_id).await,
            PresenceEvent::UserWentOffline(user_id) => self.on_user_offline(user_id).await,
        }
    }

    /// First connection of a user registered. An agent whose last chosen
    /// status was not offline gets it back.
    async fn on_user_online(&self, user_id: UserId) {
        let Some(status) = self.chosen.read().await.get(&user_id).copied() else {
            return;
        };
        if status == AgentStatus::Offline || !self.registry.is_online(user_id).await {
            return;
        }

        if let Err(e) = self.storage.set_agent_status(user_id, status).await {
            tracing::warn!(error = %e, agent_id = %user_id, "Failed to restore agent status");
            return;
        }
        self.notify_online_agents(&ServerEvent::AgentStatusChanged {
            agent_id: user_id,
            status,
        })
        .await;
        tracing::info!(agent_id = %user_id, status = %status, "Agent back online, status restored");
    }

    /// Last connection of a user closed. Agents are marked offline; failures are logged only.
    async fn on_user_offline(&self, user_id: UserId) {
        let user = match self.storage.get_user(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, user_id = %user_id, "Could not load user for offline handling");
                return;
            }
        };
        if !user.role.is_agent() {
            tracing::debug!(user_id = %user_id, "User went offline");
            return;
        }
        // Re-registered while the storage lookup ran
        if self.registry.is_online(user_id).await {
            tracing::debug!(agent_id = %user_id, "Agent reconnected before going offline");
            return;
        }

        if let Err(e) = self.storage.set_agent_status(user_id, AgentStatus::Offline).await {
            tracing::warn!(error = %e, agent_id = %user_id, "Failed to mark agent offline");
        }
        self.notify_online_agents(&ServerEvent::AgentStatusChanged {
            agent_id: user_id,
            status: AgentStatus::Offline,
        })
        .await;
        tracing::info!(agent_id = %user_id, "Agent went offline");
    }

    /// Push an event to every listed agent that is currently connected
    pub async fn notify_online_agents(&self, event: &ServerEvent) -> usize {
        let agents = match self.storage.list_online_agents().await {
            Ok(agents) => agents,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list online agents for notification");
                return 0;
            }
        };

        let mut delivered = 0;
        for agent in agents {
            delivered += self.registry.broadcast(agent.id, event).await;
        }
        delivered
    }
}
