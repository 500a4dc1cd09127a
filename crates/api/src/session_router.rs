//! Session routing
//!
//! Sessions move `pending -> active -> closed`. Matching recommends the
//! least-loaded connected agent but always leaves the session pending;
//! an agent takes it with an explicit, race-free accept.

use std::sync::Arc;

use helpline_shared::events::{PendingSessionSummary, ServerEvent};
use helpline_shared::{BodyType, SessionId, SessionStatus, StorageGateway, UserId};

use crate::delivery::{MessageDeliveryCoordinator, SendRequest};
use crate::error::{ApiError, ApiResult};
use crate::presence::AgentPresence;
use crate::websocket::registry::ConnectionRegistry;

/// First message the end-user sees once an agent accepts
pub const AGENT_GREETING: &str = "Hello, an agent is now assisting you. How can I help?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOutcome {
    pub matched: bool,
    pub agent_id: Option<UserId>,
}

/// Agent with the fewest active sessions; ties go to the earliest candidate
pub fn pick_least_loaded(candidates: &[(UserId, i64)]) -> Option<UserId> {
    let mut best: Option<(UserId, i64)> = None;
    for &(agent_id, load) in candidates {
        match best {
            Some((_, best_load)) if load >= best_load => {}
            _ => best = Some((agent_id, load)),
        }
    }
    best.map(|(agent_id, _)| agent_id)
}

#[derive(Clone)]
pub struct SessionRouter {
    storage: Arc<dyn StorageGateway>,
    registry: ConnectionRegistry,
    presence: AgentPresence,
    delivery: MessageDeliveryCoordinator,
}

impl SessionRouter {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        registry: ConnectionRegistry,
        presence: AgentPresence,
        delivery: MessageDeliveryCoordinator,
    ) -> Self {
        Self {
            storage,
            registry,
            presence,
            delivery,
        }
    }

    /// Queue the session and recommend an agent if one is connected
    pub async fn request_match(
        &self,
        session_id: &SessionId,
        user_id: UserId,
    ) -> ApiResult<MatchOutcome> {
        self.storage
            .get_user(user_id)
            .await?
            .ok_or(ApiError::NotFound("user"))?;

        if !self.storage.create_pending_session(session_id, user_id).await? {
            let session = self
                .storage
                .get_session(session_id)
                .await?
                .ok_or(ApiError::NotFound("session"))?;
            if session.user_id != user_id {
                return Err(ApiError::Forbidden);
            }
            match session.status {
                SessionStatus::Active => {
                    return Ok(MatchOutcome {
                        matched: true,
                        agent_id: session.agent_id,
                    })
                }
                SessionStatus::Closed => return Err(ApiError::SessionUnavailable),
                SessionStatus::Pending => {}
            }
        }

        let mut candidates = Vec::new();
        for agent in self.storage.list_online_agents().await? {
            if !self.registry.is_online(agent.id).await {
                continue;
            }
            let load = self.storage.count_agent_sessions(agent.id).await?;
            candidates.push((agent.id, load));
        }
        let suggested = pick_least_loaded(&candidates);

        let notified = self
            .presence
            .notify_online_agents(&ServerEvent::NewPendingSession {
                session_id: session_id.clone(),
                user_id,
                suggested_agent_id: suggested,
            })
            .await;

        tracing::info!(
            session_id = %session_id,
            user_id = %user_id,
            candidates = candidates.len(),
            suggested_agent = ?suggested,
            notified,
            "Session queued for matching"
        );

        Ok(MatchOutcome {
            matched: suggested.is_some(),
            agent_id: suggested,
        })
    }

    /// Assign a pending session to `agent_id`. Exactly one concurrent accept wins.
    pub async fn accept(&self, session_id: &SessionId, agent_id: UserId) -> ApiResult<()> {
        let agent = self
            .storage
            .get_user(agent_id)
            .await?
            .ok_or(ApiError::NotFound("agent"))?;
        if !agent.role.is_agent() {
            return Err(ApiError::Forbidden);
        }

        if !self
            .storage
            .compare_and_assign_session(session_id, agent_id)
            .await?
        {
            let session = self
                .storage
                .get_session(session_id)
                .await?
                .ok_or(ApiError::NotFound("session"))?;
            return match session.status {
                SessionStatus::Closed => Err(ApiError::SessionUnavailable),
                SessionStatus::Active if session.agent_id == Some(agent_id) => Ok(()),
                _ => {
                    tracing::info!(
                        session_id = %session_id,
                        agent_id = %agent_id,
                        assigned_to = ?session.agent_id,
                        "Accept lost the race"
                    );
                    Err(ApiError::AlreadyAssigned)
                }
            };
        }

        let session = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or(ApiError::NotFound("session"))?;
        tracing::info!(session_id = %session_id, agent_id = %agent_id, user_id = %session.user_id, "Session accepted");

        if let Err(e) = self
            .delivery
            .send(SendRequest {
                session_id: session_id.clone(),
                sender_id: agent_id,
                recipient_id: Some(session.user_id),
                body: AGENT_GREETING.to_string(),
                body_type: BodyType::Text,
                role: agent.role,
                reply_to_id: None,
                origin: None,
            })
            .await
        {
            tracing::warn!(error = %e, session_id = %session_id, "Failed to send greeting");
        }

        self.registry
            .broadcast(
                session.user_id,
                &ServerEvent::SessionAcceptedForUser {
                    session_id: session_id.clone(),
                    user_id: session.user_id,
                    agent_id,
                    agent_name: agent.username,
                },
            )
            .await;
        self.presence
            .notify_online_agents(&ServerEvent::PendingSessionAccepted {
                session_id: session_id.clone(),
                agent_id,
            })
            .await;

        Ok(())
    }

    /// Sessions still waiting for an agent, oldest first. Agents only.
    pub async fn pending_sessions(&self, agent_id: UserId) -> ApiResult<Vec<PendingSessionSummary>> {
        let agent = self
            .storage
            .get_user(agent_id)
            .await?
            .ok_or(ApiError::NotFound("user"))?;
        if !agent.role.is_agent() {
            return Err(ApiError::Forbidden);
        }

        let pending: Vec<PendingSessionSummary> = self
            .storage
            .list_pending_sessions()
            .await?
            .into_iter()
            .map(|session| PendingSessionSummary {
                session_id: session.session_id,
                user_id: session.user_id,
                created_at: session.created_at,
            })
            .collect();
        tracing::debug!(agent_id = %agent_id, count = pending.len(), "Pending sessions listed");
        Ok(pending)
    }

    /// Close a session. Terminal and idempotent; only participants may close.
    pub async fn close(&self, session_id: &SessionId, by_user: UserId) -> ApiResult<()> {
        let session = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or(ApiError::NotFound("session"))?;
        if !session.is_participant(by_user) {
            return Err(ApiError::Forbidden);
        }

        if !self.storage.close_session(session_id).await? {
            return Ok(());
        }

        let event = ServerEvent::SessionStatusUpdated {
            session_id: session_id.clone(),
            status: SessionStatus::Closed,
            changed_by: Some(by_user),
        };
        self.registry.broadcast(session.user_id, &event).await;
        if let Some(agent_id) = session.agent_id {
            self.registry.broadcast(agent_id, &event).await;
        }

        tracing::info!(session_id = %session_id, closed_by = %by_user, "Session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_least_loaded() {
        assert_eq!(pick_least_loaded(&[]), None);
        assert_eq!(
            pick_least_loaded(&[(UserId(1), 3), (UserId(2), 1), (UserId(3), 2)]),
            Some(UserId(2))
        );
    }

    #[test]
    fn test_pick_least_loaded_tie_goes_to_first() {
        assert_eq!(
            pick_least_loaded(&[(UserId(5), 2), (UserId(3), 1), (UserId(4), 1)]),
            Some(UserId(3))
        );
    }
}
