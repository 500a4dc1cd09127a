//! Message delivery coordinator
//!
//! The only path that creates, fans out or mutates messages:
//! - `send`: validate, persist, push to the recipient and the sender's other devices
//! - `recall`: owner-only, time-boxed retraction
//! - `mark_status`: forward-only sent -> delivered -> read
//! - `history`: participant view with reply previews and recalled bodies masked

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use helpline_shared::events::{MessagePayload, ReplyPreview, ServerEvent};
use helpline_shared::{
    BodyType, ChatSession, ConnectionId, Message, MessageId, MessageStatus, NewMessage,
    SessionId, SessionStatus, StorageError, StorageGateway, UserId, UserRole,
};
use time::OffsetDateTime;

use crate::error::{ApiError, ApiResult};
use crate::websocket::registry::ConnectionRegistry;

pub mod retry;

use retry::{with_bounded_retry, RetryPolicy};

/// Body shown in place of a recalled message
pub const RECALLED_PLACEHOLDER: &str = "this message was recalled";

/// How many recent messages the recipient fallback inspects
const RECIPIENT_SCAN_DEPTH: u32 = 10;

const DEFAULT_HISTORY_LIMIT: u32 = 50;
const MAX_HISTORY_LIMIT: u32 = 200;

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub session_id: SessionId,
    pub sender_id: UserId,
    pub recipient_id: Option<UserId>,
    pub body: String,
    pub body_type: BodyType,
    /// Role the sender claims to act in
    pub role: UserRole,
    pub reply_to_id: Option<MessageId>,
    /// Connection the request arrived on; excluded from the self-echo
    pub origin: Option<ConnectionId>,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    /// Recipient connections that accepted the push; zero means offline
    pub delivered_count: usize,
    /// The reply reference was invalid and the message was stored as a plain one
    pub reply_degraded: bool,
}

/// True while `now` is within `window` of `created_at`
pub fn recall_allowed(created_at: OffsetDateTime, now: OffsetDateTime, window: Duration) -> bool {
    let elapsed = now - created_at;
    elapsed <= time::Duration::try_from(window).unwrap_or(time::Duration::MAX)
}

#[derive(Clone)]
pub struct MessageDeliveryCoordinator {
    storage: Arc<dyn StorageGateway>,
    registry: ConnectionRegistry,
    recall_window: Duration,
    retry: RetryPolicy,
}

impl MessageDeliveryCoordinator {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        registry: ConnectionRegistry,
        recall_window: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            storage,
            registry,
            recall_window,
            retry,
        }
    }

    pub async fn send(&self, request: SendRequest) -> ApiResult<SendOutcome> {
        let session = self
            .storage
            .get_session(&request.session_id)
            .await?
            .filter(|s| s.status != SessionStatus::Closed)
            .ok_or(ApiError::SessionUnavailable)?;

        self.storage
            .get_user(request.sender_id)
            .await?
            .ok_or(ApiError::NotFound("sender"))?;
        if !session.is_participant(request.sender_id) {
            return Err(ApiError::Forbidden);
        }
        let acting_as_agent = session.agent_id == Some(request.sender_id);
        if request.role.is_agent() != acting_as_agent {
            return Err(ApiError::Validation(format!(
                "role {} does not match the sender's place in the session",
                request.role
            )));
        }

        let recipient_id = self.resolve_recipient(&session, &request).await?;

        let (reply_target, reply_degraded) = match request.reply_to_id {
            Some(reply_to_id) => match self.valid_reply_target(&session.session_id, reply_to_id).await {
                Some(target) => (Some(target), false),
                None => {
                    tracing::debug!(
                        session_id = %session.session_id,
                        reply_to_id = %reply_to_id,
                        "Invalid reply target, sending as plain message"
                    );
                    (None, true)
                }
            },
            None => (None, false),
        };

        let message = self
            .storage
            .create_message(NewMessage {
                session_id: session.session_id.clone(),
                sender_id: request.sender_id,
                recipient_id: Some(recipient_id),
                body: request.body,
                body_type: request.body_type,
                reply_to_id: reply_target.as_ref().map(|t| t.id),
            })
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, session_id = %session.session_id, "Failed to persist message");
                ApiError::StorageUnavailable
            })?;

        let preview = reply_target.as_ref().map(preview_of);
        let mut payload = to_payload(&message, preview);
        let delivered_count = self
            .registry
            .broadcast(recipient_id, &ServerEvent::NewMessage(payload.clone()))
            .await;

        payload.is_from_self = true;
        let echoed = self
            .registry
            .broadcast_except(
                request.sender_id,
                request.origin.as_ref(),
                &ServerEvent::NewMessage(payload),
            )
            .await;

        tracing::info!(
            message_id = %message.id,
            session_id = %message.session_id,
            sender_id = %message.sender_id,
            recipient_id = %recipient_id,
            delivered_count,
            echoed,
            reply_degraded,
            "Message sent"
        );

        if delivered_count > 0 {
            let coordinator = self.clone();
            let message_id = message.id;
            tokio::spawn(async move {
                if let Err(e) = coordinator
                    .mark_status(message_id, MessageStatus::Delivered, None)
                    .await
                {
                    tracing::warn!(error = %e, message_id = %message_id, "Could not mark message delivered");
                }
            });
        }

        Ok(SendOutcome {
            message,
            delivered_count,
            reply_degraded,
        })
    }

    /// Counterpart first, then a best-effort scan of recent history
    async fn resolve_recipient(
        &self,
        session: &ChatSession,
        request: &SendRequest,
    ) -> ApiResult<UserId> {
        if let Some(counterpart) = session.counterpart(request.sender_id) {
            if let Some(explicit) = request.recipient_id {
                if explicit != counterpart {
                    return Err(ApiError::Validation(
                        "recipient is not part of this session".to_string(),
                    ));
                }
            }
            return Ok(counterpart);
        }

        let recent = self
            .storage
            .recent_messages(&session.session_id, RECIPIENT_SCAN_DEPTH)
            .await?;
        let from_history = recent.iter().rev().find_map(|m| {
            if m.sender_id != request.sender_id {
                Some(m.sender_id)
            } else {
                m.recipient_id.filter(|r| *r != request.sender_id)
            }
        });

        match (from_history, request.recipient_id) {
            (Some(found), Some(explicit)) if found != explicit => Err(ApiError::Validation(
                "recipient is not part of this session".to_string(),
            )),
            (Some(found), _) => {
                tracing::warn!(
                    session_id = %session.session_id,
                    sender_id = %request.sender_id,
                    recipient_id = %found,
                    "Recipient resolved from message history"
                );
                Ok(found)
            }
            (None, _) => Err(ApiError::RecipientUnresolved),
        }
    }

    /// Target must exist, live in the same session and not be recalled
    async fn valid_reply_target(&self, session_id: &SessionId, reply_to_id: MessageId) -> Option<Message> {
        match self.storage.get_message(reply_to_id).await {
            Ok(Some(target)) if &target.session_id == session_id && !target.is_recalled => Some(target),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, reply_to_id = %reply_to_id, "Reply target lookup failed");
                None
            }
        }
    }

    /// Retract a message. Returns false when it was already recalled.
    pub async fn recall(&self, message_id: MessageId, requester: UserId) -> ApiResult<bool> {
        let message = self
            .storage
            .get_message(message_id)
            .await?
            .ok_or(ApiError::NotFound("message"))?;

        if message.sender_id != requester {
            return Err(ApiError::NotOwner);
        }
        if message.is_recalled {
            return Ok(false);
        }
        let now = OffsetDateTime::now_utc();
        if !recall_allowed(message.created_at, now, self.recall_window) {
            return Err(ApiError::Expired);
        }

        if !self.storage.set_recalled(message_id).await? {
            // A concurrent recall got there first and already broadcast
            return Ok(false);
        }

        let recipient_id = match message.recipient_id {
            Some(id) => Some(id),
            None => self
                .storage
                .get_session(&message.session_id)
                .await?
                .and_then(|s| s.counterpart(requester)),
        };
        let event = ServerEvent::MessageRecalled {
            message_id,
            session_id: message.session_id.clone(),
            sender_id: requester,
            recipient_id,
            recalled_at: now,
        };

        let mut notified = self.registry.broadcast(requester, &event).await;
        if let Some(recipient_id) = recipient_id {
            notified += self.registry.broadcast(recipient_id, &event).await;
        }

        tracing::info!(message_id = %message_id, sender_id = %requester, notified, "Message recalled");
        Ok(true)
    }

    /// Advance a message's status. Regressions are ignored and return false.
    pub async fn mark_status(
        &self,
        message_id: MessageId,
        status: MessageStatus,
        by_user: Option<UserId>,
    ) -> ApiResult<bool> {
        let storage = &self.storage;
        let message = with_bounded_retry(self.retry, "get_message", || async move {
            storage
                .get_message(message_id)
                .await?
                .ok_or(StorageError::NotFound("message"))
        })
        .await?;

        if let Some(user) = by_user {
            if message.recipient_id != Some(user) && message.sender_id != user {
                return Err(ApiError::Forbidden);
            }
        }
        if !message.status.advances_to(status) {
            tracing::debug!(
                message_id = %message_id,
                current = %message.status,
                requested = %status,
                "Ignoring non-advancing status"
            );
            return Ok(false);
        }

        let advanced = with_bounded_retry(self.retry, "set_status", || async move {
            storage.set_status(message_id, status).await
        })
        .await?;

        if advanced {
            self.registry
                .broadcast(
                    message.sender_id,
                    &ServerEvent::MessageStatus {
                        message_id,
                        session_id: message.session_id.clone(),
                        status,
                        updated_at: OffsetDateTime::now_utc(),
                    },
                )
                .await;
            tracing::debug!(message_id = %message_id, status = %status, "Message status advanced");
        }
        Ok(advanced)
    }

    /// Recent messages of a session as seen by `requester`, oldest first
    pub async fn history(
        &self,
        session_id: &SessionId,
        requester: UserId,
        limit: Option<u32>,
    ) -> ApiResult<Vec<MessagePayload>> {
        let session = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or(ApiError::NotFound("session"))?;
        if !session.is_participant(requester) {
            return Err(ApiError::Forbidden);
        }

        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let messages = self.storage.recent_messages(session_id, limit).await?;
        let by_id: HashMap<MessageId, &Message> = messages.iter().map(|m| (m.id, m)).collect();

        let mut views = Vec::with_capacity(messages.len());
        for message in &messages {
            let preview = match message.reply_to_id {
                Some(target_id) => match by_id.get(&target_id) {
                    Some(target) => Some(preview_of(target)),
                    None => self.storage.get_message(target_id).await?.as_ref().map(preview_of),
                },
                None => None,
            };
            let mut view = to_payload(message, preview);
            view.is_from_self = message.sender_id == requester;
            views.push(view);
        }
        Ok(views)
    }
}

fn preview_of(target: &Message) -> ReplyPreview {
    ReplyPreview {
        message_id: target.id,
        sender_id: target.sender_id,
        body: visible_body(target),
        body_type: target.body_type,
        is_recalled: target.is_recalled,
    }
}

fn visible_body(message: &Message) -> String {
    if message.is_recalled {
        RECALLED_PLACEHOLDER.to_string()
    } else {
        message.body.clone()
    }
}

fn to_payload(message: &Message, reply_to: Option<ReplyPreview>) -> MessagePayload {
    MessagePayload {
        id: message.id,
        session_id: message.session_id.clone(),
        sender_id: message.sender_id,
        recipient_id: message.recipient_id,
        body: visible_body(message),
        body_type: message.body_type,
        status: message.status,
        is_recalled: message.is_recalled,
        created_at: message.created_at,
        reply_to,
        is_from_self: false,
    }
}
