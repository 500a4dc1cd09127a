//! WebSocket event types and serialization
//!
//! Defines all client-to-server and server-to-client event types
//! with type-safe serde serialization. Frames are JSON objects tagged
//! by a snake_case `type` field.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ProtocolError;
use crate::types::{
    AgentStatus, BodyType, ConnectionId, MessageId, MessageStatus, SessionId, SessionStatus,
    UserId, UserRole,
};

// =============================================================================
// Client-to-Server Events
// =============================================================================

/// Envelope for every inbound frame. `request_id` is echoed back in the reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub event: ClientEvent,
}

impl ClientFrame {
    pub fn new(request_id: impl Into<String>, event: ClientEvent) -> Self {
        Self {
            request_id: Some(request_id.into()),
            event,
        }
    }
}

/// Events sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Bind this socket to a user under a client-chosen connection id
    Register {
        user_id: UserId,
        token: String,
        connection_id: ConnectionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
    },

    /// Keep the connection alive
    Heartbeat { connection_id: ConnectionId },

    SendMessage {
        session_id: SessionId,
        sender_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_id: Option<UserId>,
        body: String,
        #[serde(default)]
        body_type: BodyType,
        role: UserRole,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to_id: Option<MessageId>,
    },

    RecallMessage {
        message_id: MessageId,
        user_id: UserId,
        token: String,
    },

    /// End-user asks for an agent
    MatchAgent {
        session_id: SessionId,
        user_id: UserId,
        token: String,
    },

    AcceptSession {
        session_id: SessionId,
        agent_id: UserId,
        token: String,
    },

    UpdateAgentStatus {
        user_id: UserId,
        status: AgentStatus,
        token: String,
    },

    CloseSession {
        session_id: SessionId,
        user_id: UserId,
        token: String,
    },

    /// Delivery receipt from the recipient's device
    MessageDelivered { message_id: MessageId, user_id: UserId },

    /// Read receipt from the recipient's device
    MessageRead { message_id: MessageId, user_id: UserId },

    GetSessionMessages {
        session_id: SessionId,
        user_id: UserId,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },

    /// Agent fetches the sessions still waiting in the pending queue
    SubscribePendingSessions { user_id: UserId, token: String },
}

impl ClientEvent {
    /// Wire name of the event, used in logs and the client retry queue
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Heartbeat { .. } => "heartbeat",
            Self::SendMessage { .. } => "send_message",
            Self::RecallMessage { .. } => "recall_message",
            Self::MatchAgent { .. } => "match_agent",
            Self::AcceptSession { .. } => "accept_session",
            Self::UpdateAgentStatus { .. } => "update_agent_status",
            Self::CloseSession { .. } => "close_session",
            Self::MessageDelivered { .. } => "message_delivered",
            Self::MessageRead { .. } => "message_read",
            Self::GetSessionMessages { .. } => "get_session_messages",
            Self::SubscribePendingSessions { .. } => "subscribe_pending_sessions",
        }
    }
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Events sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Socket accepted, waiting for `register`
    Connected {
        #[serde(with = "time::serde::rfc3339")]
        server_time: OffsetDateTime,
    },

    /// Synchronous answer to a client frame
    Reply {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },

    NewMessage(MessagePayload),

    MessageRecalled {
        message_id: MessageId,
        session_id: SessionId,
        sender_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_id: Option<UserId>,
        #[serde(with = "time::serde::rfc3339")]
        recalled_at: OffsetDateTime,
    },

    /// Status advancement, pushed to the original sender
    MessageStatus {
        message_id: MessageId,
        session_id: SessionId,
        status: MessageStatus,
        #[serde(with = "time::serde::rfc3339")]
        updated_at: OffsetDateTime,
    },

    SessionAcceptedForUser {
        session_id: SessionId,
        user_id: UserId,
        agent_id: UserId,
        agent_name: String,
    },

    AgentStatusChanged { agent_id: UserId, status: AgentStatus },

    /// A session entered the pending queue (pushed to online agents)
    NewPendingSession {
        session_id: SessionId,
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        suggested_agent_id: Option<UserId>,
    },

    /// A pending session was taken (pushed to online agents)
    PendingSessionAccepted { session_id: SessionId, agent_id: UserId },

    SessionStatusUpdated {
        session_id: SessionId,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        changed_by: Option<UserId>,
    },

    /// Frame-level error not tied to a request
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn ok(request_id: Option<String>, data: serde_json::Value) -> Self {
        Self::Reply {
            request_id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(request_id: Option<String>, error: ErrorBody) -> Self {
        Self::Reply {
            request_id,
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

// =============================================================================
// Event Data Structures
// =============================================================================

/// Error body shared by HTTP responses and WebSocket replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Message as pushed in `new_message` and returned by history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    pub body: String,
    pub body_type: BodyType,
    pub status: MessageStatus,
    #[serde(default)]
    pub is_recalled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
    /// Set on the copy echoed to the sender's own devices
    #[serde(default)]
    pub is_from_self: bool,
}

/// Summary of the message being replied to, computed at read time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub body: String,
    pub body_type: BodyType,
    pub is_recalled: bool,
}

/// Reply data for `register`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub connection_id: ConnectionId,
}

/// Reply data for `send_message`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendAck {
    pub message_id: MessageId,
    #[serde(with = "time::serde::rfc3339")]
    pub server_time: OffsetDateTime,
    pub delivered_count: usize,
    #[serde(default)]
    pub reply_degraded: bool,
}

/// Reply data for `match_agent`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchAck {
    pub matched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<UserId>,
}

/// Queue entry in the reply to `subscribe_pending_sessions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSessionSummary {
    pub session_id: SessionId,
    pub user_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Decode one inbound text frame
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode one outbound text frame (client side)
pub fn decode_server_event(text: &str) -> Result<ServerEvent, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}
