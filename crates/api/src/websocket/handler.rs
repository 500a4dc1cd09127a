//! WebSocket handler for Axum
//!
//! Upgrades the HTTP connection, decodes inbound frames into [`ClientEvent`]
//! and routes each one through an exhaustive match. Every frame gets a
//! `reply` carrying its `request_id`.

use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{header::USER_AGENT, HeaderMap},
    response::Response,
};
use futures::{stream::StreamExt, SinkExt};
use helpline_shared::events::{
    decode_client_frame, ClientEvent, ClientFrame, MatchAck, RegisterAck, SendAck, ServerEvent,
};
use helpline_shared::{ConnectionId, ConnectionRecord, MessageStatus, UserId};
use serde::Serialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::auth::verify_for;
use crate::delivery::SendRequest;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

use super::connection::ConnectionMeta;
use super::registry::PresenceEvent;

/// Per-socket state owned by the socket task
pub struct SocketContext {
    pub meta: ConnectionMeta,
    pub sender: mpsc::UnboundedSender<ServerEvent>,
    /// Set once `register` succeeds on this socket
    pub registered: Option<(ConnectionId, UserId)>,
}

impl SocketContext {
    pub fn new(meta: ConnectionMeta, sender: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            meta,
            sender,
            registered: None,
        }
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        self.registered.as_ref().map(|(id, _)| id.clone())
    }
}

/// WebSocket handler - upgrades HTTP connection to WebSocket.
/// Authentication happens per frame, starting with `register`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let meta = ConnectionMeta {
        remote_addr: Some(addr.to_string()),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
    };

    tracing::debug!(remote_addr = %addr, "WebSocket connection upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state, meta))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState, meta: ConnectionMeta) {
    let (mut sink, mut stream) = socket.split();

    // Create channel for sending events to this socket
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let mut ctx = SocketContext::new(meta, tx);

    let _ = ctx.sender.send(ServerEvent::Connected {
        server_time: OffsetDateTime::now_utc(),
    });

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sink.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Failed to serialize WebSocket event");
                }
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = stream.next().await {
        let Ok(msg) = msg else { break };
        match msg {
            Message::Text(text) => match decode_client_frame(&text) {
                Ok(frame) => {
                    let reply = handle_client_event(&state, &mut ctx, frame).await;
                    let _ = ctx.sender.send(reply);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse client event");
                    let _ = ctx.sender.send(ServerEvent::Error {
                        code: "INVALID_FRAME".to_string(),
                        message: "Invalid event format".to_string(),
                    });
                }
            },
            Message::Close(_) => {
                tracing::debug!("WebSocket close frame received");
                break;
            }
            // Axum answers pings itself; binary frames are not part of the protocol
            _ => {}
        }
    }

    close_socket(&state, &mut ctx).await;
    send_task.abort();
}

/// Release the socket's registration, if it still owns one
pub async fn close_socket(state: &AppState, ctx: &mut SocketContext) {
    let Some((connection_id, user_id)) = ctx.registered.take() else {
        return;
    };
    tracing::info!(connection_id = %connection_id, user_id = %user_id, "WebSocket connection closing");

    // Already evicted or re-registered elsewhere: nothing to release
    let Some(removed) = state.registry.release(&connection_id, &ctx.sender).await else {
        return;
    };
    if let Err(e) = state.storage.close_connection(&connection_id).await {
        tracing::warn!(error = %e, connection_id = %connection_id, "Failed to close connection record");
    }
    if let Some(event) = removed.presence {
        state.presence.handle(event).await;
    }
}

/// Handle one client frame and build its reply
pub async fn handle_client_event(
    state: &AppState,
    ctx: &mut SocketContext,
    frame: ClientFrame,
) -> ServerEvent {
    let ClientFrame { request_id, event } = frame;
    let name = event.name();

    match dispatch(state, ctx, event).await {
        Ok(data) => ServerEvent::ok(request_id, data),
        Err(e) => {
            tracing::debug!(event = name, code = e.code(), error = %e, "Client event rejected");
            ServerEvent::failed(request_id, e.to_body())
        }
    }
}

async fn dispatch(state: &AppState, ctx: &mut SocketContext, event: ClientEvent) -> ApiResult<Value> {
    use ClientEvent::*;

    match event {
        Register {
            user_id,
            token,
            connection_id,
            device_id,
        } => {
            verify_for(state.verifier.as_ref(), &token, user_id).await?;
            state
                .storage
                .get_user(user_id)
                .await?
                .ok_or(ApiError::NotFound("user"))?;

            // One registration per socket: switching ids releases the old one
            let switching =
                matches!(&ctx.registered, Some((previous, _)) if previous != &connection_id);
            if switching {
                close_socket(state, ctx).await;
            }

            let registration = state
                .registry
                .register(
                    user_id,
                    connection_id.clone(),
                    device_id.clone(),
                    ctx.meta.clone(),
                    ctx.sender.clone(),
                )
                .await?;
            ctx.registered = Some((connection_id.clone(), user_id));

            if let Err(e) = state
                .storage
                .record_connection(ConnectionRecord {
                    connection_id: connection_id.clone(),
                    user_id,
                    device_id,
                    remote_addr: ctx.meta.remote_addr.clone(),
                    user_agent: ctx.meta.user_agent.clone(),
                })
                .await
            {
                tracing::warn!(error = %e, connection_id = %connection_id, "Failed to record connection");
            }

            tracing::info!(
                connection_id = %connection_id,
                user_id = %user_id,
                refreshed = registration.refreshed,
                came_online = registration.came_online,
                "Client registered"
            );
            if registration.came_online {
                state.presence.handle(PresenceEvent::UserCameOnline(user_id)).await;
            }
            to_data(&RegisterAck { connection_id })
        }

        Heartbeat { connection_id } => {
            require_registered_connection(ctx, &connection_id)?;
            state.registry.touch(&connection_id).await?;
            if let Err(e) = state.storage.touch_connection(&connection_id).await {
                tracing::debug!(error = %e, connection_id = %connection_id, "Failed to touch connection record");
            }
            Ok(json!({ "server_time": now_rfc3339() }))
        }

        SendMessage {
            session_id,
            sender_id,
            recipient_id,
            body,
            body_type,
            role,
            token,
            reply_to_id,
        } => {
            verify_for(state.verifier.as_ref(), &token, sender_id).await?;
            let outcome = state
                .delivery
                .send(SendRequest {
                    session_id,
                    sender_id,
                    recipient_id,
                    body,
                    body_type,
                    role,
                    reply_to_id,
                    origin: ctx.connection_id(),
                })
                .await?;
            to_data(&SendAck {
                message_id: outcome.message.id,
                server_time: OffsetDateTime::now_utc(),
                delivered_count: outcome.delivered_count,
                reply_degraded: outcome.reply_degraded,
            })
        }

        RecallMessage {
            message_id,
            user_id,
            token,
        } => {
            verify_for(state.verifier.as_ref(), &token, user_id).await?;
            let recalled = state.delivery.recall(message_id, user_id).await?;
            Ok(json!({ "recalled": recalled }))
        }

        MatchAgent {
            session_id,
            user_id,
            token,
        } => {
            verify_for(state.verifier.as_ref(), &token, user_id).await?;
            let outcome = state.router.request_match(&session_id, user_id).await?;
            to_data(&MatchAck {
                matched: outcome.matched,
                agent_id: outcome.agent_id,
            })
        }

        AcceptSession {
            session_id,
            agent_id,
            token,
        } => {
            verify_for(state.verifier.as_ref(), &token, agent_id).await?;
            state.router.accept(&session_id, agent_id).await?;
            Ok(json!({ "session_id": session_id }))
        }

        UpdateAgentStatus {
            user_id,
            status,
            token,
        } => {
            verify_for(state.verifier.as_ref(), &token, user_id).await?;
            state.presence.set_status(user_id, status).await?;
            Ok(json!({ "status": status }))
        }

        CloseSession {
            session_id,
            user_id,
            token,
        } => {
            verify_for(state.verifier.as_ref(), &token, user_id).await?;
            state.router.close(&session_id, user_id).await?;
            Ok(json!({ "session_id": session_id }))
        }

        MessageDelivered {
            message_id,
            user_id,
        } => {
            require_registered_as(ctx, user_id)?;
            let advanced = state
                .delivery
                .mark_status(message_id, MessageStatus::Delivered, Some(user_id))
                .await?;
            Ok(json!({ "advanced": advanced }))
        }

        MessageRead {
            message_id,
            user_id,
        } => {
            require_registered_as(ctx, user_id)?;
            let advanced = state
                .delivery
                .mark_status(message_id, MessageStatus::Read, Some(user_id))
                .await?;
            Ok(json!({ "advanced": advanced }))
        }

        GetSessionMessages {
            session_id,
            user_id,
            token,
            limit,
        } => {
            verify_for(state.verifier.as_ref(), &token, user_id).await?;
            let messages = state.delivery.history(&session_id, user_id, limit).await?;
            Ok(json!({ "session_id": session_id, "messages": messages }))
        }

        SubscribePendingSessions { user_id, token } => {
            verify_for(state.verifier.as_ref(), &token, user_id).await?;
            let sessions = state.router.pending_sessions(user_id).await?;
            Ok(json!({ "count": sessions.len(), "sessions": sessions }))
        }
    }
}

/// Receipts carry no token; the socket must already be registered as that user
fn require_registered_as(ctx: &SocketContext, user_id: UserId) -> ApiResult<()> {
    match &ctx.registered {
        Some((_, registered)) if *registered == user_id => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

/// Heartbeats only keep alive the registration this socket holds
fn require_registered_connection(ctx: &SocketContext, connection_id: &ConnectionId) -> ApiResult<()> {
    match &ctx.registered {
        Some((registered, _)) if registered == connection_id => Ok(()),
        _ => Err(ApiError::ReconnectRequired),
    }
}

fn to_data<T: Serialize>(value: &T) -> ApiResult<Value> {
    serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
