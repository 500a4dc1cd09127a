//! Reconnecting client session
//!
//! One logical connection to the server: re-registers after every connect,
//! sends heartbeats, re-emits queued frames and forwards server events to the
//! application with duplicate messages filtered out.

use std::sync::Arc;
use std::time::Duration;

use helpline_shared::events::{ClientEvent, ClientFrame, ServerEvent};
use helpline_shared::{
    AgentStatus, BodyType, ConnectionId, MessageId, SessionId, UserId, UserRole,
};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use uuid::Uuid;

use crate::dedup::RecentIds;
use crate::error::{ClientError, ClientResult};
use crate::retry_queue::RetryQueue;
use crate::state::ConnectionStatus;
use crate::transport::{Connector, Link, Transport};

/// Error code the server uses for an evicted connection
const RECONNECT_REQUIRED: &str = "RECONNECT_REQUIRED";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub heartbeat_interval: Duration,
    pub retry_interval: Duration,
    pub retry_capacity: usize,
    pub max_retry_attempts: u32,
    /// First reconnect delay; doubles up to `reconnect_max_delay`
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_attempts: usize,
    pub dedup_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            retry_interval: Duration::from_secs(5),
            retry_capacity: 100,
            max_retry_attempts: 3,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(10),
            reconnect_attempts: 20,
            dedup_capacity: 1000,
        }
    }
}

/// Who this session registers as
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub user_id: UserId,
    pub token: String,
    pub connection_id: ConnectionId,
    pub device_id: Option<String>,
}

impl ClientIdentity {
    /// Identity with a fresh random connection id
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
            connection_id: ConnectionId::from(Uuid::new_v4().to_string()),
            device_id: None,
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

/// A chat message to send
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub session_id: SessionId,
    pub body: String,
    pub body_type: BodyType,
    pub role: UserRole,
    pub recipient_id: Option<UserId>,
    pub reply_to_id: Option<MessageId>,
}

impl OutgoingMessage {
    pub fn text(session_id: impl Into<SessionId>, role: UserRole, body: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            body: body.into(),
            body_type: BodyType::Text,
            role,
            recipient_id: None,
            reply_to_id: None,
        }
    }

    pub fn replying_to(mut self, message_id: MessageId) -> Self {
        self.reply_to_id = Some(message_id);
        self
    }
}

struct Inner {
    config: ClientConfig,
    identity: ClientIdentity,
    connector: Arc<dyn Connector>,
    status: watch::Sender<ConnectionStatus>,
    shutdown: watch::Sender<bool>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    queue: Mutex<RetryQueue>,
    seen: Mutex<RecentIds>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

enum LinkExit {
    Shutdown,
    Lost,
}

#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<Inner>,
}

impl ClientSession {
    /// Build a session. Server events for the application arrive on the returned receiver.
    pub fn new(
        config: ClientConfig,
        identity: ClientIdentity,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (shutdown, _) = watch::channel(false);
        let queue = RetryQueue::new(config.retry_capacity, config.max_retry_attempts);
        let seen = RecentIds::new(config.dedup_capacity);

        let session = Self {
            inner: Arc::new(Inner {
                config,
                identity,
                connector,
                status,
                shutdown,
                transport: RwLock::new(None),
                queue: Mutex::new(queue),
                seen: Mutex::new(seen),
                events,
            }),
        };
        (session, events_rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.inner.identity
    }

    pub async fn queued(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// Drive the connection until [`disconnect`](Self::disconnect) is called
    /// or reconnecting gives up.
    pub async fn run(&self) -> ClientResult<()> {
        self.inner.shutdown.send_replace(false);
        let mut shutdown = self.inner.shutdown.subscribe();
        self.transition(ConnectionStatus::Connecting);

        loop {
            let link = tokio::select! {
                result = self.connect_with_backoff() => match result {
                    Ok(link) => link,
                    Err(e) => {
                        tracing::error!(error = %e, "Giving up on connection");
                        self.transition(ConnectionStatus::Error);
                        return Err(e);
                    }
                },
                _ = shutdown.changed() => {
                    self.transition(ConnectionStatus::Disconnected);
                    return Ok(());
                }
            };

            match self.serve_link(link, &mut shutdown).await {
                LinkExit::Shutdown => {
                    self.transition(ConnectionStatus::Disconnected);
                    return Ok(());
                }
                LinkExit::Lost => {
                    tracing::warn!(connection_id = %self.inner.identity.connection_id, "Connection lost, reconnecting");
                    self.transition(ConnectionStatus::Reconnecting);
                }
            }
        }
    }

    /// Stop timers and close the connection
    pub async fn disconnect(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.transport.write().await.take();
        self.transition(ConnectionStatus::Disconnected);
        tracing::info!(connection_id = %self.inner.identity.connection_id, "Client disconnected");
    }

    /// Send a chat message.
    ///
    /// Returns whether the frame was handed to the socket. On failure it is
    /// queued for retry.
    pub async fn send_message(&self, message: OutgoingMessage) -> bool {
        let identity = &self.inner.identity;
        self.emit_or_queue(ClientEvent::SendMessage {
            session_id: message.session_id,
            sender_id: identity.user_id,
            recipient_id: message.recipient_id,
            body: message.body,
            body_type: message.body_type,
            role: message.role,
            token: identity.token.clone(),
            reply_to_id: message.reply_to_id,
        })
        .await
    }

    /// Recall one of our messages; queued for retry on failure
    pub async fn recall_message(&self, message_id: MessageId) -> bool {
        let identity = &self.inner.identity;
        self.emit_or_queue(ClientEvent::RecallMessage {
            message_id,
            user_id: identity.user_id,
            token: identity.token.clone(),
        })
        .await
    }

    pub async fn mark_read(&self, message_id: MessageId) -> bool {
        self.try_emit(ClientEvent::MessageRead {
            message_id,
            user_id: self.inner.identity.user_id,
        })
        .await
    }

    pub async fn match_agent(&self, session_id: SessionId) -> bool {
        let identity = &self.inner.identity;
        self.try_emit(ClientEvent::MatchAgent {
            session_id,
            user_id: identity.user_id,
            token: identity.token.clone(),
        })
        .await
    }

    pub async fn accept_session(&self, session_id: SessionId) -> bool {
        let identity = &self.inner.identity;
        self.try_emit(ClientEvent::AcceptSession {
            session_id,
            agent_id: identity.user_id,
            token: identity.token.clone(),
        })
        .await
    }

    pub async fn update_agent_status(&self, status: AgentStatus) -> bool {
        let identity = &self.inner.identity;
        self.try_emit(ClientEvent::UpdateAgentStatus {
            user_id: identity.user_id,
            status,
            token: identity.token.clone(),
        })
        .await
    }

    pub async fn close_session(&self, session_id: SessionId) -> bool {
        let identity = &self.inner.identity;
        self.try_emit(ClientEvent::CloseSession {
            session_id,
            user_id: identity.user_id,
            token: identity.token.clone(),
        })
        .await
    }

    pub async fn fetch_history(&self, session_id: SessionId, limit: Option<u32>) -> bool {
        let identity = &self.inner.identity;
        self.try_emit(ClientEvent::GetSessionMessages {
            session_id,
            user_id: identity.user_id,
            token: identity.token.clone(),
            limit,
        })
        .await
    }

    /// Ask for the pending queue; the list arrives as a `reply`
    pub async fn fetch_pending_sessions(&self) -> bool {
        let identity = &self.inner.identity;
        self.try_emit(ClientEvent::SubscribePendingSessions {
            user_id: identity.user_id,
            token: identity.token.clone(),
        })
        .await
    }

    /// Re-emit everything queued. Returns how many went out.
    pub async fn drain_retry_queue(&self) -> usize {
        let items = self.inner.queue.lock().await.drain();
        if items.is_empty() {
            return 0;
        }

        let mut sent = 0;
        for item in items {
            match self.emit(item.event.clone()).await {
                Ok(()) => {
                    tracing::debug!(event = item.name(), attempts = item.attempts, "Retried event sent");
                    sent += 1;
                }
                Err(e) => {
                    tracing::debug!(event = item.name(), error = %e, "Retry failed");
                    self.inner.queue.lock().await.requeue(item);
                }
            }
        }
        sent
    }

    async fn connect_with_backoff(&self) -> ClientResult<Link> {
        let config = &self.inner.config;
        let base_ms = config.reconnect_base_delay.as_millis().max(1) as u64;
        // 2^n * base/2: base, 2*base, 4*base, ...
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(base_ms / 2 + base_ms % 2)
            .max_delay(config.reconnect_max_delay)
            .take(config.reconnect_attempts);

        let connector = &self.inner.connector;
        let mut attempt = 0usize;
        let result = Retry::spawn(strategy, || {
            attempt += 1;
            let current = attempt;
            async move {
                match connector.connect().await {
                    Ok(link) => Ok(Ok(link)),
                    Err(e) if e.is_transient() => {
                        tracing::warn!(attempt = current, error = %e, "Connect attempt failed");
                        Err(e)
                    }
                    Err(e) => Ok(Err(e)),
                }
            }
        })
        .await;
        result.map_err(|_| ClientError::ReconnectExhausted(attempt))?
    }

    async fn serve_link(&self, link: Link, shutdown: &mut watch::Receiver<bool>) -> LinkExit {
        let Link {
            transport,
            mut inbound,
        } = link;
        *self.inner.transport.write().await = Some(transport);

        self.register().await;
        self.transition(ConnectionStatus::Connected);

        let config = &self.inner.config;
        let mut heartbeat = interval_at(
            Instant::now() + config.heartbeat_interval,
            config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry = interval_at(Instant::now() + config.retry_interval, config.retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break LinkExit::Lost,
                },
                _ = heartbeat.tick() => self.send_heartbeat().await,
                _ = retry.tick() => {
                    let sent = self.drain_retry_queue().await;
                    if sent > 0 {
                        tracing::info!(sent, "Re-sent queued events");
                    }
                }
                _ = shutdown.changed() => break LinkExit::Shutdown,
            }
        };

        self.inner.transport.write().await.take();
        exit
    }

    async fn handle_event(&self, event: ServerEvent) {
        match &event {
            ServerEvent::NewMessage(payload) => {
                if !self.inner.seen.lock().await.insert(payload.id) {
                    tracing::debug!(message_id = %payload.id, "Duplicate message ignored");
                    return;
                }
                if !payload.is_from_self {
                    self.try_emit(ClientEvent::MessageDelivered {
                        message_id: payload.id,
                        user_id: self.inner.identity.user_id,
                    })
                    .await;
                }
            }
            ServerEvent::Reply {
                ok: false,
                error: Some(error),
                ..
            } if error.code == RECONNECT_REQUIRED => {
                tracing::info!(connection_id = %self.inner.identity.connection_id, "Server dropped our registration, registering again");
                self.register().await;
            }
            _ => {}
        }

        let _ = self.inner.events.send(event);
    }

    async fn register(&self) {
        let identity = &self.inner.identity;
        let event = ClientEvent::Register {
            user_id: identity.user_id,
            token: identity.token.clone(),
            connection_id: identity.connection_id.clone(),
            device_id: identity.device_id.clone(),
        };
        if let Err(e) = self.emit(event).await {
            tracing::warn!(error = %e, "Failed to send register");
        }
    }

    async fn send_heartbeat(&self) {
        let event = ClientEvent::Heartbeat {
            connection_id: self.inner.identity.connection_id.clone(),
        };
        if let Err(e) = self.emit(event).await {
            tracing::debug!(error = %e, "Heartbeat not sent");
        }
    }

    async fn emit_or_queue(&self, event: ClientEvent) -> bool {
        match self.emit(event.clone()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(event = event.name(), error = %e, "Emit failed, queueing");
                self.inner.queue.lock().await.push(event);
                false
            }
        }
    }

    async fn try_emit(&self, event: ClientEvent) -> bool {
        let name = event.name();
        match self.emit(event).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(event = name, error = %e, "Emit failed");
                false
            }
        }
    }

    async fn emit(&self, event: ClientEvent) -> ClientResult<()> {
        let transport = self
            .inner
            .transport
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;
        transport
            .emit(&ClientFrame::new(Uuid::new_v4().to_string(), event))
            .await
    }

    fn transition(&self, next: ConnectionStatus) -> bool {
        self.inner.status.send_if_modified(|current| {
            if *current == next {
                false
            } else if current.can_transition_to(next) {
                tracing::debug!(from = %current, to = %next, "Connection status changed");
                *current = next;
                true
            } else {
                tracing::warn!(from = %current, to = %next, "Ignoring invalid status transition");
                false
            }
        })
    }
}
