//! WebSocket connection management
//!
//! Represents a registered WebSocket connection owned by the registry.

use helpline_shared::events::ServerEvent;
use helpline_shared::{ConnectionId, UserId};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Transport metadata captured at upgrade time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMeta {
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
}

/// Represents a registered WebSocket connection
#[derive(Debug)]
pub struct Connection {
    /// Client-chosen connection ID
    pub id: ConnectionId,

    /// Authenticated user ID
    pub user_id: UserId,

    pub device_id: Option<String>,

    pub meta: ConnectionMeta,

    pub created_at: OffsetDateTime,

    /// Monotonic time of the last heartbeat (or registration)
    pub last_heartbeat: Instant,

    /// Channel to send events to this connection
    pub sender: mpsc::UnboundedSender<ServerEvent>,
}

impl Connection {
    /// Create a new connection
    pub fn new(
        id: ConnectionId,
        user_id: UserId,
        device_id: Option<String>,
        meta: ConnectionMeta,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            id,
            user_id,
            device_id,
            meta,
            created_at: OffsetDateTime::now_utc(),
            last_heartbeat: Instant::now(),
            sender,
        }
    }

    /// Send an event to this connection
    ///
    /// Returns Ok(()) if sent successfully, Err if connection is closed
    #[allow(clippy::result_large_err)] // Error type is from tokio mpsc, containing the failed event
    pub fn send(&self, event: ServerEvent) -> Result<(), mpsc::error::SendError<ServerEvent>> {
        self.sender.send(event)
    }

    pub fn is_silent_for(&self, timeout: std::time::Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > timeout
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            user_id: self.user_id,
            device_id: self.device_id.clone(),
            meta: self.meta.clone(),
            created_at: self.created_at,
        }
    }
}

/// Read-only snapshot of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub device_id: Option<String>,
    pub meta: ConnectionMeta,
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_strictly_greater_than_timeout() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Connection::new("c-1".into(), UserId(1), None, ConnectionMeta::default(), tx);
        let timeout = Duration::from_secs(300);

        tokio::time::advance(timeout).await;
        assert!(!conn.is_silent_for(timeout, Instant::now()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(conn.is_silent_for(timeout, Instant::now()));
    }

    #[tokio::test]
    async fn test_send_fails_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new("c-1".into(), UserId(1), None, ConnectionMeta::default(), tx);
        drop(rx);
        assert!(conn
            .send(ServerEvent::Error {
                code: "X".into(),
                message: "x".into()
            })
            .is_err());
    }
}
