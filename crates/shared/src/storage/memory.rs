//! In-memory storage gateway
//!
//! Backs local development without PostgreSQL and every test in the workspace.
//! All state sits behind a single lock so compare-and-assign is atomic.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

use super::StorageGateway;
use crate::error::{StorageError, StorageResult};
use crate::types::{
    AgentStatus, AgentSummary, ChatSession, ConnectionId, ConnectionRecord, Message, MessageId,
    MessageStatus, NewMessage, SessionId, SessionStatus, User, UserId,
};

#[derive(Default)]
struct Inner {
    users: BTreeMap<UserId, User>,
    agent_status: HashMap<UserId, AgentStatus>,
    sessions: HashMap<SessionId, ChatSession>,
    messages: BTreeMap<MessageId, Message>,
    next_message_id: i64,
    connections: HashMap<ConnectionId, (ConnectionRecord, OffsetDateTime)>,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
    failing_message_reads: AtomicU32,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user
    pub async fn insert_user(&self, user: User) {
        let mut inner = self.inner.write().await;
        inner.users.insert(user.id, user);
    }

    /// Simulate an outage: every call fails with `Unavailable` while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `count` message reads fail with `Unavailable`
    pub fn fail_next_message_reads(&self, count: u32) {
        self.failing_message_reads.store(count, Ordering::SeqCst);
    }

    /// Shift a message's creation time into the past
    pub async fn backdate_message(&self, message_id: MessageId, by: Duration) {
        let mut inner = self.inner.write().await;
        if let Some(message) = inner.messages.get_mut(&message_id) {
            message.created_at -= by;
        }
    }

    /// Shift a connection record's last-seen time into the past
    pub async fn backdate_connection(&self, connection_id: &ConnectionId, by: Duration) {
        let mut inner = self.inner.write().await;
        if let Some((_, last_seen)) = inner.connections.get_mut(connection_id) {
            *last_seen -= by;
        }
    }

    pub async fn connection_record_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn agent_status(&self, agent_id: UserId) -> AgentStatus {
        let inner = self.inner.read().await;
        inner
            .agent_status
            .get(&agent_id)
            .copied()
            .unwrap_or(AgentStatus::Offline)
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory storage offline".into()));
        }
        Ok(())
    }

    fn check_message_read(&self) -> StorageResult<()> {
        let remaining = self.failing_message_reads.load(Ordering::SeqCst);
        if remaining > 0 {
            tracing::debug!(remaining, "Injected message read failure");
            self.failing_message_reads
                .store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Unavailable("transient read failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageGateway for MemoryStorage {
    async fn ping(&self) -> StorageResult<()> {
        self.check_available()
    }

    async fn get_user(&self, user_id: UserId) -> StorageResult<Option<User>> {
        self.check_available()?;
        Ok(self.inner.read().await.users.get(&user_id).cloned())
    }

    async fn get_session(&self, session_id: &SessionId) -> StorageResult<Option<ChatSession>> {
        self.check_available()?;
        Ok(self.inner.read().await.sessions.get(session_id).cloned())
    }

    async fn create_pending_session(
        &self,
        session_id: &SessionId,
        user_id: UserId,
    ) -> StorageResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(session_id) {
            return Ok(false);
        }
        inner.sessions.insert(
            session_id.clone(),
            ChatSession {
                session_id: session_id.clone(),
                user_id,
                agent_id: None,
                status: SessionStatus::Pending,
                created_at: OffsetDateTime::now_utc(),
                started_at: None,
                closed_at: None,
            },
        );
        Ok(true)
    }

    async fn compare_and_assign_session(
        &self,
        session_id: &SessionId,
        agent_id: UserId,
    ) -> StorageResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(session_id) {
            Some(session) if session.status == SessionStatus::Pending && session.agent_id.is_none() => {
                session.agent_id = Some(agent_id);
                session.status = SessionStatus::Active;
                session.started_at = Some(OffsetDateTime::now_utc());
                Ok(true)
            }
            _ => {
                tracing::debug!(session_id = %session_id, agent_id = %agent_id, "Assign skipped, session not pending");
                Ok(false)
            }
        }
    }

    async fn close_session(&self, session_id: &SessionId) -> StorageResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(session_id) {
            Some(session) if session.status != SessionStatus::Closed => {
                session.status = SessionStatus::Closed;
                session.closed_at = Some(OffsetDateTime::now_utc());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound("session")),
        }
    }

    async fn list_pending_sessions(&self) -> StorageResult<Vec<ChatSession>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let mut pending: Vec<ChatSession> = inner
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|s| s.created_at);
        Ok(pending)
    }

    async fn count_agent_sessions(&self, agent_id: UserId) -> StorageResult<i64> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let count = inner
            .sessions
            .values()
            .filter(|s| s.agent_id == Some(agent_id) && s.status == SessionStatus::Active)
            .count();
        Ok(count as i64)
    }

    async fn list_online_agents(&self) -> StorageResult<Vec<AgentSummary>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .filter(|u| u.role.is_agent())
            .filter_map(|u| {
                let status = inner
                    .agent_status
                    .get(&u.id)
                    .copied()
                    .unwrap_or(AgentStatus::Offline);
                status.is_listed().then(|| AgentSummary {
                    id: u.id,
                    username: u.username.clone(),
                    status,
                })
            })
            .collect())
    }

    async fn set_agent_status(&self, agent_id: UserId, status: AgentStatus) -> StorageResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        if !inner.users.contains_key(&agent_id) {
            return Err(StorageError::NotFound("user"));
        }
        inner.agent_status.insert(agent_id, status);
        Ok(())
    }

    async fn create_message(&self, message: NewMessage) -> StorageResult<Message> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        inner.next_message_id += 1;
        let stored = Message {
            id: MessageId(inner.next_message_id),
            session_id: message.session_id,
            sender_id: message.sender_id,
            recipient_id: message.recipient_id,
            body: message.body,
            body_type: message.body_type,
            status: MessageStatus::Sent,
            is_recalled: false,
            reply_to_id: message.reply_to_id,
            created_at: OffsetDateTime::now_utc(),
            delivered_at: None,
            read_at: None,
        };
        inner.messages.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_message(&self, message_id: MessageId) -> StorageResult<Option<Message>> {
        self.check_available()?;
        self.check_message_read()?;
        Ok(self.inner.read().await.messages.get(&message_id).cloned())
    }

    async fn recent_messages(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> StorageResult<Vec<Message>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let mut recent: Vec<Message> = inner
            .messages
            .values()
            .rev()
            .filter(|m| &m.session_id == session_id)
            .take(limit as usize)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }

    async fn set_recalled(&self, message_id: MessageId) -> StorageResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        match inner.messages.get_mut(&message_id) {
            Some(message) if !message.is_recalled => {
                message.is_recalled = true;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound("message")),
        }
    }

    async fn set_status(
        &self,
        message_id: MessageId,
        status: MessageStatus,
    ) -> StorageResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let message = inner
            .messages
            .get_mut(&message_id)
            .ok_or(StorageError::NotFound("message"))?;
        if !message.status.advances_to(status) {
            return Ok(false);
        }
        let now = OffsetDateTime::now_utc();
        message.status = status;
        match status {
            MessageStatus::Delivered => message.delivered_at = Some(now),
            MessageStatus::Read => {
                message.delivered_at.get_or_insert(now);
                message.read_at = Some(now);
            }
            MessageStatus::Sent => {}
        }
        Ok(true)
    }

    async fn record_connection(&self, record: ConnectionRecord) -> StorageResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            record.connection_id.clone(),
            (record, OffsetDateTime::now_utc()),
        );
        Ok(())
    }

    async fn touch_connection(&self, connection_id: &ConnectionId) -> StorageResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        if let Some((_, last_seen)) = inner.connections.get_mut(connection_id) {
            *last_seen = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn close_connection(&self, connection_id: &ConnectionId) -> StorageResult<()> {
        self.check_available()?;
        self.inner.write().await.connections.remove(connection_id);
        Ok(())
    }

    async fn purge_stale_connections(&self, older_than: Duration) -> StorageResult<u64> {
        self.check_available()?;
        let cutoff = OffsetDateTime::now_utc() - older_than;
        let mut inner = self.inner.write().await;
        let before = inner.connections.len();
        inner.connections.retain(|_, (_, last_seen)| *last_seen >= cutoff);
        let purged = (before - inner.connections.len()) as u64;
        if purged > 0 {
            tracing::debug!(purged, remaining = inner.connections.len(), "Purged connection records");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BodyType, UserRole};

    fn user(id: i64, role: UserRole) -> User {
        User {
            id: UserId(id),
            username: format!("user{}", id),
            email: format!("user{}@example.com", id),
            role,
        }
    }

    fn text(session: &str, from: i64) -> NewMessage {
        NewMessage {
            session_id: session.into(),
            sender_id: UserId(from),
            recipient_id: None,
            body: "hello".into(),
            body_type: BodyType::Text,
            reply_to_id: None,
        }
    }

    #[tokio::test]
    async fn test_compare_and_assign_only_once() {
        let storage = MemoryStorage::new();
        let session: SessionId = "s-1".into();
        assert!(storage.create_pending_session(&session, UserId(1)).await.unwrap());
        assert!(!storage.create_pending_session(&session, UserId(1)).await.unwrap());

        assert!(storage.compare_and_assign_session(&session, UserId(10)).await.unwrap());
        assert!(!storage.compare_and_assign_session(&session, UserId(11)).await.unwrap());

        let stored = storage.get_session(&session).await.unwrap().unwrap();
        assert_eq!(stored.agent_id, Some(UserId(10)));
        assert_eq!(stored.status, SessionStatus::Active);
        assert_eq!(storage.count_agent_sessions(UserId(10)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_message_ids_increase_and_recent_is_ascending() {
        let storage = MemoryStorage::new();
        for _ in 0..5 {
            storage.create_message(text("s", 1)).await.unwrap();
        }
        storage.create_message(text("other", 1)).await.unwrap();

        let recent = storage.recent_messages(&"s".into(), 3).await.unwrap();
        let ids: Vec<i64> = recent.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let storage = MemoryStorage::new();
        let message = storage.create_message(text("s", 1)).await.unwrap();

        assert!(storage.set_status(message.id, MessageStatus::Read).await.unwrap());
        assert!(!storage.set_status(message.id, MessageStatus::Delivered).await.unwrap());

        let stored = storage.get_message(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
        assert!(stored.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_recall_flips_once() {
        let storage = MemoryStorage::new();
        let message = storage.create_message(text("s", 1)).await.unwrap();
        assert!(storage.set_recalled(message.id).await.unwrap());
        assert!(!storage.set_recalled(message.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_online_agents_directory() {
        let storage = MemoryStorage::new();
        storage.insert_user(user(1, UserRole::User)).await;
        storage.insert_user(user(2, UserRole::CustomerService)).await;
        storage.insert_user(user(3, UserRole::Admin)).await;
        storage.insert_user(user(4, UserRole::CustomerService)).await;

        storage.set_agent_status(UserId(2), AgentStatus::Online).await.unwrap();
        storage.set_agent_status(UserId(3), AgentStatus::Away).await.unwrap();
        storage.set_agent_status(UserId(4), AgentStatus::Busy).await.unwrap();

        let ids: Vec<UserId> = storage
            .list_online_agents()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec![UserId(2), UserId(3)]);
    }

    #[tokio::test]
    async fn test_purge_stale_connections() {
        let storage = MemoryStorage::new();
        for id in ["a", "b"] {
            storage
                .record_connection(ConnectionRecord {
                    connection_id: id.into(),
                    user_id: UserId(1),
                    device_id: None,
                    remote_addr: None,
                    user_agent: None,
                })
                .await
                .unwrap();
        }
        storage.backdate_connection(&"a".into(), Duration::minutes(5)).await;

        let purged = storage.purge_stale_connections(Duration::minutes(2)).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(storage.connection_record_count().await, 1);
    }

    #[tokio::test]
    async fn test_unavailable_switch() {
        let storage = MemoryStorage::new();
        storage.set_unavailable(true);
        assert!(matches!(storage.ping().await, Err(StorageError::Unavailable(_))));
        storage.set_unavailable(false);
        assert!(storage.ping().await.is_ok());
    }
}
