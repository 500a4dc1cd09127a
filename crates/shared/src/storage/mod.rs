//! Durable storage contract for users, sessions, messages and connection records
//!
//! The messaging core only talks to storage through [`StorageGateway`].
//! Two implementations ship with the crate:
//! - [`PgStorage`]: PostgreSQL via sqlx, used in deployments
//! - [`MemoryStorage`]: in-process maps, used for development and tests

use async_trait::async_trait;
use time::Duration;

use crate::error::StorageResult;
use crate::types::{
    AgentStatus, AgentSummary, ChatSession, ConnectionId, ConnectionRecord, Message, MessageId,
    MessageStatus, NewMessage, SessionId, User, UserId,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PgStorage;

#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Cheap reachability check
    async fn ping(&self) -> StorageResult<()>;

    async fn get_user(&self, user_id: UserId) -> StorageResult<Option<User>>;

    async fn get_session(&self, session_id: &SessionId) -> StorageResult<Option<ChatSession>>;

    /// Insert a pending session. Returns false if the id already exists.
    async fn create_pending_session(
        &self,
        session_id: &SessionId,
        user_id: UserId,
    ) -> StorageResult<bool>;

    /// Atomically move a pending, unassigned session to active under `agent_id`.
    /// Returns false when the session is not pending (someone else won, or it closed).
    async fn compare_and_assign_session(
        &self,
        session_id: &SessionId,
        agent_id: UserId,
    ) -> StorageResult<bool>;

    /// Mark a session closed. Returns false if it was already closed.
    async fn close_session(&self, session_id: &SessionId) -> StorageResult<bool>;

    async fn list_pending_sessions(&self) -> StorageResult<Vec<ChatSession>>;

    /// Number of active sessions currently assigned to the agent
    async fn count_agent_sessions(&self, agent_id: UserId) -> StorageResult<i64>;

    /// Agents whose stored status is listed (online or away), in id order
    async fn list_online_agents(&self) -> StorageResult<Vec<AgentSummary>>;

    async fn set_agent_status(&self, agent_id: UserId, status: AgentStatus) -> StorageResult<()>;

    /// Persist a message with status `sent`
    async fn create_message(&self, message: NewMessage) -> StorageResult<Message>;

    async fn get_message(&self, message_id: MessageId) -> StorageResult<Option<Message>>;

    /// Most recent `limit` messages of a session, oldest first
    async fn recent_messages(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> StorageResult<Vec<Message>>;

    /// Flip the recalled flag. Returns true only if this call flipped it.
    async fn set_recalled(&self, message_id: MessageId) -> StorageResult<bool>;

    /// Advance the status. Returns true only if it moved forward.
    async fn set_status(&self, message_id: MessageId, status: MessageStatus)
        -> StorageResult<bool>;

    async fn record_connection(&self, record: ConnectionRecord) -> StorageResult<()>;

    async fn touch_connection(&self, connection_id: &ConnectionId) -> StorageResult<()>;

    async fn close_connection(&self, connection_id: &ConnectionId) -> StorageResult<()>;

    /// Delete connection records not touched within `older_than`. Returns rows removed.
    async fn purge_stale_connections(&self, older_than: Duration) -> StorageResult<u64>;
}
