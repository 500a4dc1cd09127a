//! PostgreSQL storage gateway

use async_trait::async_trait;
use sqlx::PgPool;
use time::Duration;

use super::StorageGateway;
use crate::error::StorageResult;
use crate::types::{
    AgentStatus, AgentSummary, ChatSession, ConnectionId, ConnectionRecord, Message, MessageId,
    MessageStatus, NewMessage, SessionId, User, UserId,
};

const MESSAGE_COLUMNS: &str = r#"
    id, session_id, sender_id, recipient_id, body, body_type, status,
    is_recalled, reply_to_id, created_at, delivered_at, read_at
"#;

const SESSION_COLUMNS: &str = r#"
    session_id, user_id, agent_id, status, created_at, started_at, closed_at
"#;

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StorageGateway for PgStorage {
    async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_user(&self, user_id: UserId) -> StorageResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, email, role FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn get_session(&self, session_id: &SessionId) -> StorageResult<Option<ChatSession>> {
        let session = sqlx::query_as::<_, ChatSession>(&format!(
            "SELECT {} FROM chat_sessions WHERE session_id = $1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn create_pending_session(
        &self,
        session_id: &SessionId,
        user_id: UserId,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO chat_sessions (session_id, user_id, status)
            VALUES ($1, $2, 'pending')
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_assign_session(
        &self,
        session_id: &SessionId,
        agent_id: UserId,
    ) -> StorageResult<bool> {
        // Single conditional UPDATE: concurrent accepts race on the row lock and
        // only one of them sees status = 'pending'.
        let result = sqlx::query(
            r#"
            UPDATE chat_sessions
            SET agent_id = $2, status = 'active', started_at = NOW()
            WHERE session_id = $1 AND status = 'pending' AND agent_id IS NULL
            "#,
        )
        .bind(session_id)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        let assigned = result.rows_affected() == 1;
        if !assigned {
            tracing::debug!(session_id = %session_id, agent_id = %agent_id, "Assign skipped, session not pending");
        }
        Ok(assigned)
    }

    async fn close_session(&self, session_id: &SessionId) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chat_sessions
            SET status = 'closed', closed_at = NOW()
            WHERE session_id = $1 AND status <> 'closed'
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_pending_sessions(&self) -> StorageResult<Vec<ChatSession>> {
        let sessions = sqlx::query_as::<_, ChatSession>(&format!(
            "SELECT {} FROM chat_sessions WHERE status = 'pending' ORDER BY created_at ASC",
            SESSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn count_agent_sessions(&self, agent_id: UserId) -> StorageResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM chat_sessions WHERE agent_id = $1 AND status = 'active'",
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list_online_agents(&self) -> StorageResult<Vec<AgentSummary>> {
        let agents = sqlx::query_as::<_, AgentSummary>(
            r#"
            SELECT id, username, agent_status AS status
            FROM users
            WHERE role IN ('customer_service', 'admin')
              AND agent_status IN ('online', 'away')
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(agents)
    }

    async fn set_agent_status(&self, agent_id: UserId, status: AgentStatus) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE users SET agent_status = $2, last_status_change = NOW() WHERE id = $1",
        )
        .bind(agent_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            tracing::warn!(agent_id = %agent_id, "Agent status update for unknown user");
            return Err(crate::error::StorageError::NotFound("user"));
        }
        Ok(())
    }

    async fn create_message(&self, message: NewMessage) -> StorageResult<Message> {
        let stored = sqlx::query_as::<_, Message>(&format!(
            r#"
            INSERT INTO messages (session_id, sender_id, recipient_id, body, body_type, reply_to_id, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'sent')
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(&message.session_id)
        .bind(message.sender_id)
        .bind(message.recipient_id)
        .bind(&message.body)
        .bind(message.body_type)
        .bind(message.reply_to_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(stored)
    }

    async fn get_message(&self, message_id: MessageId) -> StorageResult<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(&format!(
            "SELECT {} FROM messages WHERE id = $1",
            MESSAGE_COLUMNS
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(message)
    }

    async fn recent_messages(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> StorageResult<Vec<Message>> {
        let mut messages = sqlx::query_as::<_, Message>(&format!(
            "SELECT {} FROM messages WHERE session_id = $1 ORDER BY id DESC LIMIT $2",
            MESSAGE_COLUMNS
        ))
        .bind(session_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        messages.reverse();
        Ok(messages)
    }

    async fn set_recalled(&self, message_id: MessageId) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE messages SET is_recalled = TRUE WHERE id = $1 AND is_recalled = FALSE",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_status(
        &self,
        message_id: MessageId,
        status: MessageStatus,
    ) -> StorageResult<bool> {
        // The CASE ranks keep the write forward-only inside the database.
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = $2,
                delivered_at = COALESCE(delivered_at, NOW()),
                read_at = CASE WHEN $2 = 'read' THEN NOW() ELSE read_at END
            WHERE id = $1
              AND (CASE status WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 ELSE 2 END)
                < (CASE $2 WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 ELSE 2 END)
            "#,
        )
        .bind(message_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_connection(&self, record: ConnectionRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO websocket_connections
                (connection_id, user_id, device_id, remote_addr, user_agent, connected_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
            ON CONFLICT (connection_id) DO UPDATE SET
              user_id = $2,
              device_id = $3,
              remote_addr = $4,
              user_agent = $5,
              last_seen_at = NOW()
            "#,
        )
        .bind(&record.connection_id)
        .bind(record.user_id)
        .bind(&record.device_id)
        .bind(&record.remote_addr)
        .bind(&record.user_agent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_connection(&self, connection_id: &ConnectionId) -> StorageResult<()> {
        sqlx::query("UPDATE websocket_connections SET last_seen_at = NOW() WHERE connection_id = $1")
            .bind(connection_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close_connection(&self, connection_id: &ConnectionId) -> StorageResult<()> {
        sqlx::query("DELETE FROM websocket_connections WHERE connection_id = $1")
            .bind(connection_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_stale_connections(&self, older_than: Duration) -> StorageResult<u64> {
        let result = sqlx::query(
            "DELETE FROM websocket_connections WHERE last_seen_at < NOW() - make_interval(secs => $1)",
        )
        .bind(older_than.as_seconds_f64())
        .execute(&self.pool)
        .await?;
        let purged = result.rows_affected();
        if purged > 0 {
            tracing::debug!(purged, "Purged connection records");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, run_migrations};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_accept_race_has_one_winner() -> TestResult {
        let url = std::env::var("DATABASE_URL")?;
        let pool = create_pool(&url, 4).await?;
        run_migrations(&pool).await?;
        let storage = PgStorage::new(pool);

        let suffix = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
        let mut ids = Vec::new();
        for (name, role) in [("customer", "user"), ("agent-a", "customer_service"), ("agent-b", "admin")] {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO users (username, email, role) VALUES ($1, $2, $3) RETURNING id",
            )
            .bind(format!("{}-{}", name, suffix))
            .bind(format!("{}-{}@example.com", name, suffix))
            .bind(role)
            .fetch_one(storage.pool())
            .await?;
            ids.push(UserId(id));
        }

        let session = SessionId(format!("pg-{}", suffix));
        assert!(storage.create_pending_session(&session, ids[0]).await?);
        assert!(!storage.create_pending_session(&session, ids[0]).await?);
        assert!(storage
            .list_pending_sessions()
            .await?
            .iter()
            .any(|s| s.session_id == session));

        let (first, second) = tokio::join!(
            storage.compare_and_assign_session(&session, ids[1]),
            storage.compare_and_assign_session(&session, ids[2]),
        );
        assert!(first? ^ second?);
        assert!(storage.close_session(&session).await?);
        assert!(!storage.close_session(&session).await?);
        Ok(())
    }
}
