//! Fixtures for unit tests

use std::sync::Arc;
use std::time::Duration;

use helpline_shared::events::ServerEvent;
use helpline_shared::{MemoryStorage, SessionId, StorageGateway, User, UserId, UserRole};
use tokio::sync::mpsc;

use crate::auth::JwtManager;
use crate::config::Config;
use crate::state::AppState;
use crate::websocket::connection::ConnectionMeta;

pub const SECRET: &str = "unit-test-secret-key-at-least-32-chars";

pub const CUSTOMER: UserId = UserId(1);
pub const AGENT: UserId = UserId(2);
pub const OTHER_AGENT: UserId = UserId(3);
pub const STRANGER: UserId = UserId(4);

pub struct Harness {
    pub storage: Arc<MemoryStorage>,
    pub jwt: JwtManager,
    pub state: AppState,
}

impl Harness {
    pub async fn new() -> Self {
        let storage = Arc::new(MemoryStorage::new());
        for (id, name, role) in [
            (CUSTOMER, "customer", UserRole::User),
            (AGENT, "agent", UserRole::CustomerService),
            (OTHER_AGENT, "other-agent", UserRole::CustomerService),
            (STRANGER, "stranger", UserRole::User),
        ] {
            storage
                .insert_user(User {
                    id,
                    username: name.to_string(),
                    email: format!("{}@example.com", name),
                    role,
                })
                .await;
        }
        let jwt = JwtManager::new(SECRET, 24);
        let state = AppState::new(Config::for_tests(SECRET), storage.clone(), Arc::new(jwt.clone()));
        Self {
            storage,
            jwt,
            state,
        }
    }

    pub fn token(&self, user: UserId) -> String {
        self.jwt
            .generate_token(user, &format!("user{}@example.com", user))
            .unwrap()
    }

    /// Register a connection straight in the registry
    pub async fn connect(&self, user: UserId, connection_id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .registry
            .register(user, connection_id.into(), None, ConnectionMeta::default(), tx)
            .await
            .unwrap();
        rx
    }

    /// Session already accepted by `agent`
    pub async fn active_session(&self, id: &str, customer: UserId, agent: UserId) -> SessionId {
        let session_id = SessionId::from(id);
        self.storage
            .create_pending_session(&session_id, customer)
            .await
            .unwrap();
        assert!(self
            .storage
            .compare_and_assign_session(&session_id, agent)
            .await
            .unwrap());
        session_id
    }
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

pub fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) {
    if let Ok(event) = rx.try_recv() {
        panic!("unexpected event: {:?}", event);
    }
}
