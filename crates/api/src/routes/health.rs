//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub storage: String,
    pub connections: usize,
    pub online_users: usize,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let storage_status = match state.storage.ping().await {
        Ok(()) => "healthy".to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "Health check: storage unreachable");
            "unhealthy".to_string()
        }
    };
    let stats = state.registry.stats().await;

    let overall_status = if storage_status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        overall_status,
        Json(HealthResponse {
            status: if overall_status == StatusCode::OK {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            storage: storage_status,
            connections: stats.connections,
            online_users: stats.online_users,
        }),
    )
}

/// Liveness probe (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtManager;
    use crate::config::Config;
    use helpline_shared::MemoryStorage;
    use std::sync::Arc;

    const SECRET: &str = "test-secret-key-at-least-32-chars!";

    fn state(storage: Arc<MemoryStorage>) -> AppState {
        AppState::new(
            Config::for_tests(SECRET),
            storage,
            Arc::new(JwtManager::new(SECRET, 24)),
        )
    }

    #[tokio::test]
    async fn test_health_reports_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let (status, Json(body)) = health(State(state(storage.clone()))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.storage, "healthy");
        assert_eq!(body.connections, 0);

        storage.set_unavailable(true);
        let (status, Json(body)) = health(State(state(storage))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "unhealthy");
    }
}
