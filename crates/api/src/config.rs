//! Application configuration

use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database (in-memory storage when unset)
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // Authentication
    pub jwt_secret: String,

    // Presence
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub stale_connection_grace: Duration,

    // Messaging
    pub recall_window: Duration,
    pub status_retry_attempts: usize,
    pub status_retry_delay: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10),

            // Authentication
            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            // Presence
            heartbeat_interval: Duration::from_secs(parse_or("HEARTBEAT_INTERVAL_SECS", 30)),
            heartbeat_timeout: Duration::from_secs(parse_or("HEARTBEAT_TIMEOUT_SECS", 300)),
            stale_connection_grace: Duration::from_secs(parse_or(
                "STALE_CONNECTION_GRACE_SECS",
                120,
            )),

            // Messaging
            recall_window: Duration::from_secs(parse_or("RECALL_WINDOW_SECS", 120)),
            status_retry_attempts: parse_or("STATUS_RETRY_ATTEMPTS", 3),
            status_retry_delay: Duration::from_millis(parse_or("STATUS_RETRY_DELAY_MS", 100)),
        })
    }

    /// Configuration for tests and local tooling
    pub fn for_tests(jwt_secret: &str) -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            database_url: None,
            database_max_connections: 1,
            jwt_secret: jwt_secret.to_string(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(300),
            stale_connection_grace: Duration::from_secs(120),
            recall_window: Duration::from_secs(120),
            status_retry_attempts: 3,
            status_retry_delay: Duration::from_millis(100),
        }
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const SECRET: &str = "test-jwt-secret-must-be-at-least-32-characters-long";

    fn cleanup_config() {
        for key in [
            "DATABASE_URL",
            "JWT_SECRET",
            "HEARTBEAT_INTERVAL_SECS",
            "HEARTBEAT_TIMEOUT_SECS",
            "RECALL_WINDOW_SECS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_missing_jwt_secret() {
        cleanup_config();
        match Config::from_env() {
            Err(ConfigError::Missing("JWT_SECRET")) => {}
            other => panic!("Expected Missing error for JWT_SECRET, got: {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_weak_jwt_secret_rejected() {
        cleanup_config();
        env::set_var("JWT_SECRET", "short");
        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::WeakSecret(_))));
        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_defaults() {
        cleanup_config();
        env::set_var("JWT_SECRET", SECRET);
        let config = Config::from_env().unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(300));
        assert_eq!(config.stale_connection_grace, Duration::from_secs(120));
        assert_eq!(config.recall_window, Duration::from_secs(120));
        assert_eq!(config.status_retry_attempts, 3);
        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_overrides_and_bad_values() {
        cleanup_config();
        env::set_var("JWT_SECRET", SECRET);
        env::set_var("HEARTBEAT_INTERVAL_SECS", "5");
        env::set_var("HEARTBEAT_TIMEOUT_SECS", "not-a-number");
        env::set_var("DATABASE_URL", "");
        let config = Config::from_env().unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(300));
        assert!(config.database_url.is_none());
        cleanup_config();
    }
}
