//! Authentication module for Helpline
//!
//! Token issuance lives outside the messaging core. The core only needs
//! to turn an opaque bearer token into an [`Identity`].

use async_trait::async_trait;
use helpline_shared::UserId;

pub mod jwt;

pub use jwt::{Claims, JwtError, JwtManager};

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub email: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token: {0}")]
    Invalid(String),
    #[error("Token subject does not match the claimed user")]
    SubjectMismatch,
}

impl From<JwtError> for AuthError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::Expired => AuthError::Expired,
            other => AuthError::Invalid(other.to_string()),
        }
    }
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Verify `token` and require that it was issued to `claimed`
pub async fn verify_for(
    verifier: &dyn TokenVerifier,
    token: &str,
    claimed: UserId,
) -> Result<Identity, AuthError> {
    let identity = verifier.verify(token).await?;
    if identity.user_id != claimed {
        tracing::warn!(
            token_user = %identity.user_id,
            claimed_user = %claimed,
            "Token subject mismatch"
        );
        return Err(AuthError::SubjectMismatch);
    }
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_verify_for_checks_subject() {
        let jwt = JwtManager::new("test-secret-key-at-least-32-chars!", 24);
        let token = jwt.generate_token(UserId(5), "five@example.com").unwrap();

        assert!(verify_for(&jwt, &token, UserId(5)).await.is_ok());
        assert!(matches!(
            verify_for(&jwt, &token, UserId(6)).await,
            Err(AuthError::SubjectMismatch)
        ));
    }
}
