//! Short-lived credentials consumed at connect time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

#[derive(Clone)]
pub struct Credential {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Checks the credential is usable for a handshake right now.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.token.trim().is_empty() {
            return Err(AuthError::Invalid("empty token".to_string()));
        }
        if self.is_expired(Utc::now()) {
            return Err(AuthError::Expired);
        }
        Ok(())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("credential rejected: {0}")]
    Invalid(String),
    #[error("credential expired")]
    Expired,
    #[error("identity provider unavailable: {0}")]
    Provider(String),
}

/// The identity collaborator. Called once before every connect attempt.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch_credential(&self) -> Result<Credential, AuthError>;
}

/// Hands out the same token every time. Useful for CLIs and tests.
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    credential: Credential,
}

impl StaticCredentialProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            credential: Credential::new(token),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn fetch_credential(&self) -> Result<Credential, AuthError> {
        Ok(self.credential.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn debug_output_hides_token() {
        let rendered = format!("{:?}", Credential::new("secret-token"));
        assert!(!rendered.contains("secret-token"));
    }

    #[test]
    fn expired_credential_fails_validation() {
        let cred = Credential::new("t").expiring_at(Utc::now() - Duration::seconds(5));
        assert!(matches!(cred.validate(), Err(AuthError::Expired)));
    }

    #[test]
    fn blank_token_is_invalid() {
        assert!(matches!(
            Credential::new("  ").validate(),
            Err(AuthError::Invalid(_))
        ));
        assert!(Credential::new("t").validate().is_ok());
    }
}
