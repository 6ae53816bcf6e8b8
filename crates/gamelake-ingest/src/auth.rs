use async_trait::async_trait;

use crate::error::ExtractError;

/// Supplies the bearer token for upstream calls
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn get_valid_token(&self) -> Result<String, ExtractError>;
}

/// A fixed, pre-issued token
pub struct StaticAuthProvider {
    token: String,
}

impl StaticAuthProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn get_valid_token(&self) -> Result<String, ExtractError> {
        if self.token.trim().is_empty() {
            return Err(ExtractError::Auth("static token is empty".to_string()));
        }
        Ok(self.token.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token() {
        let auth = StaticAuthProvider::new("abc123");
        assert_eq!(auth.get_valid_token().await.unwrap(), "abc123");
    }

    #[tokio::test]
    async fn test_empty_token_is_rejected() {
        let auth = StaticAuthProvider::new("  ");
        assert!(matches!(
            auth.get_valid_token().await,
            Err(ExtractError::Auth(_))
        ));
    }
}
