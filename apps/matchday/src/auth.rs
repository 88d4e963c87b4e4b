//! Bearer credentials for the hub and REST calls. The token itself is issued
//! elsewhere; the client only needs somewhere to read it from.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("credential source unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Current bearer token; `None` means the calls go out anonymous. Asked
    /// again before every reconnect, so implementations may rotate it.
    async fn bearer_token(&self) -> Result<Option<String>, AuthError>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl From<Option<String>> for StaticToken {
    fn from(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.trim().is_empty()))
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn bearer_token(&self) -> Result<Option<String>, AuthError> {
        Ok(self.0.clone())
    }
}
