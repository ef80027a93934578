//! Bearer token capability consumed before every (re)connect.

use async_trait::async_trait;

use crate::error::ClientError;

/// Supplies the bearer token embedded in the entrypoint URL.
///
/// Called once per connection attempt so refreshed tokens are picked up by
/// reconnects. Returning `Ok(None)` or an error both lead to an
/// unauthenticated attempt.
#[async_trait]
pub trait TokenSource: Send + Sync + std::fmt::Debug {
    /// Returns the current token, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Auth`] when the token cannot be obtained.
    async fn token(&self) -> Result<Option<String>, ClientError>;
}

/// Token source returning a fixed value (or none).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    /// Always yields `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// Never yields a token.
    #[must_use]
    pub const fn none() -> Self {
        Self(None)
    }
}

impl From<Option<String>> for StaticToken {
    fn from(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()))
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<Option<String>, ClientError> {
        Ok(self.0.clone())
    }
}
