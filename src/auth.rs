//! Access tokens for the push channel handshake.
//!
//! The login flow that produces the bearer token lives outside this crate. The connection
//! layer only asks a [`TokenProvider`] for a fresh token before every connection attempt.

use async_trait::async_trait;
/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};
/// UUID type used for session and tracking identifiers.
pub use uuid::Uuid;

use crate::Result;
use crate::error::Error;

/// Supplies bearer tokens to the connection manager.
///
/// Implementations are responsible for caching and refreshing. An error fails the current
/// connection attempt only; the manager backs off and asks again on the next attempt.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn access_token(&self) -> Result<SecretString>;
}

/// A [`TokenProvider`] that always hands out the same token.
///
/// Useful for tests and for callers that refresh tokens out of band and rebuild the
/// [`crate::ws::ConnectionManager`] when the token rotates.
#[derive(Clone, Debug)]
pub struct StaticToken {
    token: SecretString,
}

impl StaticToken {
    #[must_use]
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<SecretString> {
        if self.token.expose_secret().is_empty() {
            return Err(Error::authentication("static token is empty"));
        }

        Ok(self.token.clone())
    }
}
