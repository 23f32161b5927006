//! In-memory credential handling for the cloud session.
//!
//! The access token never leaves process memory. Wrapping it here ensures:
//!
//! - **No accidental logging**: `Debug` and `Display` print `[REDACTED]`
//! - **Explicit exposure**: the raw value is only reachable through
//!   [`AccessToken::bearer`] at the point where a request is built
//! - **Source tracking**: logs can say where a token came from without
//!   showing it

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;

/// Where an access token was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Password login
    Login,
    /// Refresh-token exchange
    Refresh,
    /// Provided programmatically
    Programmatic,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Login => write!(f, "login"),
            CredentialSource::Refresh => write!(f, "refresh"),
            CredentialSource::Programmatic => write!(f, "programmatic"),
        }
    }
}

/// Short-lived cloud access token.
pub struct AccessToken {
    value: SecretString,
    source: CredentialSource,
    issued_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, source: CredentialSource) -> Self {
        Self {
            value: SecretString::from(value.into()),
            source,
            issued_at: Utc::now(),
        }
    }

    /// Copy of the token for an outgoing request.
    pub fn bearer(&self) -> SecretString {
        SecretString::from(self.value.expose_secret().to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.value.expose_secret().is_empty()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("source", &self.source)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "access token from {} [REDACTED]", self.source)
    }
}
