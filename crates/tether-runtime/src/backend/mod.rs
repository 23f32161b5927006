//! Backend selection, health probing and the cloud session.

pub mod cloud;
mod launcher;
mod orchestrator;
mod transport;

pub use cloud::{CloudSession, SessionStatus};
pub use launcher::{CommandLauncher, LaunchError, LocalLauncher, NoopLauncher};
pub use orchestrator::BackendOrchestrator;
#[cfg(feature = "http")]
pub use transport::ReqwestTransport;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, TransportError};

use serde::Serialize;
use tether_core::{BackendMode, Classify, ConfigDocument, ErrorClass, VaultError};
use thiserror::Error;

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Unknown,
    ProbingLocal,
    ProbingCloud,
    LocalActive,
    CloudActive,
    BothUnreachable,
}

impl BackendState {
    pub fn is_healthy(self) -> bool {
        matches!(self, BackendState::LocalActive | BackendState::CloudActive)
    }
}

/// Which backend requests go to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendSelection {
    pub mode: BackendMode,
    pub endpoint: String,
}

impl BackendSelection {
    pub fn from_config(config: &ConfigDocument, mode: BackendMode) -> Self {
        Self {
            mode,
            endpoint: config.endpoint(mode).to_string(),
        }
    }
}

/// Last known truth, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connectivity {
    pub mode: BackendMode,
    pub healthy: bool,
    pub state: BackendState,
    pub endpoint: String,
}

/// Health endpoint for a backend.
pub fn health_url(config: &ConfigDocument, mode: BackendMode) -> String {
    match mode {
        BackendMode::Local => format!("{}/api/version", config.local_url),
        BackendMode::Cloud => format!("{}/health", config.cloud_url),
    }
}

/// Errors from calls routed to a backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Not logged in to the cloud backend")]
    NotLoggedIn,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Credential store: {0}")]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Unexpected response: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Error for a non-success response.
    pub fn from_response(response: &HttpResponse) -> Self {
        BackendError::Status {
            status: response.status,
            message: tether_core::redact(&response.error_message()),
        }
    }
}

impl Classify for BackendError {
    fn class(&self) -> ErrorClass {
        match self {
            BackendError::NotLoggedIn | BackendError::AuthenticationFailed(_) => {
                ErrorClass::Authentication
            }
            BackendError::Vault(e) => e.class(),
            BackendError::Transport(e) => e.class(),
            BackendError::Status { status, .. } => match status {
                401 | 403 => ErrorClass::Authentication,
                408 | 429 => ErrorClass::Transient,
                s if *s >= 500 => ErrorClass::Transient,
                _ => ErrorClass::Configuration,
            },
            BackendError::Protocol(_) => ErrorClass::Configuration,
        }
    }
}
