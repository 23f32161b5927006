//! The host facade: one object the UI layer talks to.
//!
//! Wires the vault, retry engine, backend orchestrator, cloud session and
//! approval gate together. Built with [`Host::builder`] so tests can inject a
//! scripted transport and launcher.

use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    BackendMode, Classify, ConfigDocument, ConfigPatch, CredentialVault, ErrorClass, RetryPolicy,
    SecretCipher, Severity, SettingsError, VaultError, VaultPaths,
};
use thiserror::Error;

use crate::approval::{ApprovalError, ApprovalGate, ApprovalRequest, Decision};
use crate::backend::{
    BackendError, BackendOrchestrator, CloudSession, CommandLauncher, Connectivity,
    HttpTransport, LocalLauncher, NoopLauncher, SessionStatus, TransportError,
};
use crate::chat::{self, ChatMessage, ChatReply};
use crate::retry::{CallContext, RetryEngine};

/// Resolver name recorded for approvals rejected by [`Host::shutdown`].
pub const SHUTDOWN_RESOLVER: &str = "host-shutdown";

/// Errors surfaced by the host.
#[derive(Error, Debug)]
pub enum HostError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Host is missing {0}")]
    NotConfigured(&'static str),
}

impl Classify for HostError {
    fn class(&self) -> ErrorClass {
        match self {
            HostError::Vault(e) => e.class(),
            HostError::Backend(e) => e.class(),
            HostError::Approval(e) => e.class(),
            HostError::Transport(e) => e.class(),
            HostError::Settings(_) | HostError::NotConfigured(_) => ErrorClass::Configuration,
        }
    }
}

pub struct Host {
    vault: Arc<CredentialVault>,
    transport: Arc<dyn HttpTransport>,
    retry: Arc<RetryEngine>,
    orchestrator: Arc<BackendOrchestrator>,
    session: CloudSession,
    approvals: Arc<ApprovalGate>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("vault", &self.vault.paths())
            .field("transport", &self.transport.name())
            .field("orchestrator", &self.orchestrator)
            .field("approvals", &self.approvals)
            .finish()
    }
}

impl Host {
    pub fn builder() -> HostBuilder {
        HostBuilder::new()
    }

    /// Startup election. Never fails; see [`Connectivity`] for the outcome.
    pub async fn start(&self) -> Connectivity {
        self.orchestrator.elect().await
    }

    pub fn connectivity(&self) -> Connectivity {
        self.orchestrator.connectivity()
    }

    /// Send a chat to the selected backend.
    ///
    /// An unhealthy or unknown backend is re-elected first. A transient
    /// failure that survives every retry marks the backend unhealthy. Cloud
    /// requests refresh the access token at most once per call.
    pub async fn send_chat(
        &self,
        messages: &[ChatMessage],
        model_hint: Option<&str>,
    ) -> Result<ChatReply, HostError> {
        if !self.orchestrator.state().is_healthy() {
            self.orchestrator.elect().await;
        }

        let config = self.vault.config();
        let mode = self.orchestrator.selection().mode;
        let model = model_hint.unwrap_or(&config.model);
        let context = CallContext::new("chat", "send_chat")
            .with("backend", mode)
            .with("model", model);

        let result = match mode {
            BackendMode::Local => {
                self.retry
                    .execute_classified(&context, || async {
                        let request = chat::build_request(&config, mode, messages, model);
                        let response = self.transport.send(request).await?;
                        chat::parse_reply(mode, response)
                    })
                    .await
            }
            BackendMode::Cloud => {
                let request = chat::build_request(&config, mode, messages, model);
                self.session
                    .send_with_retry(&context, request)
                    .await
                    .and_then(|response| chat::parse_reply(mode, response))
            }
        };

        match result {
            Ok(reply) => Ok(reply),
            Err(e) => {
                if e.is_transient() {
                    self.orchestrator.mark_unhealthy(mode);
                }
                Err(e.into())
            }
        }
    }

    pub fn settings(&self) -> ConfigDocument {
        self.vault.config()
    }

    /// Apply a partial update. Backend-related changes trigger a re-election.
    pub async fn update_settings(&self, patch: &ConfigPatch) -> Result<ConfigDocument, HostError> {
        let updated = self.vault.update_config(patch)?;
        if patch.affects_backend() {
            tracing::info!(backend = %updated.backend, "Backend settings changed, re-electing");
            self.orchestrator.elect().await;
        }
        Ok(updated)
    }

    /// Update one setting given as a `key value` pair.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<ConfigDocument, HostError> {
        let patch = ConfigPatch::from_key_value(key, value)?;
        self.update_settings(&patch).await
    }

    pub async fn login(&self, email: &str, password: &SecretString) -> Result<SessionStatus, HostError> {
        Ok(self.session.login(email, password).await?)
    }

    pub async fn logout(&self) -> Result<(), HostError> {
        Ok(self.session.logout().await?)
    }

    pub fn session_status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn list_pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.approvals.pending()
    }

    pub fn resolve_approval(&self, id: u64, decision: Decision, resolver: &str) -> bool {
        self.approvals.resolve(id, decision, resolver)
    }

    pub fn approval_history(&self, limit: usize) -> Vec<ApprovalRequest> {
        self.approvals.history(limit)
    }

    /// Gate an operation on user sign-off.
    pub async fn authorize(
        &self,
        operation: &str,
        description: &str,
        risk: Severity,
        timeout: Duration,
    ) -> Result<(), HostError> {
        Ok(self
            .approvals
            .authorize(operation, description, risk, timeout)
            .await?)
    }

    pub fn retry_engine(&self) -> &RetryEngine {
        &self.retry
    }

    pub fn approvals(&self) -> &ApprovalGate {
        &self.approvals
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    /// Reject every pending approval so no waiter is left hanging.
    pub fn shutdown(&self) {
        let rejected = self.approvals.shutdown(SHUTDOWN_RESOLVER);
        tracing::info!(rejected, "Host shut down");
    }
}

/// Builder for [`Host`].
pub struct HostBuilder {
    vault: Option<Arc<CredentialVault>>,
    paths: Option<VaultPaths>,
    cipher: Option<Arc<dyn SecretCipher>>,
    defaults: Option<ConfigDocument>,
    seed_refresh_token: Option<SecretString>,
    transport: Option<Arc<dyn HttpTransport>>,
    launcher: Option<Arc<dyn LocalLauncher>>,
    retry_policy: Option<RetryPolicy>,
    approvals: Option<Arc<ApprovalGate>>,
}

impl HostBuilder {
    pub fn new() -> Self {
        Self {
            vault: None,
            paths: None,
            cipher: None,
            defaults: None,
            seed_refresh_token: None,
            transport: None,
            launcher: None,
            retry_policy: None,
            approvals: None,
        }
    }

    /// Use an already loaded vault.
    pub fn vault(mut self, vault: Arc<CredentialVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Load the vault from this directory at build time.
    pub fn paths(mut self, paths: VaultPaths) -> Self {
        self.paths = Some(paths);
        self
    }

    pub fn cipher(mut self, cipher: Arc<dyn SecretCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Defaults for a missing or corrupt config document.
    pub fn defaults(mut self, defaults: ConfigDocument) -> Self {
        self.defaults = Some(defaults);
        self
    }

    /// Refresh token stored on first run only.
    pub fn seed_refresh_token(mut self, token: SecretString) -> Self {
        self.seed_refresh_token = Some(token);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn LocalLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Override the policy from the config document.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn approval_gate(mut self, gate: Arc<ApprovalGate>) -> Self {
        self.approvals = Some(gate);
        self
    }

    pub fn build(self) -> Result<Host, HostError> {
        let vault = match (self.vault, self.paths) {
            (Some(vault), _) => vault,
            (None, Some(paths)) => {
                let cipher = self.cipher.unwrap_or_else(default_cipher);
                let defaults = self.defaults.unwrap_or_else(ConfigDocument::default_from_env);
                Arc::new(CredentialVault::load_with_seed(
                    paths,
                    cipher,
                    defaults,
                    self.seed_refresh_token,
                )?)
            }
            (None, None) => return Err(HostError::NotConfigured("a vault or vault paths")),
        };
        let config = vault.config();

        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };

        let launcher: Arc<dyn LocalLauncher> = match self.launcher {
            Some(launcher) => launcher,
            None => match config
                .local_service_command
                .as_deref()
                .and_then(CommandLauncher::from_command_line)
            {
                Some(launcher) => Arc::new(launcher),
                None => Arc::new(NoopLauncher),
            },
        };

        let retry = Arc::new(RetryEngine::new(
            self.retry_policy.unwrap_or_else(|| config.retry.clone()),
        ));
        let approvals = self.approvals.unwrap_or_else(|| {
            Arc::new(ApprovalGate::new(
                config.approval_threshold,
                config.approval_history_capacity,
            ))
        });

        if !vault.encryption_available() {
            tracing::warn!("OS encryption unavailable; secrets cannot be stored");
        }

        let orchestrator = Arc::new(BackendOrchestrator::new(
            Arc::clone(&vault),
            Arc::clone(&transport),
            launcher,
            Arc::clone(&retry),
        ));
        let session = CloudSession::new(Arc::clone(&vault), Arc::clone(&transport), Arc::clone(&retry));

        Ok(Host {
            vault,
            transport,
            retry,
            orchestrator,
            session,
            approvals,
        })
    }
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "os-keyring")]
fn default_cipher() -> Arc<dyn SecretCipher> {
    Arc::new(tether_core::KeyringCipher::new("tether"))
}

#[cfg(not(feature = "os-keyring"))]
fn default_cipher() -> Arc<dyn SecretCipher> {
    Arc::new(tether_core::UnavailableCipher)
}

#[cfg(feature = "http")]
fn default_transport() -> Result<Arc<dyn HttpTransport>, HostError> {
    Ok(Arc::new(crate::backend::ReqwestTransport::new()?))
}

#[cfg(not(feature = "http"))]
fn default_transport() -> Result<Arc<dyn HttpTransport>, HostError> {
    Err(HostError::NotConfigured("an HTTP transport"))
}
