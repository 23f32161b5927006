//! Cloud session: the access/refresh token pair and authorized requests.
//!
//! The access token lives in memory only. The refresh token is stored
//! encrypted in the vault. A request rejected with 401/403 triggers exactly
//! one refresh and one resend; a second rejection is surfaced as
//! [`BackendError::AuthenticationFailed`].

use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_core::{ConfigPatch, CredentialVault, SecretKey, SecretsPatch, Severity};
use tokio::sync::Mutex as AsyncMutex;

use super::transport::{HttpRequest, HttpResponse, HttpTransport};
use super::BackendError;
use crate::credential::{AccessToken, CredentialSource};
use crate::retry::{CallContext, RetryEngine};

/// What the session can say about the stored credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionStatus {
    LoggedOut,
    LoggedIn { account: Option<String> },
    /// A refresh token is stored but cannot be read
    Corrupted { reason: String },
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

struct Held {
    token: AccessToken,
    generation: u64,
}

pub struct CloudSession {
    vault: Arc<CredentialVault>,
    transport: Arc<dyn HttpTransport>,
    retry: Arc<RetryEngine>,
    access: RwLock<Option<Held>>,
    generation: AtomicU64,
    refresh_lock: AsyncMutex<()>,
}

impl std::fmt::Debug for CloudSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudSession")
            .field("has_access_token", &self.access.read().is_some())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

impl CloudSession {
    pub fn new(
        vault: Arc<CredentialVault>,
        transport: Arc<dyn HttpTransport>,
        retry: Arc<RetryEngine>,
    ) -> Self {
        Self {
            vault,
            transport,
            retry,
            access: RwLock::new(None),
            generation: AtomicU64::new(0),
            refresh_lock: AsyncMutex::new(()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.vault.config().cloud_url, path)
    }

    fn current(&self) -> Option<(SecretString, u64)> {
        self.access
            .read()
            .as_ref()
            .map(|held| (held.token.bearer(), held.generation))
    }

    fn hold(&self, token: AccessToken) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(source = %token.source(), generation, "Holding new access token");
        *self.access.write() = Some(Held { token, generation });
    }

    pub fn has_access_token(&self) -> bool {
        self.access.read().is_some()
    }

    /// Exchange email and password for a token pair.
    pub async fn login(&self, email: &str, password: &SecretString) -> Result<SessionStatus, BackendError> {
        let url = self.url("/auth/login");
        let context = CallContext::new("cloud", "login").with("account", email);
        let body = json!({ "email": email, "password": password.expose_secret() });

        let response = self
            .retry
            .execute_classified(&context, || async {
                let response = self
                    .transport
                    .send(HttpRequest::post(&url, body.clone()))
                    .await?;
                token_response(response, "login rejected")
            })
            .await?;

        let refresh_token = response
            .refresh_token
            .ok_or_else(|| BackendError::Protocol("login response has no refresh_token".into()))?;

        self.vault
            .update_secrets(SecretsPatch::new().set_refresh_token(refresh_token))?;
        self.vault
            .update_config(&ConfigPatch::new().cloud_account(Some(email.to_string())))?;
        self.hold(AccessToken::new(response.access_token, CredentialSource::Login));

        tracing::info!(account = %email, "Logged in to cloud backend");
        Ok(SessionStatus::LoggedIn {
            account: Some(email.to_string()),
        })
    }

    /// Forget both tokens and the account.
    pub async fn logout(&self) -> Result<(), BackendError> {
        let _guard = self.refresh_lock.lock().await;
        *self.access.write() = None;
        self.vault
            .update_secrets(SecretsPatch::new().clear_refresh_token())?;
        self.vault
            .update_config(&ConfigPatch::new().cloud_account(None))?;
        tracing::info!("Logged out of cloud backend");
        Ok(())
    }

    /// Exchange the stored refresh token for a new pair.
    pub async fn refresh(&self) -> Result<(), BackendError> {
        self.refresh_after(None).await
    }

    /// Refresh unless another caller already replaced the token seen at
    /// `seen_generation`.
    async fn refresh_after(&self, seen_generation: Option<u64>) -> Result<(), BackendError> {
        let _guard = self.refresh_lock.lock().await;

        if let (Some(seen), Some((_, current))) = (seen_generation, self.current()) {
            if current != seen {
                tracing::debug!("Access token already refreshed by another request");
                return Ok(());
            }
        }

        let refresh_token = match self.vault.read_secret(&SecretKey::RefreshToken) {
            Ok(Some(token)) => token,
            Ok(None) => return Err(BackendError::NotLoggedIn),
            Err(e) => {
                self.retry.capture_error(
                    &CallContext::new("cloud", "read_refresh_token").severity(Severity::High),
                    &e,
                );
                return Err(BackendError::Vault(e));
            }
        };

        let url = self.url("/auth/refresh");
        let body = json!({ "refresh_token": refresh_token.expose_secret() });
        let response = self
            .retry
            .execute_classified(&CallContext::new("cloud", "refresh"), || async {
                let response = self
                    .transport
                    .send(HttpRequest::post(&url, body.clone()))
                    .await?;
                token_response(response, "refresh token rejected")
            })
            .await?;

        if let Some(rotated) = response.refresh_token {
            self.vault
                .update_secrets(SecretsPatch::new().set_refresh_token(rotated))?;
        }
        self.hold(AccessToken::new(response.access_token, CredentialSource::Refresh));
        tracing::info!("Cloud access token refreshed");
        Ok(())
    }

    /// Send `request` with the bearer token attached.
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, BackendError> {
        let (token, generation) = match self.current() {
            Some(current) => current,
            None => {
                self.refresh_after(None).await?;
                self.current().ok_or(BackendError::NotLoggedIn)?
            }
        };

        let first = self
            .transport
            .send(request.clone().with_bearer(&token))
            .await?;
        if !first.is_unauthorized() {
            return Ok(first);
        }

        tracing::info!(url = %request.url, status = first.status, "Access token rejected, refreshing once");
        self.refresh_after(Some(generation)).await?;
        let (token, _) = self.current().ok_or(BackendError::NotLoggedIn)?;

        let second = self.transport.send(request.with_bearer(&token)).await?;
        if second.is_unauthorized() {
            tracing::warn!(status = second.status, "Request rejected after refresh");
            return Err(BackendError::AuthenticationFailed(format!(
                "request rejected with HTTP {} after refresh",
                second.status
            )));
        }
        Ok(second)
    }

    /// Send `request`, retrying transient failures under `context`.
    ///
    /// Backoff wraps only the transport call. The token is refreshed at most
    /// once per call and never inside the backoff loop, so a rejection after
    /// that refresh is final. Non-success statuses other than 401/403 come
    /// back as [`BackendError::Status`].
    pub async fn send_with_retry(
        &self,
        context: &CallContext,
        request: HttpRequest,
    ) -> Result<HttpResponse, BackendError> {
        let mut refreshed = false;
        if self.current().is_none() {
            self.refresh_after(None).await?;
            refreshed = true;
        }

        loop {
            let (generation, response) = self
                .retry
                .execute_classified(context, || async {
                    let (token, generation) = self.current().ok_or(BackendError::NotLoggedIn)?;
                    let response = self
                        .transport
                        .send(request.clone().with_bearer(&token))
                        .await?;
                    if response.is_success() || response.is_unauthorized() {
                        Ok((generation, response))
                    } else {
                        Err(BackendError::from_response(&response))
                    }
                })
                .await?;

            if !response.is_unauthorized() {
                return Ok(response);
            }
            if refreshed {
                tracing::warn!(url = %request.url, status = response.status, "Request rejected after refresh");
                return Err(BackendError::AuthenticationFailed(format!(
                    "request rejected with HTTP {} after refresh",
                    response.status
                )));
            }

            tracing::info!(url = %request.url, status = response.status, "Access token rejected, refreshing once");
            self.refresh_after(Some(generation)).await?;
            refreshed = true;
        }
    }

    /// Report the stored credential state. Never fails.
    pub fn status(&self) -> SessionStatus {
        if !self.vault.has_secret(&SecretKey::RefreshToken) {
            return SessionStatus::LoggedOut;
        }
        match self.vault.read_secret(&SecretKey::RefreshToken) {
            Ok(Some(_)) => SessionStatus::LoggedIn {
                account: self.vault.config().cloud_account,
            },
            Ok(None) => SessionStatus::LoggedOut,
            Err(e) => SessionStatus::Corrupted {
                reason: e.to_string(),
            },
        }
    }
}

fn token_response(response: HttpResponse, rejected: &str) -> Result<TokenResponse, BackendError> {
    if response.is_unauthorized() {
        return Err(BackendError::AuthenticationFailed(rejected.to_string()));
    }
    if !response.is_success() {
        return Err(BackendError::from_response(&response));
    }
    serde_json::from_value(response.body)
        .map_err(|e| BackendError::Protocol(format!("token response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedTransport;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tether_core::{Classify, ConfigDocument, ErrorClass, MemoryCipher, RetryPolicy, VaultPaths};

    const LOGIN: &str = "https://api.tether.cloud/auth/login";
    const REFRESH: &str = "https://api.tether.cloud/auth/refresh";
    const CHAT: &str = "https://api.tether.cloud/v1/chat";

    struct Fixture {
        _dir: TempDir,
        vault: Arc<CredentialVault>,
        transport: Arc<ScriptedTransport>,
        session: CloudSession,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(
            CredentialVault::load(
                VaultPaths::new(dir.path()),
                Arc::new(MemoryCipher::new()),
                ConfigDocument::default(),
            )
            .unwrap(),
        );
        let transport = Arc::new(ScriptedTransport::new());
        let retry = Arc::new(RetryEngine::new(RetryPolicy::new(
            2,
            Duration::from_millis(10),
            Duration::from_millis(100),
            2.0,
        )));
        let session = CloudSession::new(Arc::clone(&vault), transport.clone(), retry);
        Fixture {
            _dir: dir,
            vault,
            transport,
            session,
        }
    }

    fn password() -> SecretString {
        SecretString::from("hunter2".to_string())
    }

    async fn logged_in(f: &Fixture) {
        f.transport.ok(
            LOGIN,
            json!({"access_token": "at-1", "refresh_token": "rt-1"}),
        );
        f.session.login("ada@example.com", &password()).await.unwrap();
    }

    #[tokio::test]
    async fn test_login_stores_encrypted_refresh_token() {
        let f = fixture();
        logged_in(&f).await;

        assert!(f.session.has_access_token());
        assert_eq!(
            f.vault.config().cloud_account.as_deref(),
            Some("ada@example.com")
        );
        let stored = f.vault.read_secret(&SecretKey::RefreshToken).unwrap().unwrap();
        assert_eq!(stored.expose_secret(), "rt-1");
        let on_disk = fs::read_to_string(f.vault.paths().secrets()).unwrap();
        assert!(!on_disk.contains("rt-1"));
        assert!(!on_disk.contains("at-1"));
        assert_eq!(
            f.session.status(),
            SessionStatus::LoggedIn {
                account: Some("ada@example.com".into())
            }
        );
    }

    #[tokio::test]
    async fn test_bad_password_is_not_retried() {
        let f = fixture();
        f.transport.status(LOGIN, 401);

        let err = f.session.login("ada@example.com", &password()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Authentication);
        assert_eq!(f.transport.calls(LOGIN), 1);
        assert_eq!(f.session.status(), SessionStatus::LoggedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_retries_server_errors() {
        let f = fixture();
        f.transport
            .status(LOGIN, 503)
            .ok(LOGIN, json!({"access_token": "at-1", "refresh_token": "rt-1"}));

        f.session.login("ada@example.com", &password()).await.unwrap();
        assert_eq!(f.transport.calls(LOGIN), 2);
    }

    #[tokio::test]
    async fn test_refresh_without_token_makes_no_network_call() {
        let f = fixture();
        let err = f.session.refresh().await.unwrap_err();
        assert!(matches!(err, BackendError::NotLoggedIn));
        assert_eq!(f.transport.calls(REFRESH), 0);
    }

    #[tokio::test]
    async fn test_refresh_with_corrupted_token_fails_closed() {
        let f = fixture();
        fs::write(f.vault.paths().secrets(), r#"{"refresh_token": "mem:999"}"#).unwrap();
        let vault = Arc::new(
            CredentialVault::load(
                f.vault.paths().clone(),
                Arc::new(MemoryCipher::new()),
                ConfigDocument::default(),
            )
            .unwrap(),
        );
        let session = CloudSession::new(
            Arc::clone(&vault),
            f.transport.clone(),
            Arc::new(RetryEngine::default()),
        );

        let err = session.refresh().await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Corruption);
        assert_eq!(f.transport.calls(REFRESH), 0);
        assert!(matches!(session.status(), SessionStatus::Corrupted { .. }));
    }

    #[tokio::test]
    async fn test_rejected_once_refreshes_once_and_retries_once() {
        let f = fixture();
        logged_in(&f).await;
        f.transport
            .status(CHAT, 401)
            .ok(CHAT, json!({"content": "hi"}));
        f.transport
            .ok(REFRESH, json!({"access_token": "at-2", "refresh_token": "rt-2"}));

        let response = f
            .session
            .send(HttpRequest::post(CHAT, json!({})))
            .await
            .unwrap();

        assert_eq!(response.body["content"], "hi");
        assert_eq!(f.transport.calls(REFRESH), 1);
        assert_eq!(
            f.transport.bearers(CHAT),
            vec![Some("at-1".to_string()), Some("at-2".to_string())]
        );
        let rotated = f.vault.read_secret(&SecretKey::RefreshToken).unwrap().unwrap();
        assert_eq!(rotated.expose_secret(), "rt-2");
    }

    #[tokio::test]
    async fn test_rejected_twice_surfaces_authentication_error() {
        let f = fixture();
        logged_in(&f).await;
        f.transport.status(CHAT, 401);
        f.transport
            .ok(REFRESH, json!({"access_token": "at-2"}));

        let err = f
            .session
            .send(HttpRequest::post(CHAT, json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::AuthenticationFailed(_)));
        assert_eq!(f.transport.calls(REFRESH), 1);
        assert_eq!(f.transport.calls(CHAT), 2);
        // No rotation offered, so the old refresh token stays.
        let kept = f.vault.read_secret(&SecretKey::RefreshToken).unwrap().unwrap();
        assert_eq!(kept.expose_secret(), "rt-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_with_retry_backs_off_without_refreshing() {
        let f = fixture();
        logged_in(&f).await;
        f.transport
            .status(CHAT, 503)
            .ok(CHAT, json!({"content": "hi"}));

        let response = f
            .session
            .send_with_retry(&CallContext::new("test", "chat"), HttpRequest::post(CHAT, json!({})))
            .await
            .unwrap();

        assert_eq!(response.body["content"], "hi");
        assert_eq!(f.transport.calls(CHAT), 2);
        assert_eq!(f.transport.calls(REFRESH), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_with_retry_refreshes_at_most_once() {
        let f = fixture();
        logged_in(&f).await;
        f.transport
            .status(CHAT, 401)
            .status(CHAT, 503)
            .status(CHAT, 401)
            .status(CHAT, 503);
        f.transport
            .ok(REFRESH, json!({"access_token": "at-2", "refresh_token": "rt-2"}));

        let err = f
            .session
            .send_with_retry(&CallContext::new("test", "chat"), HttpRequest::post(CHAT, json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::AuthenticationFailed(_)));
        assert_eq!(f.transport.calls(REFRESH), 1);
        assert_eq!(f.transport.calls(CHAT), 3);
    }

    #[tokio::test]
    async fn test_send_without_access_token_refreshes_first() {
        let f = fixture();
        f.vault
            .update_secrets(SecretsPatch::new().set_refresh_token("rt-seeded"))
            .unwrap();
        f.transport
            .ok(REFRESH, json!({"access_token": "at-9", "refresh_token": "rt-10"}));
        f.transport.ok(CHAT, json!({"content": "ok"}));

        f.session.send(HttpRequest::post(CHAT, json!({}))).await.unwrap();
        assert_eq!(f.transport.bearers(CHAT), vec![Some("at-9".to_string())]);
    }

    #[tokio::test]
    async fn test_logout_clears_everything() {
        let f = fixture();
        logged_in(&f).await;

        f.session.logout().await.unwrap();
        assert!(!f.session.has_access_token());
        assert!(!f.vault.has_secret(&SecretKey::RefreshToken));
        assert_eq!(f.vault.config().cloud_account, None);
        assert_eq!(f.session.status(), SessionStatus::LoggedOut);

        let err = f
            .session
            .send(HttpRequest::post(CHAT, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotLoggedIn));
    }

    #[tokio::test]
    async fn test_login_overwrites_corrupted_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VaultPaths::new(dir.path());
        fs::write(paths.config(), "{}").unwrap();
        fs::write(paths.secrets(), "garbage{{").unwrap();

        let vault = Arc::new(
            CredentialVault::load(paths, Arc::new(MemoryCipher::new()), ConfigDocument::default())
                .unwrap(),
        );
        assert_eq!(vault.config(), ConfigDocument::default());

        let transport = Arc::new(ScriptedTransport::new());
        transport.ok(LOGIN, json!({"access_token": "at-1", "refresh_token": "rt-new"}));
        let session = CloudSession::new(
            Arc::clone(&vault),
            transport,
            Arc::new(RetryEngine::default()),
        );

        session.login("ada@example.com", &password()).await.unwrap();
        let token = vault.read_secret(&SecretKey::RefreshToken).unwrap().unwrap();
        assert_eq!(token.expose_secret(), "rt-new");
    }
}
