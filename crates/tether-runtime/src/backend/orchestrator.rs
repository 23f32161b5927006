//! Backend failover orchestrator.
//!
//! # Election
//! - cloud preferred: probe cloud. Reachable → `CloudActive`. Unreachable →
//!   `BothUnreachable`, selection stays cloud. The user's choice is never
//!   overridden because the cloud is momentarily down.
//! - local preferred: probe local. Unreachable → ask the launcher to start
//!   it and re-probe once. Still unreachable → persist `backend = cloud`
//!   through the vault, then run the cloud branch.
//!
//! Elections are single-flight: concurrent callers await the one in flight.
//! A caller whose backend settings differ from the ones the running election
//! started from waits for it, then runs one more. The slot only holds a weak
//! handle, so an election nobody awaits any more is dropped.
//! Health probes are single attempts bounded by `probe_timeout`; the
//! in-flight request is dropped when the timeout fires.

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tether_core::{BackendMode, ConfigDocument, ConfigPatch, CredentialVault, Severity};

use super::launcher::LocalLauncher;
use super::transport::{HttpRequest, HttpTransport};
use super::{health_url, BackendSelection, BackendState, Connectivity};
use crate::retry::{CallContext, RetryEngine};

type Election = Shared<BoxFuture<'static, Connectivity>>;

/// The config fields an election's outcome depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ElectionKey {
    backend: BackendMode,
    local_url: String,
    cloud_url: String,
}

impl ElectionKey {
    fn of(config: &ConfigDocument) -> Self {
        Self {
            backend: config.backend,
            local_url: config.local_url.clone(),
            cloud_url: config.cloud_url.clone(),
        }
    }
}

struct InFlight {
    key: ElectionKey,
    election: WeakShared<BoxFuture<'static, Connectivity>>,
}

#[derive(Debug, Clone)]
struct Status {
    state: BackendState,
    selection: BackendSelection,
}

pub struct BackendOrchestrator {
    vault: Arc<CredentialVault>,
    transport: Arc<dyn HttpTransport>,
    launcher: Arc<dyn LocalLauncher>,
    retry: Arc<RetryEngine>,
    status: RwLock<Status>,
    inflight: Mutex<Option<InFlight>>,
}

impl std::fmt::Debug for BackendOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendOrchestrator")
            .field("status", &*self.status.read())
            .field("transport", &self.transport.name())
            .finish()
    }
}

impl BackendOrchestrator {
    pub fn new(
        vault: Arc<CredentialVault>,
        transport: Arc<dyn HttpTransport>,
        launcher: Arc<dyn LocalLauncher>,
        retry: Arc<RetryEngine>,
    ) -> Self {
        let config = vault.config();
        let status = Status {
            state: BackendState::Unknown,
            selection: BackendSelection::from_config(&config, config.backend),
        };
        Self {
            vault,
            transport,
            launcher,
            retry,
            status: RwLock::new(status),
            inflight: Mutex::new(None),
        }
    }

    pub fn state(&self) -> BackendState {
        self.status.read().state
    }

    pub fn selection(&self) -> BackendSelection {
        self.status.read().selection.clone()
    }

    pub fn connectivity(&self) -> Connectivity {
        let status = self.status.read();
        Connectivity {
            mode: status.selection.mode,
            healthy: status.state.is_healthy(),
            state: status.state,
            endpoint: status.selection.endpoint.clone(),
        }
    }

    /// Record that a routed request to `mode` gave up, so connectivity stops
    /// reporting a stale healthy state. The next election re-probes.
    pub fn mark_unhealthy(&self, mode: BackendMode) {
        let mut status = self.status.write();
        if status.selection.mode == mode && status.state.is_healthy() {
            tracing::warn!(backend = %mode, "Marking backend unhealthy");
            status.state = BackendState::BothUnreachable;
        }
    }

    /// Run an election, or join the one already running.
    ///
    /// The result always reflects the backend settings current when this
    /// call was made.
    pub async fn elect(self: &Arc<Self>) -> Connectivity {
        loop {
            let config = self.vault.config();
            let wanted = ElectionKey::of(&config);
            let (key, election) = self.join_or_start(config, &wanted);
            let connectivity = election.await;
            if key == wanted {
                return connectivity;
            }
            tracing::debug!("Backend settings changed during election, electing again");
        }
    }

    fn join_or_start(
        self: &Arc<Self>,
        config: ConfigDocument,
        wanted: &ElectionKey,
    ) -> (ElectionKey, Election) {
        let mut slot = self.inflight.lock();
        if let Some(inflight) = slot.as_ref() {
            if let Some(election) = inflight.election.upgrade() {
                return (inflight.key.clone(), election);
            }
        }

        let this = Arc::clone(self);
        let election = async move { this.run_election(config).await }
            .boxed()
            .shared();
        *slot = election.downgrade().map(|weak| InFlight {
            key: wanted.clone(),
            election: weak,
        });
        (wanted.clone(), election)
    }

    async fn run_election(self: Arc<Self>, config: ConfigDocument) -> Connectivity {
        tracing::debug!(preferred = %config.backend, "Backend election started");

        let connectivity = match config.backend {
            BackendMode::Cloud => self.elect_cloud(&config).await,
            BackendMode::Local => self.elect_local(&config).await,
        };

        self.inflight.lock().take();
        tracing::info!(
            backend = %connectivity.mode,
            state = ?connectivity.state,
            endpoint = %connectivity.endpoint,
            "Backend election finished"
        );
        connectivity
    }

    async fn elect_cloud(&self, config: &ConfigDocument) -> Connectivity {
        self.set(BackendState::ProbingCloud, config, BackendMode::Cloud);
        if self.probe(config, BackendMode::Cloud).await {
            return self.set(BackendState::CloudActive, config, BackendMode::Cloud);
        }

        tracing::warn!(endpoint = %config.cloud_url, "Cloud backend unreachable");
        self.retry.capture_error(
            &CallContext::new("backend", "probe_cloud")
                .severity(Severity::High)
                .with("endpoint", &config.cloud_url),
            "cloud health probe failed",
        );
        self.set(BackendState::BothUnreachable, config, BackendMode::Cloud)
    }

    async fn elect_local(&self, config: &ConfigDocument) -> Connectivity {
        self.set(BackendState::ProbingLocal, config, BackendMode::Local);
        if self.probe(config, BackendMode::Local).await {
            return self.set(BackendState::LocalActive, config, BackendMode::Local);
        }

        match self.launcher.start().await {
            Ok(true) => {
                if self.probe(config, BackendMode::Local).await {
                    return self.set(BackendState::LocalActive, config, BackendMode::Local);
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Local service auto-start failed"),
        }

        tracing::warn!(endpoint = %config.local_url, "Local backend unreachable, switching to cloud");
        self.retry.capture_error(
            &CallContext::new("backend", "probe_local")
                .severity(Severity::High)
                .with("endpoint", &config.local_url),
            "local backend unreachable and could not be started",
        );

        let config = match self
            .vault
            .update_config(&ConfigPatch::new().backend(BackendMode::Cloud))
        {
            Ok(updated) => updated,
            Err(e) => {
                tracing::error!(error = %e, "Could not persist cloud preference");
                self.retry.capture_error(
                    &CallContext::new("backend", "persist_preference").severity(Severity::High),
                    &e,
                );
                let mut fallback = config.clone();
                fallback.backend = BackendMode::Cloud;
                fallback
            }
        };
        self.elect_cloud(&config).await
    }

    async fn probe(&self, config: &ConfigDocument, mode: BackendMode) -> bool {
        let url = health_url(config, mode);
        let timeout = config.probe_timeout;
        let request = HttpRequest::get(&url).with_timeout(timeout);

        match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(Ok(response)) if response.is_success() => true,
            Ok(Ok(response)) => {
                tracing::debug!(%url, status = response.status, "Health probe rejected");
                false
            }
            Ok(Err(e)) => {
                tracing::debug!(%url, error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(%url, timeout = ?timeout, "Health probe timed out");
                false
            }
        }
    }

    fn set(&self, state: BackendState, config: &ConfigDocument, mode: BackendMode) -> Connectivity {
        let mut status = self.status.write();
        status.state = state;
        status.selection = BackendSelection::from_config(config, mode);
        Connectivity {
            mode,
            healthy: state.is_healthy(),
            state,
            endpoint: status.selection.endpoint.clone(),
        }
    }
}
