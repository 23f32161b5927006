//! The plaintext configuration document.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{humantime_duration, BackendMode, RetryPolicy, Severity};

/// Environment variable holding the cloud backend base URL.
pub const CLOUD_URL_ENV: &str = "TETHER_CLOUD_URL";
/// Environment variable holding the local backend host.
pub const LOCAL_HOST_ENV: &str = "TETHER_LOCAL_HOST";
/// Environment variable holding the local backend port.
pub const LOCAL_PORT_ENV: &str = "TETHER_LOCAL_PORT";

pub const DEFAULT_CLOUD_URL: &str = "https://api.tether.cloud";
pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";
pub const DEFAULT_LOCAL_PORT: u16 = 11434;

/// Current on-disk schema version of both documents.
pub const DOCUMENT_VERSION: u32 = 1;

/// Plaintext settings, persisted write-through on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigDocument {
    /// Schema version
    pub version: u32,

    /// Base URL of the local inference service
    pub local_url: String,

    /// Base URL of the cloud backend
    pub cloud_url: String,

    /// Preferred backend, echoed back after every election
    pub backend: BackendMode,

    /// Default model name
    pub model: String,

    /// Feature flags
    pub features: BTreeMap<String, bool>,

    /// Maximum tool turns per chat request
    pub max_turns: u32,

    /// UI theme name
    pub theme: String,

    /// Directories tools may touch without approval
    pub safe_directories: Vec<PathBuf>,

    /// Timeout applied to every health probe
    #[serde(with = "humantime_duration")]
    pub probe_timeout: Duration,

    /// Backoff policy for retried operations
    pub retry: RetryPolicy,

    /// Risk level at or above which operations need sign-off
    pub approval_threshold: Severity,

    /// Resolved approvals kept in memory
    pub approval_history_capacity: usize,

    /// Command line used to auto-start the local service
    pub local_service_command: Option<String>,

    /// Email of the signed-in cloud account (not a secret)
    pub cloud_account: Option<String>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            local_url: local_url(DEFAULT_LOCAL_HOST, DEFAULT_LOCAL_PORT),
            cloud_url: DEFAULT_CLOUD_URL.to_string(),
            backend: BackendMode::Local,
            model: "llama3.2".to_string(),
            features: BTreeMap::new(),
            max_turns: 10,
            theme: "system".to_string(),
            safe_directories: Vec::new(),
            probe_timeout: Duration::from_millis(2500),
            retry: RetryPolicy::default(),
            approval_threshold: Severity::High,
            approval_history_capacity: 100,
            local_service_command: Some("ollama serve".to_string()),
            cloud_account: None,
        }
    }
}

impl ConfigDocument {
    /// Built-in defaults with environment overrides applied.
    pub fn default_from_env() -> Self {
        Self::default_with(|key| std::env::var(key).ok())
    }

    /// Built-in defaults with overrides looked up through `lookup`.
    pub fn default_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut doc = Self::default();

        if let Some(url) = lookup(CLOUD_URL_ENV).filter(|v| !v.trim().is_empty()) {
            doc.cloud_url = trim_url(&url);
        }

        let host = lookup(LOCAL_HOST_ENV).filter(|v| !v.trim().is_empty());
        let port = lookup(LOCAL_PORT_ENV).and_then(|v| v.trim().parse::<u16>().ok());
        if host.is_some() || port.is_some() {
            doc.local_url = local_url(
                host.as_deref().unwrap_or(DEFAULT_LOCAL_HOST),
                port.unwrap_or(DEFAULT_LOCAL_PORT),
            );
        }

        doc
    }

    /// Deserialize `overlay` on top of `base`, field by field.
    ///
    /// Unknown keys are ignored. A key whose value does not fit its field is
    /// skipped and keeps the base value; every other key in `overlay` wins.
    pub fn overlay(base: &ConfigDocument, overlay: JsonValue) -> Result<Self, serde_json::Error> {
        let mut merged = serde_json::to_value(base)?;
        let JsonValue::Object(source) = overlay else {
            return serde_json::from_value(merged);
        };

        for (key, value) in source {
            let Some(target) = merged.as_object_mut() else {
                break;
            };
            let Some(previous) = target.insert(key.clone(), value) else {
                target.remove(&key);
                continue;
            };
            if let Err(error) = serde_json::from_value::<ConfigDocument>(merged.clone()) {
                tracing::warn!(field = %key, error = %error, "Ignoring invalid config field");
                if let Some(target) = merged.as_object_mut() {
                    target.insert(key, previous);
                }
            }
        }
        serde_json::from_value(merged)
    }

    /// Whether a feature flag is on.
    pub fn feature(&self, name: &str) -> bool {
        self.features.get(name).copied().unwrap_or(false)
    }

    /// Endpoint URL for a backend mode.
    pub fn endpoint(&self, mode: BackendMode) -> &str {
        match mode {
            BackendMode::Local => &self.local_url,
            BackendMode::Cloud => &self.cloud_url,
        }
    }
}

fn local_url(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}:{}", trim_url(host), port)
    } else {
        format!("http://{}:{}", host, port)
    }
}

pub(crate) fn trim_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
