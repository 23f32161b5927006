//! Typed partial updates and the merge that applies them.
//!
//! Precedence is field by field: a `Some` in the patch replaces the field,
//! `None` leaves it untouched. Optional document fields take
//! `Option<Option<T>>` so a patch can clear them (`Some(None)`). Feature flags
//! merge key by key.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::config::{trim_url, ConfigDocument};
use super::SettingsError;
use crate::types::{BackendMode, RetryPolicy, Severity};

/// Partial update of a [`ConfigDocument`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigPatch {
    pub local_url: Option<String>,
    pub cloud_url: Option<String>,
    pub backend: Option<BackendMode>,
    pub model: Option<String>,
    pub features: BTreeMap<String, bool>,
    pub max_turns: Option<u32>,
    pub theme: Option<String>,
    pub safe_directories: Option<Vec<PathBuf>>,
    pub probe_timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub approval_threshold: Option<Severity>,
    pub approval_history_capacity: Option<usize>,
    pub local_service_command: Option<Option<String>>,
    pub cloud_account: Option<Option<String>>,
}

/// Apply `patch` to `base` and return the merged document.
pub fn merge_config(base: &ConfigDocument, patch: &ConfigPatch) -> ConfigDocument {
    let mut doc = base.clone();

    if let Some(url) = &patch.local_url {
        doc.local_url = trim_url(url);
    }
    if let Some(url) = &patch.cloud_url {
        doc.cloud_url = trim_url(url);
    }
    if let Some(backend) = patch.backend {
        doc.backend = backend;
    }
    if let Some(model) = &patch.model {
        doc.model = model.clone();
    }
    for (name, enabled) in &patch.features {
        doc.features.insert(name.clone(), *enabled);
    }
    if let Some(max_turns) = patch.max_turns {
        doc.max_turns = max_turns;
    }
    if let Some(theme) = &patch.theme {
        doc.theme = theme.clone();
    }
    if let Some(dirs) = &patch.safe_directories {
        doc.safe_directories = dirs.clone();
    }
    if let Some(timeout) = patch.probe_timeout {
        doc.probe_timeout = timeout;
    }
    if let Some(retry) = &patch.retry {
        doc.retry = retry.clone();
    }
    if let Some(threshold) = patch.approval_threshold {
        doc.approval_threshold = threshold;
    }
    if let Some(capacity) = patch.approval_history_capacity {
        doc.approval_history_capacity = capacity;
    }
    if let Some(command) = &patch.local_service_command {
        doc.local_service_command = command.clone();
    }
    if let Some(account) = &patch.cloud_account {
        doc.cloud_account = account.clone();
    }

    doc
}

impl ConfigPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: BackendMode) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn local_url(mut self, url: impl Into<String>) -> Self {
        self.local_url = Some(url.into());
        self
    }

    pub fn cloud_url(mut self, url: impl Into<String>) -> Self {
        self.cloud_url = Some(url.into());
        self
    }

    pub fn feature(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.features.insert(name.into(), enabled);
        self
    }

    pub fn cloud_account(mut self, account: Option<String>) -> Self {
        self.cloud_account = Some(account);
        self
    }

    /// True when applying the patch cannot change anything.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// True when the patch may change which backend should be active.
    pub fn affects_backend(&self) -> bool {
        self.backend.is_some() || self.local_url.is_some() || self.cloud_url.is_some()
    }

    /// Build a single-field patch from a `key` / `value` pair.
    ///
    /// Keys use the document's field names. Feature flags are addressed as
    /// `features.<name>`. An empty value clears optional fields.
    pub fn from_key_value(key: &str, value: &str) -> Result<Self, SettingsError> {
        let invalid = |reason: String| SettingsError::InvalidValue {
            key: key.to_string(),
            reason,
        };
        let value = value.trim();
        let mut patch = Self::default();

        if let Some(flag) = key.strip_prefix("features.") {
            if flag.is_empty() {
                return Err(SettingsError::UnknownKey(key.to_string()));
            }
            let enabled = parse_bool(value).ok_or_else(|| invalid("expected true or false".into()))?;
            patch.features.insert(flag.to_string(), enabled);
            return Ok(patch);
        }

        match key {
            "local_url" => patch.local_url = Some(parse_url(value).map_err(invalid)?),
            "cloud_url" => patch.cloud_url = Some(parse_url(value).map_err(invalid)?),
            "backend" => patch.backend = Some(value.parse().map_err(invalid)?),
            "model" => {
                if value.is_empty() {
                    return Err(invalid("model cannot be empty".into()));
                }
                patch.model = Some(value.to_string());
            }
            "max_turns" => {
                patch.max_turns = Some(value.parse().map_err(|_| invalid("expected an integer".into()))?)
            }
            "theme" => patch.theme = Some(value.to_string()),
            "safe_directories" => {
                patch.safe_directories = Some(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(PathBuf::from)
                        .collect(),
                )
            }
            "probe_timeout" => {
                patch.probe_timeout =
                    Some(humantime::parse_duration(value).map_err(|e| invalid(e.to_string()))?)
            }
            "approval_threshold" => patch.approval_threshold = Some(value.parse().map_err(invalid)?),
            "approval_history_capacity" => {
                patch.approval_history_capacity =
                    Some(value.parse().map_err(|_| invalid("expected an integer".into()))?)
            }
            "local_service_command" => {
                patch.local_service_command =
                    Some(Some(value.to_string()).filter(|v| !v.is_empty()))
            }
            _ => return Err(SettingsError::UnknownKey(key.to_string())),
        }

        Ok(patch)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn parse_url(value: &str) -> Result<String, String> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(trim_url(value))
    } else {
        Err("URL must start with http:// or https://".to_string())
    }
}
