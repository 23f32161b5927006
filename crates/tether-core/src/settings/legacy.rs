//! One-shot migration from the legacy single-file settings format.
//!
//! Older installs kept everything, refresh token included, in one camelCase
//! `tether.json`. The vault reads it once when no canonical pair exists,
//! turns it into a [`ConfigPatch`] plus an optional plaintext token, and
//! renames the file so the migration never runs twice.

use serde::Deserialize;
use std::path::PathBuf;

use super::patch::ConfigPatch;
use crate::types::BackendMode;

/// File name of the legacy settings file.
pub const LEGACY_FILE_NAME: &str = "tether.json";
/// Suffix appended to the legacy file once migrated.
pub const MIGRATED_SUFFIX: &str = "migrated";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LegacySettings {
    ollama_url: Option<String>,
    ollama_host: Option<String>,
    ollama_port: Option<u16>,
    cloud_url: Option<String>,
    use_cloud: Option<bool>,
    model: Option<String>,
    theme: Option<String>,
    max_turns: Option<u32>,
    safe_dirs: Option<Vec<PathBuf>>,
    email: Option<String>,
    refresh_token: Option<String>,
}

/// Result of reading a legacy file.
pub struct LegacyMigration {
    pub patch: ConfigPatch,
    pub refresh_token: Option<String>,
}

impl LegacySettings {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn into_migration(self) -> LegacyMigration {
        let mut patch = ConfigPatch::default();

        patch.local_url = self.ollama_url.or_else(|| match (self.ollama_host, self.ollama_port) {
            (None, None) => None,
            (host, port) => Some(format!(
                "http://{}:{}",
                host.as_deref().unwrap_or(super::config::DEFAULT_LOCAL_HOST),
                port.unwrap_or(super::config::DEFAULT_LOCAL_PORT)
            )),
        });
        patch.cloud_url = self.cloud_url;
        patch.backend = self.use_cloud.map(|cloud| {
            if cloud {
                BackendMode::Cloud
            } else {
                BackendMode::Local
            }
        });
        patch.model = self.model.filter(|m| !m.trim().is_empty());
        patch.theme = self.theme;
        patch.max_turns = self.max_turns;
        patch.safe_directories = self.safe_dirs;
        if self.email.is_some() {
            patch.cloud_account = Some(self.email);
        }

        LegacyMigration {
            patch,
            refresh_token: self.refresh_token.filter(|t| !t.trim().is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{merge_config, ConfigDocument};

    #[test]
    fn test_full_legacy_file() {
        let raw = r#"{
            "ollamaHost": "192.168.1.20",
            "ollamaPort": 11500,
            "useCloud": true,
            "model": "phi3",
            "maxTurns": 4,
            "safeDirs": ["/home/ada/projects"],
            "email": "ada@example.com",
            "refreshToken": "rt-legacy"
        }"#;

        let migration = LegacySettings::from_json(raw).unwrap().into_migration();
        let doc = merge_config(&ConfigDocument::default(), &migration.patch);

        assert_eq!(doc.local_url, "http://192.168.1.20:11500");
        assert_eq!(doc.backend, BackendMode::Cloud);
        assert_eq!(doc.model, "phi3");
        assert_eq!(doc.max_turns, 4);
        assert_eq!(doc.cloud_account.as_deref(), Some("ada@example.com"));
        assert_eq!(migration.refresh_token.as_deref(), Some("rt-legacy"));
    }

    #[test]
    fn test_explicit_url_wins_over_host_port() {
        let raw = r#"{"ollamaUrl": "http://gpu-box:11434", "ollamaPort": 1}"#;
        let migration = LegacySettings::from_json(raw).unwrap().into_migration();
        assert_eq!(migration.patch.local_url.as_deref(), Some("http://gpu-box:11434"));
    }

    #[test]
    fn test_empty_legacy_file_changes_nothing() {
        let migration = LegacySettings::from_json("{}").unwrap().into_migration();
        assert!(migration.patch.is_empty());
        assert!(migration.refresh_token.is_none());
    }

    #[test]
    fn test_blank_token_dropped() {
        let migration = LegacySettings::from_json(r#"{"refreshToken": "  "}"#)
            .unwrap()
            .into_migration();
        assert!(migration.refresh_token.is_none());
    }
}
