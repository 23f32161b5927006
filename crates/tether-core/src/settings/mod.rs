//! Configuration and secrets documents.

mod config;
pub mod legacy;
mod patch;
mod secrets;

pub use config::{
    ConfigDocument, CLOUD_URL_ENV, DEFAULT_CLOUD_URL, DEFAULT_LOCAL_HOST, DEFAULT_LOCAL_PORT,
    DOCUMENT_VERSION, LOCAL_HOST_ENV, LOCAL_PORT_ENV,
};
pub use legacy::{LegacyMigration, LegacySettings};
pub use patch::{merge_config, ConfigPatch};
pub use secrets::{SealedSecret, SecretKey, SecretsDocument, SecretsPatch};

use thiserror::Error;

/// Errors from editing settings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettingsError {
    #[error("Unknown setting: {0}")]
    UnknownKey(String),

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}
