//! # tether-core
//!
//! Synchronous building blocks of the Tether backbone.
//!
//! This crate holds everything that does not need an async runtime:
//! - the error taxonomy every component maps onto ([`ErrorClass`])
//! - the retry policy value and the shared severity level
//! - the config and secrets documents with their typed merge
//! - the encryption capability and the [`CredentialVault`] built on it
//! - credential redaction for logs and the error journal
//!
//! ## Key Guarantees
//!
//! 1. **Fail closed**: a secret that cannot be decrypted is an error, never an
//!    empty value
//! 2. **No plaintext at rest**: secrets are stored only as ciphertext
//! 3. **Atomic persistence**: documents are replaced by rename, never written
//!    in place
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_core::{ConfigDocument, ConfigPatch, CredentialVault, KeyringCipher, VaultPaths};
//!
//! let vault = CredentialVault::load(
//!     VaultPaths::new("/home/ada/.config/tether"),
//!     Arc::new(KeyringCipher::new("tether")),
//!     ConfigDocument::default_from_env(),
//! )?;
//! vault.update_config(&ConfigPatch::new().model("mistral"))?;
//! ```

pub mod cipher;
pub mod error;
pub mod redact;
pub mod settings;
pub mod types;
pub mod vault;

// Re-export main types at crate root
#[cfg(feature = "os-keyring")]
pub use cipher::KeyringCipher;
pub use cipher::{CipherError, MemoryCipher, SecretCipher, UnavailableCipher};
pub use error::{Classify, ErrorClass};
pub use redact::{redact, redact_context, REDACTED};
pub use settings::{
    merge_config, ConfigDocument, ConfigPatch, SealedSecret, SecretKey, SecretsDocument,
    SecretsPatch, SettingsError,
};
pub use types::{BackendMode, RetryPolicy, Severity};
pub use vault::{CredentialVault, VaultError, VaultPaths};
