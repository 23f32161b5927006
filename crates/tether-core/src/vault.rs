//! Credential Vault: the plaintext config document and the encrypted secrets
//! document, persisted write-through.
//!
//! ## Guarantees
//!
//! - Every update persists the whole document before the in-memory copy
//!   changes. Writes go to a temp file in the same directory which is then
//!   renamed over the target, so the on-disk state is always one complete
//!   generation.
//! - Updates to the same document are serialized by a per-document mutex.
//! - Secrets are only stored as ciphertext. If the cipher is unavailable,
//!   storing or reading fails with [`VaultError::EncryptionUnavailable`]
//!   instead of falling back to plaintext.
//! - A secret that fails to decrypt is reported as
//!   [`VaultError::DecryptFailed`], never as an absent value.
//! - Loading never fails because a document is corrupted. The damaged file
//!   is moved aside to `*.corrupt` and defaults take its place.

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::cipher::{CipherError, SecretCipher};
use crate::error::{Classify, ErrorClass};
use crate::settings::legacy::{LEGACY_FILE_NAME, MIGRATED_SUFFIX};
use crate::settings::{
    merge_config, ConfigDocument, ConfigPatch, LegacySettings, SealedSecret, SecretKey,
    SecretsDocument, SecretsPatch,
};

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const SECRETS_FILE_NAME: &str = "secrets.json";
const CORRUPT_SUFFIX: &str = "corrupt";

/// Errors from the vault.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Encryption is unavailable; secrets cannot be stored or read")]
    EncryptionUnavailable,

    #[error("Secret '{0}' could not be decrypted")]
    DecryptFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptFailed(String),

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize {document}: {source}")]
    Serialize {
        document: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl VaultError {
    fn from_cipher(error: CipherError, key: &SecretKey) -> Self {
        match error {
            CipherError::Unavailable => VaultError::EncryptionUnavailable,
            CipherError::EncryptFailed(reason) => VaultError::EncryptFailed(reason),
            CipherError::DecryptFailed => VaultError::DecryptFailed(key.to_string()),
        }
    }
}

impl Classify for VaultError {
    fn class(&self) -> ErrorClass {
        match self {
            VaultError::DecryptFailed(_) => ErrorClass::Corruption,
            VaultError::EncryptionUnavailable
            | VaultError::EncryptFailed(_)
            | VaultError::Write { .. }
            | VaultError::Serialize { .. } => ErrorClass::Configuration,
        }
    }
}

/// File locations of one install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultPaths {
    dir: PathBuf,
}

impl VaultPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE_NAME)
    }

    pub fn secrets(&self) -> PathBuf {
        self.dir.join(SECRETS_FILE_NAME)
    }

    pub fn legacy(&self) -> PathBuf {
        self.dir.join(LEGACY_FILE_NAME)
    }

    pub fn migrated_legacy(&self) -> PathBuf {
        with_suffix(&self.legacy(), MIGRATED_SUFFIX)
    }
}

/// Holds both documents for the lifetime of the process.
pub struct CredentialVault {
    paths: VaultPaths,
    cipher: Arc<dyn SecretCipher>,
    config: Mutex<ConfigDocument>,
    secrets: Mutex<SecretsDocument>,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("paths", &self.paths)
            .field("cipher", &self.cipher.name())
            .finish()
    }
}

impl CredentialVault {
    /// Load the document pair, migrating and writing back as needed.
    pub fn load(
        paths: VaultPaths,
        cipher: Arc<dyn SecretCipher>,
        defaults: ConfigDocument,
    ) -> Result<Self, VaultError> {
        Self::load_with_seed(paths, cipher, defaults, None)
    }

    /// Like [`load`](Self::load), seeding `seed_refresh_token` on first run
    /// when no refresh token was migrated.
    pub fn load_with_seed(
        paths: VaultPaths,
        cipher: Arc<dyn SecretCipher>,
        defaults: ConfigDocument,
        seed_refresh_token: Option<SecretString>,
    ) -> Result<Self, VaultError> {
        fs::create_dir_all(paths.dir()).map_err(|source| VaultError::Write {
            path: paths.dir().to_path_buf(),
            source,
        })?;

        let config_path = paths.config();
        let secrets_path = paths.secrets();
        let first_run = !config_path.exists() && !secrets_path.exists();

        let mut config = read_document(&config_path, "config", |raw| {
            let value: serde_json::Value = serde_json::from_str(raw)?;
            ConfigDocument::overlay(&defaults, value)
        })
        .unwrap_or_else(|| defaults.clone());

        let mut secrets = read_document(&secrets_path, "secrets", |raw| {
            serde_json::from_str::<SecretsDocument>(raw)
        })
        .unwrap_or_default();

        let mut migrated_legacy = false;
        if first_run {
            let mut legacy_token = None;
            if paths.legacy().exists() {
                migrated_legacy = true;
                match fs::read_to_string(paths.legacy())
                    .map_err(|e| e.to_string())
                    .and_then(|raw| LegacySettings::from_json(&raw).map_err(|e| e.to_string()))
                {
                    Ok(legacy) => {
                        let migration = legacy.into_migration();
                        config = merge_config(&config, &migration.patch);
                        legacy_token = migration.refresh_token.map(SecretString::from);
                        tracing::info!(path = %paths.legacy().display(), "Migrated legacy settings");
                    }
                    Err(error) => {
                        tracing::warn!(
                            path = %paths.legacy().display(),
                            error = %error,
                            "Legacy settings unreadable, skipping migration"
                        );
                    }
                }
            }

            if let Some(token) = legacy_token.or(seed_refresh_token) {
                match cipher.encrypt(token.expose_secret()) {
                    Ok(sealed) => secrets.refresh_token = Some(SealedSecret::new(sealed)),
                    Err(error) => tracing::warn!(
                        error = %error,
                        "Could not encrypt initial refresh token; starting logged out"
                    ),
                }
            }
        }

        write_document(&config_path, &config, "config", false)?;
        write_document(&secrets_path, &secrets, "secrets", true)?;

        if migrated_legacy {
            if let Err(error) = fs::rename(paths.legacy(), paths.migrated_legacy()) {
                tracing::warn!(error = %error, "Could not rename migrated legacy settings");
            }
        }

        tracing::debug!(
            dir = %paths.dir().display(),
            cipher = cipher.name(),
            first_run,
            "Vault loaded"
        );

        Ok(Self {
            paths,
            cipher,
            config: Mutex::new(config),
            secrets: Mutex::new(secrets),
        })
    }

    /// Snapshot of both documents.
    pub fn documents(&self) -> (ConfigDocument, SecretsDocument) {
        (self.config(), self.secrets())
    }

    pub fn config(&self) -> ConfigDocument {
        self.config.lock().clone()
    }

    /// Ciphertext view of the secrets document.
    pub fn secrets(&self) -> SecretsDocument {
        self.secrets.lock().clone()
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    pub fn encryption_available(&self) -> bool {
        self.cipher.is_available()
    }

    /// Merge `patch` into the config document and persist it.
    pub fn update_config(&self, patch: &ConfigPatch) -> Result<ConfigDocument, VaultError> {
        let mut current = self.config.lock();
        let next = merge_config(&current, patch);
        write_document(&self.paths.config(), &next, "config", false)?;
        *current = next.clone();
        Ok(next)
    }

    /// Encrypt and merge `patch` into the secrets document and persist it.
    pub fn update_secrets(&self, patch: SecretsPatch) -> Result<(), VaultError> {
        if patch.needs_encryption() && !self.cipher.is_available() {
            return Err(VaultError::EncryptionUnavailable);
        }

        let mut current = self.secrets.lock();
        let mut next = current.clone();
        for (key, plaintext) in patch.into_entries() {
            let sealed = match plaintext {
                Some(plaintext) => Some(SealedSecret::new(
                    self.cipher
                        .encrypt(plaintext.expose_secret())
                        .map_err(|e| VaultError::from_cipher(e, &key))?,
                )),
                None => None,
            };
            next.set(key, sealed);
        }

        write_document(&self.paths.secrets(), &next, "secrets", true)?;
        *current = next;
        Ok(())
    }

    /// Decrypt one secret. `Ok(None)` means it was never stored.
    pub fn read_secret(&self, key: &SecretKey) -> Result<Option<SecretString>, VaultError> {
        let sealed = match self.secrets.lock().get(key).cloned() {
            Some(sealed) => sealed,
            None => return Ok(None),
        };

        if !self.cipher.is_available() {
            return Err(VaultError::EncryptionUnavailable);
        }

        self.cipher
            .decrypt(sealed.as_str())
            .map(|plaintext| Some(SecretString::from(plaintext)))
            .map_err(|e| VaultError::from_cipher(e, key))
    }

    pub fn has_secret(&self, key: &SecretKey) -> bool {
        self.secrets.lock().contains(key)
    }
}

fn read_document<T, F>(path: &Path, document: &'static str, parse: F) -> Option<T>
where
    F: FnOnce(&str) -> Result<T, serde_json::Error>,
{
    if !path.exists() {
        return None;
    }

    let parsed = fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|raw| parse(&raw).map_err(|e| e.to_string()));

    match parsed {
        Ok(value) => Some(value),
        Err(error) => {
            let aside = with_suffix(path, CORRUPT_SUFFIX);
            tracing::warn!(
                document,
                path = %path.display(),
                moved_to = %aside.display(),
                error = %error,
                "Document unreadable, falling back to defaults"
            );
            if let Err(e) = fs::rename(path, &aside) {
                tracing::warn!(document, error = %e, "Could not move corrupted document aside");
            }
            None
        }
    }
}

fn write_document<T: Serialize>(
    path: &Path,
    value: &T,
    document: &'static str,
    private: bool,
) -> Result<(), VaultError> {
    let write_err = |source: std::io::Error| VaultError::Write {
        path: path.to_path_buf(),
        source,
    };

    let contents = serde_json::to_vec_pretty(value)
        .map_err(|source| VaultError::Serialize { document, source })?;

    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp_file = NamedTempFile::new_in(dir).map_err(write_err)?;

    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(temp_file.path(), fs::Permissions::from_mode(0o600))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    let _ = private;

    temp_file.write_all(&contents).map_err(write_err)?;
    temp_file.as_file_mut().sync_all().map_err(write_err)?;
    temp_file.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::MemoryCipher;
    use crate::types::BackendMode;
    use tempfile::TempDir;

    fn setup() -> (TempDir, VaultPaths, Arc<MemoryCipher>) {
        let dir = tempfile::tempdir().unwrap();
        let paths = VaultPaths::new(dir.path());
        (dir, paths, Arc::new(MemoryCipher::new()))
    }

    fn open(paths: &VaultPaths, cipher: &Arc<MemoryCipher>) -> CredentialVault {
        CredentialVault::load(paths.clone(), cipher.clone(), ConfigDocument::default()).unwrap()
    }

    #[test]
    fn test_first_load_writes_canonical_pair() {
        let (_dir, paths, cipher) = setup();
        let vault = open(&paths, &cipher);

        assert!(paths.config().exists());
        assert!(paths.secrets().exists());
        assert_eq!(vault.config(), ConfigDocument::default());
        assert_eq!(vault.secrets(), SecretsDocument::default());
    }

    #[test]
    fn test_update_config_persists() {
        let (_dir, paths, cipher) = setup();
        let vault = open(&paths, &cipher);

        let updated = vault
            .update_config(&ConfigPatch::new().backend(BackendMode::Cloud).model("mixtral"))
            .unwrap();
        assert_eq!(updated.backend, BackendMode::Cloud);

        let reopened = open(&paths, &cipher);
        assert_eq!(reopened.config().backend, BackendMode::Cloud);
        assert_eq!(reopened.config().model, "mixtral");
    }

    #[test]
    fn test_secret_roundtrip_and_ciphertext_at_rest() {
        let (_dir, paths, cipher) = setup();
        let vault = open(&paths, &cipher);

        vault
            .update_secrets(SecretsPatch::new().set_refresh_token("rt-plaintext-value"))
            .unwrap();

        let on_disk = fs::read_to_string(paths.secrets()).unwrap();
        assert!(!on_disk.contains("rt-plaintext-value"));

        let reopened = open(&paths, &cipher);
        let token = reopened.read_secret(&SecretKey::RefreshToken).unwrap().unwrap();
        assert_eq!(token.expose_secret(), "rt-plaintext-value");
    }

    #[test]
    fn test_missing_secret_is_none() {
        let (_dir, paths, cipher) = setup();
        let vault = open(&paths, &cipher);
        assert!(vault.read_secret(&SecretKey::RefreshToken).unwrap().is_none());
        assert!(!vault.has_secret(&SecretKey::RefreshToken));
    }

    #[test]
    fn test_foreign_ciphertext_fails_closed() {
        let (_dir, paths, cipher) = setup();
        fs::create_dir_all(paths.dir()).unwrap();
        fs::write(paths.config(), "{}").unwrap();
        fs::write(paths.secrets(), r#"{"refresh_token": "v1:not-ours"}"#).unwrap();

        let vault = open(&paths, &cipher);
        assert!(vault.has_secret(&SecretKey::RefreshToken));
        let err = vault.read_secret(&SecretKey::RefreshToken).unwrap_err();
        assert!(matches!(err, VaultError::DecryptFailed(ref key) if key == "refresh_token"));
        assert_eq!(err.class(), ErrorClass::Corruption);
    }

    #[test]
    fn test_corrupted_secrets_file_degrades_and_recovers() {
        let (_dir, paths, cipher) = setup();
        fs::create_dir_all(paths.dir()).unwrap();
        fs::write(paths.config(), "{}").unwrap();
        fs::write(paths.secrets(), "\u{0}\u{1} not json").unwrap();

        let vault = open(&paths, &cipher);
        assert_eq!(vault.config(), ConfigDocument::default());
        assert!(vault.read_secret(&SecretKey::RefreshToken).unwrap().is_none());
        assert!(paths.dir().join("secrets.json.corrupt").exists());

        vault
            .update_secrets(SecretsPatch::new().set_refresh_token("rt-fresh"))
            .unwrap();
        let reopened = open(&paths, &cipher);
        let token = reopened.read_secret(&SecretKey::RefreshToken).unwrap().unwrap();
        assert_eq!(token.expose_secret(), "rt-fresh");
    }

    #[test]
    fn test_corrupted_config_file_uses_defaults() {
        let (_dir, paths, cipher) = setup();
        fs::create_dir_all(paths.dir()).unwrap();
        fs::write(paths.config(), "{ this is not json").unwrap();
        fs::write(paths.secrets(), "{}").unwrap();

        let vault = open(&paths, &cipher);
        assert_eq!(vault.config(), ConfigDocument::default());
        let rewritten: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(paths.config()).unwrap()).unwrap();
        assert_eq!(rewritten["model"], "llama3.2");
    }

    #[test]
    fn test_bad_config_field_keeps_the_rest() {
        let (_dir, paths, cipher) = setup();
        fs::create_dir_all(paths.dir()).unwrap();
        fs::write(
            paths.config(),
            r#"{"model": "mixtral", "backend": "cloud", "max_turns": -3}"#,
        )
        .unwrap();
        fs::write(paths.secrets(), "{}").unwrap();

        let vault = open(&paths, &cipher);
        let config = vault.config();
        assert_eq!(config.model, "mixtral");
        assert_eq!(config.backend, BackendMode::Cloud);
        assert_eq!(config.max_turns, ConfigDocument::default().max_turns);
        assert!(!paths.dir().join("config.json.corrupt").exists());
    }

    #[test]
    fn test_encryption_unavailable_refuses_secrets() {
        let (_dir, paths, _) = setup();
        let cipher = Arc::new(MemoryCipher::unavailable());
        let vault = open(&paths, &cipher);

        let err = vault
            .update_secrets(SecretsPatch::new().set_refresh_token("rt-x"))
            .unwrap_err();
        assert!(matches!(err, VaultError::EncryptionUnavailable));
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert!(!fs::read_to_string(paths.secrets()).unwrap().contains("rt-x"));

        // Clearing needs no encryption.
        vault
            .update_secrets(SecretsPatch::new().clear_refresh_token())
            .unwrap();
    }

    #[test]
    fn test_read_with_unavailable_cipher_errors() {
        let (_dir, paths, cipher) = setup();
        let vault = open(&paths, &cipher);
        vault
            .update_secrets(SecretsPatch::new().set_refresh_token("rt"))
            .unwrap();

        cipher.set_available(false);
        assert!(matches!(
            vault.read_secret(&SecretKey::RefreshToken),
            Err(VaultError::EncryptionUnavailable)
        ));
    }

    #[test]
    fn test_legacy_migration_runs_once() {
        let (_dir, paths, cipher) = setup();
        fs::create_dir_all(paths.dir()).unwrap();
        fs::write(
            paths.legacy(),
            r#"{"useCloud": true, "model": "phi3", "refreshToken": "rt-legacy"}"#,
        )
        .unwrap();

        let vault = open(&paths, &cipher);
        assert_eq!(vault.config().backend, BackendMode::Cloud);
        assert_eq!(vault.config().model, "phi3");
        let token = vault.read_secret(&SecretKey::RefreshToken).unwrap().unwrap();
        assert_eq!(token.expose_secret(), "rt-legacy");
        assert!(!paths.legacy().exists());
        assert!(paths.migrated_legacy().exists());

        vault
            .update_config(&ConfigPatch::new().model("llama3.2"))
            .unwrap();

        // A legacy file that reappears is ignored once the pair exists.
        fs::write(paths.legacy(), r#"{"model": "phi3"}"#).unwrap();
        let reopened = open(&paths, &cipher);
        assert_eq!(reopened.config().model, "llama3.2");
        assert!(paths.legacy().exists());
    }

    #[test]
    fn test_unreadable_legacy_file_is_skipped() {
        let (_dir, paths, cipher) = setup();
        fs::create_dir_all(paths.dir()).unwrap();
        fs::write(paths.legacy(), "not json").unwrap();

        let vault = open(&paths, &cipher);
        assert_eq!(vault.config(), ConfigDocument::default());
        assert!(paths.migrated_legacy().exists());
    }

    #[test]
    fn test_seed_token_only_on_first_run() {
        let (_dir, paths, cipher) = setup();
        let vault = CredentialVault::load_with_seed(
            paths.clone(),
            cipher.clone(),
            ConfigDocument::default(),
            Some(SecretString::from("rt-seed".to_string())),
        )
        .unwrap();
        let token = vault.read_secret(&SecretKey::RefreshToken).unwrap().unwrap();
        assert_eq!(token.expose_secret(), "rt-seed");

        vault
            .update_secrets(SecretsPatch::new().clear_refresh_token())
            .unwrap();
        let reopened = CredentialVault::load_with_seed(
            paths.clone(),
            cipher.clone(),
            ConfigDocument::default(),
            Some(SecretString::from("rt-seed".to_string())),
        )
        .unwrap();
        assert!(reopened.read_secret(&SecretKey::RefreshToken).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_updates_do_not_interleave() {
        let (_dir, paths, cipher) = setup();
        let vault = Arc::new(open(&paths, &cipher));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let vault = Arc::clone(&vault);
                std::thread::spawn(move || {
                    vault
                        .update_config(&ConfigPatch::new().feature(format!("flag{}", i), true))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reopened = open(&paths, &cipher);
        for i in 0..8 {
            assert!(reopened.config().feature(&format!("flag{}", i)));
        }

        let leftovers: Vec<_> = fs::read_dir(paths.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_secrets_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, paths, cipher) = setup();
        let _vault = open(&paths, &cipher);
        let mode = fs::metadata(paths.secrets()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
