//! Encryption capability used by the vault.
//!
//! The vault never does cryptography itself. It talks to a [`SecretCipher`]
//! which is either backed by the operating system ([`KeyringCipher`]), a
//! deterministic in-memory stub for tests ([`MemoryCipher`]), or absent
//! altogether ([`UnavailableCipher`]).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

use crate::error::{Classify, ErrorClass};

/// Errors from the encryption primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Encryption is unavailable on this system")]
    Unavailable,

    #[error("Encryption failed: {0}")]
    EncryptFailed(String),

    #[error("Secret could not be decrypted")]
    DecryptFailed,
}

impl Classify for CipherError {
    fn class(&self) -> ErrorClass {
        match self {
            CipherError::Unavailable | CipherError::EncryptFailed(_) => ErrorClass::Configuration,
            CipherError::DecryptFailed => ErrorClass::Corruption,
        }
    }
}

/// Capability interface over an encryption primitive.
///
/// `decrypt` must fail closed: anything it did not produce itself, or that
/// was altered afterwards, yields [`CipherError::DecryptFailed`].
pub trait SecretCipher: Send + Sync {
    /// Whether the primitive can be used right now.
    fn is_available(&self) -> bool;

    /// Encrypt `plaintext` into an opaque string.
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError>;

    /// Decrypt an opaque string produced by [`encrypt`](Self::encrypt).
    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Cipher used when no primitive exists. Every call fails with
/// [`CipherError::Unavailable`].
#[derive(Debug, Default)]
pub struct UnavailableCipher;

impl SecretCipher for UnavailableCipher {
    fn is_available(&self) -> bool {
        false
    }

    fn encrypt(&self, _plaintext: &str) -> Result<String, CipherError> {
        Err(CipherError::Unavailable)
    }

    fn decrypt(&self, _ciphertext: &str) -> Result<String, CipherError> {
        Err(CipherError::Unavailable)
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

/// Deterministic in-memory cipher for tests.
///
/// Ciphertexts are handles (`mem:<n>`) into a private table, so two
/// encryptions of the same plaintext differ and foreign input never decrypts.
#[derive(Debug, Default)]
pub struct MemoryCipher {
    table: Mutex<HashMap<String, String>>,
    counter: AtomicU64,
    disabled: AtomicBool,
}

impl MemoryCipher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cipher that reports itself unavailable.
    pub fn unavailable() -> Self {
        let cipher = Self::default();
        cipher.set_available(false);
        cipher
    }

    pub fn set_available(&self, available: bool) {
        self.disabled.store(!available, Ordering::SeqCst);
    }
}

impl SecretCipher for MemoryCipher {
    fn is_available(&self) -> bool {
        !self.disabled.load(Ordering::SeqCst)
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        if !self.is_available() {
            return Err(CipherError::Unavailable);
        }
        let handle = format!("mem:{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.table.lock().insert(handle.clone(), plaintext.to_string());
        Ok(handle)
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        if !self.is_available() {
            return Err(CipherError::Unavailable);
        }
        self.table
            .lock()
            .get(ciphertext)
            .cloned()
            .ok_or(CipherError::DecryptFailed)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(feature = "os-keyring")]
pub use keyring_cipher::KeyringCipher;

#[cfg(feature = "os-keyring")]
mod keyring_cipher {
    use aes_gcm::{
        aead::{Aead, KeyInit},
        Aes256Gcm, Nonce,
    };
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use parking_lot::Mutex;
    use rand::RngCore;
    use secrecy::{ExposeSecret, SecretString};

    use super::{CipherError, SecretCipher};

    const ENVELOPE_PREFIX: &str = "v1:";
    const NONCE_LEN: usize = 12;
    const KEY_LEN: usize = 32;
    const MASTER_KEY_USER: &str = "secrets-master-key";

    /// AES-256-GCM with the master key held by the OS keyring.
    ///
    /// The key is created on first use and never written to disk by Tether.
    /// If the keyring cannot be reached the cipher reports itself
    /// unavailable.
    pub struct KeyringCipher {
        service: String,
        key: Mutex<Option<SecretString>>,
    }

    impl KeyringCipher {
        pub fn new(service: impl Into<String>) -> Self {
            Self {
                service: service.into(),
                key: Mutex::new(None),
            }
        }

        fn master_key(&self) -> Result<[u8; KEY_LEN], CipherError> {
            let mut cached = self.key.lock();
            if cached.is_none() {
                *cached = Some(self.load_or_create_key()?);
            }
            let encoded = cached.as_ref().ok_or(CipherError::Unavailable)?;
            decode_key(encoded.expose_secret())
        }

        fn load_or_create_key(&self) -> Result<SecretString, CipherError> {
            let entry = keyring::Entry::new(&self.service, MASTER_KEY_USER).map_err(|e| {
                tracing::warn!(error = %e, "OS keyring entry unavailable");
                CipherError::Unavailable
            })?;

            match entry.get_password() {
                Ok(encoded) => {
                    decode_key(&encoded)?;
                    Ok(SecretString::from(encoded))
                }
                Err(keyring::Error::NoEntry) => {
                    let mut bytes = [0u8; KEY_LEN];
                    rand::thread_rng().fill_bytes(&mut bytes);
                    let encoded = BASE64.encode(bytes);
                    entry.set_password(&encoded).map_err(|e| {
                        tracing::warn!(error = %e, "Could not store master key in OS keyring");
                        CipherError::Unavailable
                    })?;
                    tracing::info!(service = %self.service, "Created secrets master key");
                    Ok(SecretString::from(encoded))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "OS keyring read failed");
                    Err(CipherError::Unavailable)
                }
            }
        }

        fn cipher(&self) -> Result<Aes256Gcm, CipherError> {
            let key = self.master_key()?;
            Aes256Gcm::new_from_slice(&key).map_err(|e| CipherError::EncryptFailed(e.to_string()))
        }
    }

    fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], CipherError> {
        let bytes = BASE64.decode(encoded).map_err(|_| CipherError::Unavailable)?;
        bytes.try_into().map_err(|_| CipherError::Unavailable)
    }

    impl SecretCipher for KeyringCipher {
        fn is_available(&self) -> bool {
            self.master_key().is_ok()
        }

        fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
            let cipher = self.cipher()?;

            let mut nonce_bytes = [0u8; NONCE_LEN];
            rand::thread_rng().fill_bytes(&mut nonce_bytes);
            let nonce = Nonce::from_slice(&nonce_bytes);

            let ciphertext = cipher
                .encrypt(nonce, plaintext.as_bytes())
                .map_err(|e| CipherError::EncryptFailed(e.to_string()))?;

            let mut sealed = nonce_bytes.to_vec();
            sealed.extend(ciphertext);
            Ok(format!("{}{}", ENVELOPE_PREFIX, BASE64.encode(sealed)))
        }

        fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
            let cipher = self.cipher()?;

            let encoded = ciphertext
                .strip_prefix(ENVELOPE_PREFIX)
                .ok_or(CipherError::DecryptFailed)?;
            let sealed = BASE64.decode(encoded).map_err(|_| CipherError::DecryptFailed)?;
            if sealed.len() <= NONCE_LEN {
                return Err(CipherError::DecryptFailed);
            }

            let (nonce_bytes, body) = sealed.split_at(NONCE_LEN);
            let plaintext = cipher
                .decrypt(Nonce::from_slice(nonce_bytes), body)
                .map_err(|_| CipherError::DecryptFailed)?;
            String::from_utf8(plaintext).map_err(|_| CipherError::DecryptFailed)
        }

        fn name(&self) -> &'static str {
            "os-keyring"
        }
    }
}
