//! The encrypted secrets document.
//!
//! Only ciphertext is ever stored here. Plaintext travels in
//! [`SecretsPatch`] on the way in and comes back out of the vault as a
//! `SecretString`.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::config::DOCUMENT_VERSION;

/// Opaque ciphertext produced by a [`SecretCipher`](crate::cipher::SecretCipher).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedSecret(String);

impl SealedSecret {
    pub fn new(ciphertext: impl Into<String>) -> Self {
        Self(ciphertext.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealedSecret({} bytes)", self.0.len())
    }
}

/// Names of the secrets the vault knows about.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecretKey {
    /// Cloud refresh token
    RefreshToken,
    /// Named provider API key
    ApiKey(String),
}

impl fmt::Display for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretKey::RefreshToken => f.write_str("refresh_token"),
            SecretKey::ApiKey(name) => write!(f, "api_keys.{}", name),
        }
    }
}

/// Encrypted secrets, persisted next to the config document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsDocument {
    pub version: u32,
    pub refresh_token: Option<SealedSecret>,
    pub api_keys: BTreeMap<String, SealedSecret>,
}

impl Default for SecretsDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            refresh_token: None,
            api_keys: BTreeMap::new(),
        }
    }
}

impl SecretsDocument {
    pub fn get(&self, key: &SecretKey) -> Option<&SealedSecret> {
        match key {
            SecretKey::RefreshToken => self.refresh_token.as_ref(),
            SecretKey::ApiKey(name) => self.api_keys.get(name),
        }
    }

    pub fn contains(&self, key: &SecretKey) -> bool {
        self.get(key).is_some()
    }

    pub(crate) fn set(&mut self, key: SecretKey, value: Option<SealedSecret>) {
        match (key, value) {
            (SecretKey::RefreshToken, value) => self.refresh_token = value,
            (SecretKey::ApiKey(name), Some(value)) => {
                self.api_keys.insert(name, value);
            }
            (SecretKey::ApiKey(name), None) => {
                self.api_keys.remove(&name);
            }
        }
    }
}

/// Partial update of the secrets document, in plaintext.
///
/// `Some(value)` stores, `None` removes. Keys not mentioned are untouched.
#[derive(Default)]
pub struct SecretsPatch {
    entries: BTreeMap<SecretKey, Option<SecretString>>,
}

impl SecretsPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: SecretKey, plaintext: impl Into<String>) -> Self {
        self.entries
            .insert(key, Some(SecretString::from(plaintext.into())));
        self
    }

    pub fn clear(mut self, key: SecretKey) -> Self {
        self.entries.insert(key, None);
        self
    }

    pub fn set_refresh_token(self, plaintext: impl Into<String>) -> Self {
        self.set(SecretKey::RefreshToken, plaintext)
    }

    pub fn clear_refresh_token(self) -> Self {
        self.clear(SecretKey::RefreshToken)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry needs the cipher.
    pub fn needs_encryption(&self) -> bool {
        self.entries.values().any(Option::is_some)
    }

    pub(crate) fn into_entries(self) -> impl Iterator<Item = (SecretKey, Option<SecretString>)> {
        self.entries.into_iter()
    }
}

impl fmt::Debug for SecretsPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretsPatch")
            .field("keys", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}
