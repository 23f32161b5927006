//! Credential redaction for text that ends up in logs or the error journal.
//!
//! Upstream error bodies and request descriptions sometimes echo back the
//! credential that was sent. Everything captured by the retry engine goes
//! through [`redact`] first.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;

/// Replacement marker for redacted values.
pub const REDACTED: &str = "[REDACTED]";

lazy_static! {
    /// `Authorization: Bearer <token>` and bare `Bearer <token>`
    static ref BEARER_PATTERN: Regex = Regex::new(
        r"(?i)(bearer\s+)[A-Za-z0-9._~+/=-]{8,}"
    ).unwrap();

    /// `key=value`, `key: value` and JSON `"key":"value"` for credential-like keys
    static ref KEY_VALUE_PATTERN: Regex = Regex::new(
        r#"(?i)("?(?:access[_-]?token|refresh[_-]?token|api[_-]?key|password|secret|token)"?\s*[:=]\s*"?)[^\s",}&]+"#
    ).unwrap();

    /// Three base64url segments separated by dots
    static ref JWT_PATTERN: Regex = Regex::new(
        r"\beyJ[A-Za-z0-9_-]{5,}\.[A-Za-z0-9_-]{5,}\.[A-Za-z0-9_-]{5,}\b"
    ).unwrap();

    /// Context keys whose values are dropped entirely
    static ref SENSITIVE_KEY_PATTERN: Regex = Regex::new(
        r"(?i)(token|secret|password|api[_-]?key|authorization|credential)"
    ).unwrap();
}

/// Redact credential-looking substrings from free text.
pub fn redact(text: &str) -> String {
    let text = JWT_PATTERN.replace_all(text, REDACTED);
    let text = BEARER_PATTERN.replace_all(&text, format!("${{1}}{}", REDACTED).as_str());
    KEY_VALUE_PATTERN
        .replace_all(&text, format!("${{1}}{}", REDACTED).as_str())
        .into_owned()
}

/// Redact a context map: sensitive keys lose their value, the rest go
/// through [`redact`].
pub fn redact_context(context: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    context
        .iter()
        .map(|(key, value)| {
            let value = if SENSITIVE_KEY_PATTERN.is_match(key) {
                REDACTED.to_string()
            } else {
                redact(value)
            };
            (key.clone(), value)
        })
        .collect()
}
