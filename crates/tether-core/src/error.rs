//! Error taxonomy shared by every Tether component.
//!
//! Each component keeps its own `thiserror` enum. What they share is the
//! [`ErrorClass`] they map to, which decides how the failure propagates:
//!
//! | Class | Handling |
//! |-------|----------|
//! | `Transient` | retried with backoff, surfaced after the policy is exhausted |
//! | `Authentication` | one credential refresh and one retry, then surfaced |
//! | `Configuration` | never retried, surfaced immediately |
//! | `Policy` | negative outcome of an approval, terminal |
//! | `Corruption` | fail closed, never treated as an empty value |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Propagation class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network timeout, 5xx, connection refused.
    Transient,
    /// Expired or invalid credential.
    Authentication,
    /// Missing setting or unavailable encryption primitive.
    Configuration,
    /// Operation required approval and was rejected.
    Policy,
    /// Stored data failed integrity checks.
    Corruption,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Authentication => "authentication",
            ErrorClass::Configuration => "configuration",
            ErrorClass::Policy => "policy",
            ErrorClass::Corruption => "corruption",
        };
        f.write_str(label)
    }
}

/// Errors that know their propagation class.
pub trait Classify {
    /// The class this error belongs to.
    fn class(&self) -> ErrorClass;

    /// Whether backoff retry may help.
    fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
