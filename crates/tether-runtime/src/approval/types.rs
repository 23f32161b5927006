use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_core::{Classify, ErrorClass, Severity};
use thiserror::Error;

/// Outcome of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalOutcome {
    /// Waiting for an operator
    Pending,
    /// Operator signed off
    Approved,
    /// Operator declined
    Rejected,
}

impl ApprovalOutcome {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ApprovalOutcome::Pending)
    }
}

/// Operator decision passed to a resolve call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl From<Decision> for ApprovalOutcome {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Approve => ApprovalOutcome::Approved,
            Decision::Reject => ApprovalOutcome::Rejected,
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" | "yes" => Ok(Decision::Approve),
            "reject" | "rejected" | "no" => Ok(Decision::Reject),
            other => Err(format!("unknown decision '{}'", other)),
        }
    }
}

/// An approval request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique request ID, increasing in creation order
    pub id: u64,
    /// Operation name, e.g. `tool.install`
    pub operation: String,
    /// Human description shown to the operator
    pub description: String,
    pub risk: Severity,
    pub outcome: ApprovalOutcome,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it (for audit)
    pub resolved_by: Option<String>,
}

impl ApprovalRequest {
    pub(crate) fn new(
        id: u64,
        operation: impl Into<String>,
        description: impl Into<String>,
        risk: Severity,
    ) -> Self {
        Self {
            id,
            operation: operation.into(),
            description: description.into(),
            risk,
            outcome: ApprovalOutcome::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.outcome == ApprovalOutcome::Pending
    }

    /// Apply a terminal outcome. False if already terminal.
    pub(crate) fn resolve(&mut self, outcome: ApprovalOutcome, resolver: &str) -> bool {
        if !self.is_pending() || !outcome.is_terminal() {
            return false;
        }
        self.outcome = outcome;
        self.resolved_by = Some(resolver.to_string());
        self.resolved_at = Some(Utc::now());
        true
    }
}

/// Published by the gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalEvent {
    Requested { request: ApprovalRequest },
    Resolved { request: ApprovalRequest },
}

/// Error from waiting on or authorizing a request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApprovalError {
    #[error("Approval request {0} not found")]
    NotFound(u64),

    #[error("Timed out after {waited:?} waiting for approval request {id}; it is still pending")]
    Timeout { id: u64, waited: Duration },

    #[error("Operation '{operation}' was rejected by {resolver}")]
    Rejected { operation: String, resolver: String },

    #[error("Approval gate closed before request {0} was resolved")]
    Closed(u64),
}

impl Classify for ApprovalError {
    fn class(&self) -> ErrorClass {
        match self {
            ApprovalError::Rejected { .. } => ErrorClass::Policy,
            ApprovalError::Timeout { .. } => ErrorClass::Transient,
            ApprovalError::NotFound(_) | ApprovalError::Closed(_) => ErrorClass::Configuration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_once() {
        let mut request = ApprovalRequest::new(1, "tool.install", "Install fs tool", Severity::High);
        assert!(request.resolve(ApprovalOutcome::Approved, "ada"));
        assert!(!request.resolve(ApprovalOutcome::Rejected, "bob"));
        assert_eq!(request.outcome, ApprovalOutcome::Approved);
        assert_eq!(request.resolved_by.as_deref(), Some("ada"));
    }

    #[test]
    fn test_pending_is_not_a_resolution() {
        let mut request = ApprovalRequest::new(1, "op", "d", Severity::Low);
        assert!(!request.resolve(ApprovalOutcome::Pending, "ada"));
        assert!(request.is_pending());
    }

    #[test]
    fn test_decision_parsing() {
        assert_eq!("approve".parse::<Decision>().unwrap(), Decision::Approve);
        assert_eq!("REJECT".parse::<Decision>().unwrap(), Decision::Reject);
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn test_rejection_is_policy() {
        let err = ApprovalError::Rejected {
            operation: "op".into(),
            resolver: "ada".into(),
        };
        assert_eq!(err.class(), ErrorClass::Policy);
    }
}
