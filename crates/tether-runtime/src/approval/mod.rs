//! Approval gate for risky operations.
//!
//! A request moves `pending -> approved` or `pending -> rejected` exactly
//! once. Resolved requests go to a bounded history ring. Waiters use
//! `tokio::sync::watch`, so cancelling or timing out a wait never touches
//! the request itself.

mod gate;
mod types;

pub use gate::{ApprovalGate, ApprovalTicket, DEFAULT_HISTORY_CAPACITY};
pub use types::{ApprovalError, ApprovalEvent, ApprovalOutcome, ApprovalRequest, Decision};
