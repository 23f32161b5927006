use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tether_core::Severity;
use tokio::sync::{broadcast, watch};

use super::types::{ApprovalError, ApprovalEvent, ApprovalOutcome, ApprovalRequest, Decision};
use crate::events::{EventBus, EventBusError};

/// Default number of resolved requests kept.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

struct PendingEntry {
    request: ApprovalRequest,
    notify: watch::Sender<ApprovalOutcome>,
}

#[derive(Default)]
struct GateState {
    /// Keyed by id, so iteration is creation order
    pending: BTreeMap<u64, PendingEntry>,
    /// Oldest at the front
    history: VecDeque<ApprovalRequest>,
}

/// Handle returned by [`ApprovalGate::request`].
///
/// Dropping the ticket or timing out its wait leaves the request pending.
#[derive(Debug)]
pub struct ApprovalTicket {
    request: ApprovalRequest,
    rx: watch::Receiver<ApprovalOutcome>,
}

impl ApprovalTicket {
    pub fn id(&self) -> u64 {
        self.request.id
    }

    /// Snapshot taken when the request was created.
    pub fn request(&self) -> &ApprovalRequest {
        &self.request
    }

    /// Wait for a terminal outcome, up to `timeout`.
    pub async fn wait(&mut self, timeout: Duration) -> Result<ApprovalOutcome, ApprovalError> {
        wait_terminal(self.request.id, &mut self.rx, timeout).await
    }
}

async fn wait_terminal(
    id: u64,
    rx: &mut watch::Receiver<ApprovalOutcome>,
    timeout: Duration,
) -> Result<ApprovalOutcome, ApprovalError> {
    match tokio::time::timeout(timeout, rx.wait_for(|outcome| outcome.is_terminal())).await {
        Ok(Ok(outcome)) => Ok(*outcome),
        Ok(Err(_)) => Err(ApprovalError::Closed(id)),
        Err(_) => Err(ApprovalError::Timeout {
            id,
            waited: timeout,
        }),
    }
}

/// Queue of risky operations awaiting operator sign-off.
///
/// Pure in-memory coordination: no disk, no network. Pending requests do not
/// survive a restart.
pub struct ApprovalGate {
    state: Mutex<GateState>,
    next_id: AtomicU64,
    capacity: usize,
    threshold: Severity,
    events: EventBus<ApprovalEvent>,
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ApprovalGate")
            .field("pending", &state.pending.len())
            .field("history", &state.history.len())
            .field("capacity", &self.capacity)
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new(Severity::High, DEFAULT_HISTORY_CAPACITY)
    }
}

impl ApprovalGate {
    /// Create a gate. Operations at or above `threshold` need sign-off;
    /// `capacity` resolved requests are kept in history.
    pub fn new(threshold: Severity, capacity: usize) -> Self {
        Self::with_events(threshold, capacity, EventBus::default())
    }

    pub fn with_events(
        threshold: Severity,
        capacity: usize,
        events: EventBus<ApprovalEvent>,
    ) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            next_id: AtomicU64::new(0),
            capacity,
            threshold,
            events,
        }
    }

    pub fn subscribe(&self) -> Result<broadcast::Receiver<ApprovalEvent>, EventBusError> {
        self.events.subscribe()
    }

    pub fn threshold(&self) -> Severity {
        self.threshold
    }

    /// Whether an operation at `risk` must be approved first.
    pub fn requires_approval(&self, risk: Severity) -> bool {
        risk >= self.threshold
    }

    /// Create a pending request and announce it.
    pub fn request(
        &self,
        operation: impl Into<String>,
        description: impl Into<String>,
        risk: Severity,
    ) -> ApprovalTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = ApprovalRequest::new(id, operation, description, risk);
        let (notify, rx) = watch::channel(ApprovalOutcome::Pending);

        self.state.lock().pending.insert(
            id,
            PendingEntry {
                request: request.clone(),
                notify,
            },
        );

        tracing::info!(
            id,
            operation = %request.operation,
            risk = %request.risk,
            "Approval requested"
        );
        self.events.publish(ApprovalEvent::Requested {
            request: request.clone(),
        });

        ApprovalTicket { request, rx }
    }

    /// Wait on a request by id. A timeout fails the wait, not the request.
    pub async fn wait(&self, id: u64, timeout: Duration) -> Result<ApprovalOutcome, ApprovalError> {
        let mut rx = {
            let state = self.state.lock();
            match state.pending.get(&id) {
                Some(entry) => entry.notify.subscribe(),
                None => {
                    return state
                        .history
                        .iter()
                        .find(|r| r.id == id)
                        .map(|r| r.outcome)
                        .ok_or(ApprovalError::NotFound(id));
                }
            }
        };
        wait_terminal(id, &mut rx, timeout).await
    }

    pub fn approve(&self, id: u64, resolver: &str) -> bool {
        self.resolve(id, Decision::Approve, resolver)
    }

    pub fn reject(&self, id: u64, resolver: &str) -> bool {
        self.resolve(id, Decision::Reject, resolver)
    }

    /// Resolve one request. False if the id is unknown or already terminal.
    pub fn resolve(&self, id: u64, decision: Decision, resolver: &str) -> bool {
        let resolved = {
            let mut state = self.state.lock();
            match state.pending.remove(&id) {
                Some(entry) => Some(self.finish(&mut state, entry, decision.into(), resolver)),
                None => None,
            }
        };

        match resolved {
            Some(request) => {
                self.announce(request);
                true
            }
            None => false,
        }
    }

    pub fn approve_all(&self, resolver: &str) -> usize {
        self.resolve_all(Decision::Approve, resolver)
    }

    pub fn reject_all(&self, resolver: &str) -> usize {
        self.resolve_all(Decision::Reject, resolver)
    }

    /// Resolve every pending request in creation order. Returns the count.
    pub fn resolve_all(&self, decision: Decision, resolver: &str) -> usize {
        let resolved: Vec<ApprovalRequest> = {
            let mut state = self.state.lock();
            let pending = std::mem::take(&mut state.pending);
            pending
                .into_values()
                .map(|entry| self.finish(&mut state, entry, decision.into(), resolver))
                .collect()
        };

        let count = resolved.len();
        for request in resolved {
            self.announce(request);
        }
        count
    }

    /// Reject everything still pending so no waiter is left hanging.
    pub fn shutdown(&self, resolver: &str) -> usize {
        let rejected = self.reject_all(resolver);
        if rejected > 0 {
            tracing::info!(rejected, "Rejected pending approvals on shutdown");
        }
        rejected
    }

    /// Pending requests in creation order.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        self.state
            .lock()
            .pending
            .values()
            .map(|entry| entry.request.clone())
            .collect()
    }

    /// The `limit` most recently resolved requests, newest first.
    pub fn history(&self, limit: usize) -> Vec<ApprovalRequest> {
        self.state
            .lock()
            .history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Check, request and wait in one call.
    ///
    /// Operations below the threshold pass straight through. A rejection
    /// comes back as [`ApprovalError::Rejected`].
    pub async fn authorize(
        &self,
        operation: &str,
        description: &str,
        risk: Severity,
        timeout: Duration,
    ) -> Result<(), ApprovalError> {
        if !self.requires_approval(risk) {
            return Ok(());
        }

        let mut ticket = self.request(operation, description, risk);
        match ticket.wait(timeout).await? {
            ApprovalOutcome::Approved => Ok(()),
            _ => {
                let resolver = self
                    .history(usize::MAX)
                    .into_iter()
                    .find(|r| r.id == ticket.id())
                    .and_then(|r| r.resolved_by)
                    .unwrap_or_else(|| "unknown".to_string());
                Err(ApprovalError::Rejected {
                    operation: operation.to_string(),
                    resolver,
                })
            }
        }
    }

    fn finish(
        &self,
        state: &mut GateState,
        entry: PendingEntry,
        outcome: ApprovalOutcome,
        resolver: &str,
    ) -> ApprovalRequest {
        let PendingEntry {
            mut request,
            notify,
        } = entry;
        request.resolve(outcome, resolver);
        notify.send_replace(outcome);

        state.history.push_back(request.clone());
        while state.history.len() > self.capacity {
            state.history.pop_front();
        }
        request
    }

    fn announce(&self, request: ApprovalRequest) {
        tracing::info!(
            id = request.id,
            operation = %request.operation,
            outcome = ?request.outcome,
            resolved_by = request.resolved_by.as_deref().unwrap_or(""),
            "Approval resolved"
        );
        self.events.publish(ApprovalEvent::Resolved { request });
    }
}
