//! In-memory error journal.
//!
//! Events live here until they are resolved and old enough to be purged by
//! [`ErrorJournal::cleanup`]. Nothing is persisted.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tether_core::{redact, redact_context, Severity};

use super::CallContext;

/// One captured failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEvent {
    /// Unique within one journal
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    /// Subsystem that failed
    pub source: String,
    pub operation: String,
    pub severity: Severity,
    pub context: BTreeMap<String, String>,
    /// Error text with credentials redacted
    pub message: String,
    /// 1-based attempt that failed, 0 for captures outside a retry loop
    pub retry_count: u32,
    pub resolved: bool,
    pub resolution: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Counts over the current journal contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStats {
    pub total: usize,
    pub unresolved: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_source: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct ErrorJournal {
    events: RwLock<BTreeMap<u64, ErrorEvent>>,
    next_id: AtomicU64,
}

impl ErrorJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the stored event.
    pub fn record(&self, context: &CallContext, message: &str, retry_count: u32) -> ErrorEvent {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let event = ErrorEvent {
            id,
            timestamp: Utc::now(),
            source: context.source.clone(),
            operation: context.operation.clone(),
            severity: context.severity,
            context: redact_context(&context.context),
            message: redact(message),
            retry_count,
            resolved: false,
            resolution: None,
            resolved_at: None,
        };
        self.events.write().insert(id, event.clone());
        event
    }

    /// Mark an event resolved. False if unknown or already resolved.
    pub fn resolve(&self, id: u64, note: Option<&str>) -> bool {
        let mut events = self.events.write();
        match events.get_mut(&id) {
            Some(event) if !event.resolved => {
                event.resolved = true;
                event.resolution = note.map(redact);
                event.resolved_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: u64) -> Option<ErrorEvent> {
        self.events.read().get(&id).cloned()
    }

    /// Unresolved events, oldest first.
    pub fn unresolved(&self) -> Vec<ErrorEvent> {
        self.events
            .read()
            .values()
            .filter(|event| !event.resolved)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> ErrorStats {
        let events = self.events.read();
        let mut stats = ErrorStats {
            total: events.len(),
            ..Default::default()
        };
        for event in events.values() {
            if !event.resolved {
                stats.unresolved += 1;
            }
            *stats.by_severity.entry(event.severity).or_default() += 1;
            *stats.by_source.entry(event.source.clone()).or_default() += 1;
        }
        stats
    }

    /// Purge resolved events at least `max_age` old. Returns the count purged.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.cleanup_before(cutoff)
    }

    /// Purge resolved events created at or before `cutoff`.
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|_, event| !(event.resolved && event.timestamp <= cutoff));
        before - events.len()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ctx(source: &str) -> CallContext {
        CallContext::new(source, "op")
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let journal = ErrorJournal::new();
        let event = journal.record(&ctx("backend"), "boom", 1);

        assert!(journal.resolve(event.id, Some("fixed upstream")));
        assert!(!journal.resolve(event.id, None));
        assert!(!journal.resolve(9999, None));

        let stored = journal.get(event.id).unwrap();
        assert!(stored.resolved);
        assert_eq!(stored.resolution.as_deref(), Some("fixed upstream"));
        assert!(stored.resolved_at.is_some());
    }

    #[test]
    fn test_messages_and_context_are_redacted() {
        let journal = ErrorJournal::new();
        let context = ctx("cloud").with("authorization", "Bearer abcdefghijk123");
        let event = journal.record(&context, "refresh_token=rt-abc123 rejected", 1);

        assert!(!event.message.contains("rt-abc123"));
        assert!(!event.context["authorization"].contains("abcdefghijk123"));
    }

    #[test]
    fn test_stats_by_severity_and_source() {
        let journal = ErrorJournal::new();
        journal.record(&ctx("backend").severity(Severity::High), "a", 1);
        journal.record(&ctx("backend"), "b", 2);
        let c = journal.record(&ctx("vault").severity(Severity::Critical), "c", 0);
        journal.resolve(c.id, None);

        let stats = journal.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.unresolved, 2);
        assert_eq!(stats.by_source["backend"], 2);
        assert_eq!(stats.by_severity[&Severity::Medium], 1);
        assert_eq!(stats.by_severity[&Severity::Critical], 1);
    }

    #[test]
    fn test_cleanup_only_purges_resolved() {
        let journal = ErrorJournal::new();
        let a = journal.record(&ctx("x"), "a", 1);
        let _b = journal.record(&ctx("x"), "b", 1);
        journal.resolve(a.id, None);

        // Nothing is a day old yet.
        assert_eq!(journal.cleanup(Duration::from_secs(86_400)), 0);

        let future = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(journal.cleanup_before(future), 1);
        assert_eq!(journal.len(), 1);
        assert_eq!(journal.unresolved().len(), 1);
    }

    #[test]
    fn test_zero_max_age_purges_all_resolved() {
        let journal = ErrorJournal::new();
        let a = journal.record(&ctx("x"), "a", 1);
        journal.resolve(a.id, None);
        assert_eq!(journal.cleanup(Duration::ZERO), 1);
        assert!(journal.is_empty());
    }

    #[test]
    fn test_concurrent_ids_are_unique() {
        let journal = Arc::new(ErrorJournal::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let journal = Arc::clone(&journal);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| journal.record(&ctx("t"), "e", 1).id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 800);
        assert_eq!(journal.len(), 800);
    }
}
