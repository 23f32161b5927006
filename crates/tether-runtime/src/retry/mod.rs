//! Retry engine: bounded exponential backoff with structured error capture.
//!
//! Every failed attempt is written to the [`ErrorJournal`] and published on
//! the engine's [`EventBus`]. Backoff sleeps use the tokio timer, so a
//! retrying call never occupies a thread.
//!
//! # Outcomes
//! - success on attempt `n > 1`: one [`RetryEvent::Recovered`], the `n - 1`
//!   journal entries stay unresolved
//! - failure on the last attempt: the last error is returned as is, with one
//!   [`RetryEvent::Exhausted`]
//! - non-transient failure under [`RetryEngine::execute_classified`]:
//!   recorded and returned at once

mod journal;

pub use journal::{ErrorEvent, ErrorJournal, ErrorStats};

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tether_core::{Classify, RetryPolicy, Severity};
use tokio::sync::broadcast;

use crate::events::{EventBus, EventBusError};

/// Who is calling and what for. Copied into every journal entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CallContext {
    pub source: String,
    pub operation: String,
    pub severity: Severity,
    pub context: BTreeMap<String, String>,
}

impl CallContext {
    pub fn new(source: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            operation: operation.into(),
            severity: Severity::default(),
            context: BTreeMap::new(),
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }
}

/// Published for every attempt outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryEvent {
    Captured {
        id: u64,
        source: String,
        operation: String,
        severity: Severity,
        attempt: u32,
    },
    Retrying {
        source: String,
        operation: String,
        attempt: u32,
        #[serde(with = "tether_core::types::humantime_duration")]
        delay: Duration,
    },
    Recovered {
        source: String,
        operation: String,
        attempts: u32,
    },
    Exhausted {
        source: String,
        operation: String,
        attempts: u32,
    },
    Resolved {
        id: u64,
    },
}

pub struct RetryEngine {
    policy: RetryPolicy,
    journal: ErrorJournal,
    events: EventBus<RetryEvent>,
}

impl std::fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEngine")
            .field("policy", &self.policy)
            .field("journal_len", &self.journal.len())
            .finish()
    }
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_events(policy, EventBus::default())
    }

    pub fn with_events(policy: RetryPolicy, events: EventBus<RetryEvent>) -> Self {
        Self {
            policy,
            journal: ErrorJournal::new(),
            events,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn journal(&self) -> &ErrorJournal {
        &self.journal
    }

    pub fn subscribe(&self) -> Result<broadcast::Receiver<RetryEvent>, EventBusError> {
        self.events.subscribe()
    }

    /// Run `operation` with backoff, retrying every failure.
    pub async fn execute<T, E, F, Fut>(&self, context: &CallContext, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run(context, operation, |_| true, |_, _| {}).await
    }

    /// Like [`execute`](Self::execute), calling `on_failure(attempt, &error)`
    /// after each failed attempt (1-based).
    pub async fn execute_with_callback<T, E, F, Fut, C>(
        &self,
        context: &CallContext,
        operation: F,
        on_failure: C,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        C: FnMut(u32, &E),
    {
        self.run(context, operation, |_| true, on_failure).await
    }

    /// Like [`execute`](Self::execute), but only transient errors are retried.
    pub async fn execute_classified<T, E, F, Fut>(
        &self,
        context: &CallContext,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + Classify,
    {
        self.run(context, operation, |e: &E| e.is_transient(), |_, _| {})
            .await
    }

    async fn run<T, E, F, Fut, R, C>(
        &self,
        context: &CallContext,
        mut operation: F,
        retryable: R,
        mut on_failure: C,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        R: Fn(&E) -> bool,
        C: FnMut(u32, &E),
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt: u32 = 0;

        loop {
            let number = attempt + 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(
                            source = %context.source,
                            operation = %context.operation,
                            attempts = number,
                            "Operation recovered after retry"
                        );
                        self.events.publish(RetryEvent::Recovered {
                            source: context.source.clone(),
                            operation: context.operation.clone(),
                            attempts: number,
                        });
                    }
                    return Ok(value);
                }
                Err(error) => {
                    self.record(context, &error.to_string(), number);
                    on_failure(number, &error);

                    if !retryable(&error) {
                        tracing::debug!(
                            source = %context.source,
                            operation = %context.operation,
                            "Failure is not retryable"
                        );
                        return Err(error);
                    }

                    if number >= max_attempts {
                        tracing::warn!(
                            source = %context.source,
                            operation = %context.operation,
                            attempts = number,
                            "Retries exhausted"
                        );
                        self.events.publish(RetryEvent::Exhausted {
                            source: context.source.clone(),
                            operation: context.operation.clone(),
                            attempts: number,
                        });
                        return Err(error);
                    }

                    let delay = self.policy.delay_for(attempt);
                    tracing::debug!(
                        source = %context.source,
                        operation = %context.operation,
                        attempt = number,
                        delay = %humantime::format_duration(delay),
                        "Retrying after backoff"
                    );
                    self.events.publish(RetryEvent::Retrying {
                        source: context.source.clone(),
                        operation: context.operation.clone(),
                        attempt: number,
                        delay,
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn record(&self, context: &CallContext, message: &str, attempt: u32) -> u64 {
        let event = self.journal.record(context, message, attempt);
        tracing::warn!(
            id = event.id,
            source = %event.source,
            operation = %event.operation,
            severity = %event.severity,
            attempt,
            error = %event.message,
            "Error captured"
        );
        self.events.publish(RetryEvent::Captured {
            id: event.id,
            source: event.source,
            operation: event.operation,
            severity: event.severity,
            attempt,
        });
        event.id
    }

    /// Record a failure without retrying anything. Returns the event id.
    pub fn capture_error(&self, context: &CallContext, message: impl Display) -> u64 {
        self.record(context, &message.to_string(), 0)
    }

    /// Mark an event resolved. True once, false afterwards or for unknown ids.
    pub fn resolve_error(&self, id: u64, note: Option<&str>) -> bool {
        let resolved = self.journal.resolve(id, note);
        if resolved {
            self.events.publish(RetryEvent::Resolved { id });
        }
        resolved
    }

    pub fn unresolved_errors(&self) -> Vec<ErrorEvent> {
        self.journal.unresolved()
    }

    pub fn stats(&self) -> ErrorStats {
        self.journal.stats()
    }

    /// Purge resolved events older than `max_age`. Returns the count purged.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let purged = self.journal.cleanup(max_age);
        if purged > 0 {
            tracing::debug!(purged, "Purged resolved error events");
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tether_core::ErrorClass;
    use thiserror::Error;

    #[derive(Error, Debug, Clone, PartialEq)]
    enum TestError {
        #[error("connection refused (attempt {0})")]
        Refused(u32),
        #[error("bad credentials")]
        Auth,
    }

    impl Classify for TestError {
        fn class(&self) -> ErrorClass {
            match self {
                TestError::Refused(_) => ErrorClass::Transient,
                TestError::Auth => ErrorClass::Authentication,
            }
        }
    }

    fn drain(rx: &mut broadcast::Receiver<RetryEvent>) -> Vec<RetryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn count<F: Fn(&RetryEvent) -> bool>(events: &[RetryEvent], f: F) -> usize {
        events.iter().filter(|e| f(e)).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_n_failures() {
        for failures in 0..=3u32 {
            let engine = RetryEngine::default();
            let mut rx = engine.subscribe().unwrap();
            let calls = AtomicU32::new(0);

            let result: Result<&str, TestError> = engine
                .execute(&CallContext::new("test", "flaky"), || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        Err(TestError::Refused(n + 1))
                    } else {
                        Ok("done")
                    }
                })
                .await;

            assert_eq!(result.unwrap(), "done");
            let events = drain(&mut rx);
            assert_eq!(
                count(&events, |e| matches!(e, RetryEvent::Captured { .. })),
                failures as usize
            );
            let recovered = count(&events, |e| matches!(e, RetryEvent::Recovered { .. }));
            assert_eq!(recovered, if failures > 0 { 1 } else { 0 });
            assert_eq!(engine.unresolved_errors().len(), failures as usize);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error_verbatim() {
        let engine = RetryEngine::default();
        let mut rx = engine.subscribe().unwrap();
        let calls = AtomicU32::new(0);

        let result: Result<(), TestError> = engine
            .execute(&CallContext::new("test", "down"), || async {
                Err(TestError::Refused(calls.fetch_add(1, Ordering::SeqCst) + 1))
            })
            .await;

        assert_eq!(result.unwrap_err(), TestError::Refused(4));
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let events = drain(&mut rx);
        assert_eq!(count(&events, |e| matches!(e, RetryEvent::Retrying { .. })), 3);
        assert_eq!(count(&events, |e| matches!(e, RetryEvent::Exhausted { .. })), 1);
        assert!(matches!(
            events.last(),
            Some(RetryEvent::Exhausted { attempts: 4, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_are_exact() {
        let policy = RetryPolicy::new(
            6,
            Duration::from_millis(1000),
            Duration::from_millis(30_000),
            2.0,
        );
        let engine = RetryEngine::new(policy);
        let mut rx = engine.subscribe().unwrap();

        let start = tokio::time::Instant::now();
        let _: Result<(), TestError> = engine
            .execute(&CallContext::new("test", "down"), || async {
                Err(TestError::Refused(0))
            })
            .await;

        let delays: Vec<u128> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                RetryEvent::Retrying { delay, .. } => Some(delay.as_millis()),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000]);
        assert_eq!(start.elapsed(), Duration::from_millis(61_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_sees_every_failure() {
        let engine = RetryEngine::default();
        let seen = Mutex::new(Vec::new());
        let calls = AtomicU32::new(0);

        let _: Result<(), TestError> = engine
            .execute_with_callback(
                &CallContext::new("test", "cb"),
                || async { Err(TestError::Refused(calls.fetch_add(1, Ordering::SeqCst) + 1)) },
                |attempt, error| seen.lock().unwrap().push((attempt, error.clone())),
            )
            .await;

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], (1, TestError::Refused(1)));
        assert_eq!(seen[3], (4, TestError::Refused(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_classified_does_not_retry_auth_errors() {
        let engine = RetryEngine::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), TestError> = engine
            .execute_classified(&CallContext::new("test", "auth"), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Auth)
            })
            .await;

        assert_eq!(result.unwrap_err(), TestError::Auth);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.unresolved_errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_executions_share_the_journal() {
        let engine = Arc::new(RetryEngine::default());
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let calls = AtomicU32::new(0);
                    engine
                        .execute(&CallContext::new(format!("worker{}", i), "op"), || async {
                            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                                Err(TestError::Refused(1))
                            } else {
                                Ok(i)
                            }
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        let stats = engine.stats();
        assert_eq!(stats.total, 10);
        assert_eq!(stats.by_source.len(), 10);
    }

    #[test]
    fn test_side_channel() {
        let engine = RetryEngine::default();
        let id = engine.capture_error(
            &CallContext::new("vault", "decrypt").severity(Severity::High),
            "decrypt failed",
        );
        assert_eq!(engine.journal().get(id).unwrap().retry_count, 0);

        assert!(engine.resolve_error(id, Some("re-logged in")));
        assert!(!engine.resolve_error(id, Some("again")));
        assert!(engine.unresolved_errors().is_empty());
        assert_eq!(engine.cleanup(Duration::ZERO), 1);
    }

    proptest! {
        #[test]
        fn prop_failures_then_success(failures in 0u32..=3) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                let engine = RetryEngine::default();
                let calls = AtomicU32::new(0);
                let result: Result<u32, TestError> = engine
                    .execute(&CallContext::new("prop", "op"), || async {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        if n < failures { Err(TestError::Refused(n)) } else { Ok(n) }
                    })
                    .await;
                prop_assert_eq!(result.unwrap(), failures);
                prop_assert_eq!(engine.stats().total, failures as usize);
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
