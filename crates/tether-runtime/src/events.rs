//! Bounded publish/subscribe used by the retry engine and the approval gate.
//!
//! Subscribing hands out a `broadcast::Receiver`; dropping it unsubscribes.
//! The number of live subscribers is capped so reconnecting front ends cannot
//! leak receivers without bound. Slow subscribers miss events (lagged)
//! rather than blocking the publisher.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Default buffered events per subscriber.
pub const DEFAULT_CAPACITY: usize = 256;
/// Default subscriber cap.
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    #[error("Subscriber limit of {0} reached")]
    SubscriberLimit(usize),
}

/// Broadcast channel with a subscriber cap.
#[derive(Debug)]
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
    max_subscribers: usize,
    subscribe_lock: Arc<Mutex<()>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            max_subscribers: self.max_subscribers,
            subscribe_lock: Arc::clone(&self.subscribe_lock),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new(capacity: usize, max_subscribers: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            max_subscribers,
            subscribe_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<E>, EventBusError> {
        let _guard = self.subscribe_lock.lock();
        if self.sender.receiver_count() >= self.max_subscribers {
            tracing::warn!(limit = self.max_subscribers, "Event subscriber limit reached");
            return Err(EventBusError::SubscriberLimit(self.max_subscribers));
        }
        Ok(self.sender.subscribe())
    }

    /// Publish to every live subscriber. Returns how many received it.
    pub fn publish(&self, event: E) -> usize {
        // No receivers is not an error
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MAX_SUBSCRIBERS)
    }
}
