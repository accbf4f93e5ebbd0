//! Health event bus
//!
//! Fire-and-forget publish/subscribe for supervision state transitions:
//! - Each subscriber owns a bounded queue and a delivery task
//! - A slow subscriber loses events (counted) instead of blocking publishers
//! - Observer errors and panics are caught and logged, never propagated
//! - Events reach each subscriber in publish order

use crate::event::HealthEvent;
use crate::ids::SubscriptionId;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Default per-subscriber queue length
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Error raised by an observer while handling an event
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ObserverError(pub String);

impl ObserverError {
    /// Create from any message
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Bus errors
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Observer delivery needs a tokio runtime to spawn its task
    #[error("observer subscription requires a running tokio runtime")]
    NoRuntime,
}

/// Receives published events
#[async_trait::async_trait]
pub trait HealthObserver: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        "observer"
    }

    /// Handle one event
    async fn on_event(&self, event: &HealthEvent) -> Result<(), ObserverError>;
}

struct Subscriber {
    id: SubscriptionId,
    name: String,
    sender: mpsc::Sender<HealthEvent>,
    task: Option<JoinHandle<()>>,
}

/// Publish/subscribe hub for [`HealthEvent`]s
pub struct HealthEventBus {
    capacity: usize,
    subscribers: Mutex<Vec<Subscriber>>,
    sequence: AtomicU64,
    next_subscription: AtomicU64,
    dropped: AtomicU64,
}

impl std::fmt::Debug for HealthEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscriber_count())
            .field("published", &self.published_count())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

impl Default for HealthEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl HealthEventBus {
    /// Create a bus whose subscribers buffer up to `capacity` events each
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            next_subscription: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe an observer
    ///
    /// Spawns a delivery task on the current tokio runtime.
    ///
    /// # Errors
    /// - `BusError::NoRuntime` when called outside a tokio runtime
    pub fn subscribe(&self, observer: Arc<dyn HealthObserver>) -> Result<SubscriptionId, BusError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime)?;
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = self.next_id();
        let name = observer.name().to_string();
        let task = runtime.spawn(deliver(name.clone(), observer, receiver));

        self.subscribers.lock().push(Subscriber {
            id,
            name,
            sender,
            task: Some(task),
        });
        tracing::debug!(subscription = %id, "observer subscribed");
        Ok(id)
    }

    /// Subscribe with a raw channel receiver instead of an observer
    #[must_use]
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::Receiver<HealthEvent>) {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = self.next_id();
        self.subscribers.lock().push(Subscriber {
            id,
            name: format!("channel-{}", id.0),
            sender,
            task: None,
        });
        (id, receiver)
    }

    /// Remove a subscription
    ///
    /// Events already queued for the subscriber are still delivered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        before != subscribers.len()
    }

    /// Publish an event to every current subscriber
    ///
    /// Never blocks and never fails. Returns the assigned sequence number.
    pub fn publish(&self, mut event: HealthEvent) -> u64 {
        let mut subscribers = self.subscribers.lock();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        event.sequence = sequence;

        tracing::trace!(
            sequence,
            stage = %event.stage_id,
            kind = event.kind.name(),
            "publishing health event"
        );

        subscribers.retain(|subscriber| match subscriber.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    subscriber = %subscriber.name,
                    sequence,
                    "subscriber queue full, event dropped"
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = %subscriber.name, "subscriber gone, removing");
                false
            }
        });

        sequence
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Events published so far
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Events dropped because a subscriber queue was full
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drop every subscription and wait for observer tasks to drain
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut subscribers = self.subscribers.lock();
            subscribers.drain(..).filter_map(|s| s.task).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed))
    }
}

async fn deliver(
    name: String,
    observer: Arc<dyn HealthObserver>,
    mut receiver: mpsc::Receiver<HealthEvent>,
) {
    while let Some(event) = receiver.recv().await {
        let outcome = AssertUnwindSafe(observer.on_event(&event))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    observer = %name,
                    sequence = event.sequence,
                    error = %e,
                    "observer failed to handle event"
                );
            }
            Err(_) => {
                tracing::error!(
                    observer = %name,
                    sequence = event.sequence,
                    "observer panicked while handling event"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{HealthEventKind, HealthStatus};
    use crate::ids::StageId;
    use std::time::Duration;

    struct Collecting {
        seen: Mutex<Vec<u64>>,
    }

    #[async_trait::async_trait]
    impl HealthObserver for Collecting {
        async fn on_event(&self, event: &HealthEvent) -> Result<(), ObserverError> {
            self.seen.lock().push(event.sequence);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl HealthObserver for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_event(&self, _event: &HealthEvent) -> Result<(), ObserverError> {
            Err(ObserverError::new("downstream unavailable"))
        }
    }

    struct Panicking;

    #[async_trait::async_trait]
    impl HealthObserver for Panicking {
        async fn on_event(&self, _event: &HealthEvent) -> Result<(), ObserverError> {
            panic!("observer bug");
        }
    }

    fn transition(to: HealthStatus) -> HealthEvent {
        HealthEvent::new(
            StageId::new("stage"),
            HealthEventKind::HealthTransition { from: None, to },
        )
    }

    async fn wait_for(collector: &Collecting, count: usize) {
        for _ in 0..200 {
            if collector.seen.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = HealthEventBus::new(16);
        let collector = Arc::new(Collecting { seen: Mutex::new(Vec::new()) });
        bus.subscribe(collector.clone()).unwrap();

        for status in [HealthStatus::Healthy, HealthStatus::Stalled, HealthStatus::Hung] {
            bus.publish(transition(status));
        }

        wait_for(&collector, 3).await;
        assert_eq!(*collector.seen.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failing_and_panicking_observers_are_isolated() {
        let bus = HealthEventBus::new(16);
        bus.subscribe(Arc::new(Failing)).unwrap();
        bus.subscribe(Arc::new(Panicking)).unwrap();
        let collector = Arc::new(Collecting { seen: Mutex::new(Vec::new()) });
        bus.subscribe(collector.clone()).unwrap();

        bus.publish(transition(HealthStatus::Crashed));
        bus.publish(transition(HealthStatus::Healthy));

        wait_for(&collector, 2).await;
        assert_eq!(collector.seen.lock().len(), 2);
        assert_eq!(bus.subscriber_count(), 3);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let bus = HealthEventBus::new(1);
        let (_id, mut receiver) = bus.subscribe_channel();

        bus.publish(transition(HealthStatus::Stalled));
        bus.publish(transition(HealthStatus::Hung));

        assert_eq!(bus.dropped_count(), 1);
        let first = receiver.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
    }

    #[tokio::test]
    async fn closed_channel_subscriber_is_pruned() {
        let bus = HealthEventBus::default();
        let (_id, receiver) = bus.subscribe_channel();
        drop(receiver);

        bus.publish(transition(HealthStatus::Healthy));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_subscription() {
        let bus = HealthEventBus::default();
        let (id, _receiver) = bus.subscribe_channel();
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
    }

    #[test]
    fn subscribe_outside_runtime_is_an_error() {
        let bus = HealthEventBus::default();
        let collector = Arc::new(Collecting { seen: Mutex::new(Vec::new()) });
        assert!(matches!(bus.subscribe(collector), Err(BusError::NoRuntime)));
    }

    #[test]
    fn publish_without_subscribers_still_sequences() {
        let bus = HealthEventBus::default();
        assert_eq!(bus.publish(transition(HealthStatus::Healthy)), 1);
        assert_eq!(bus.publish(transition(HealthStatus::Healthy)), 2);
        assert_eq!(bus.published_count(), 2);
    }
}
