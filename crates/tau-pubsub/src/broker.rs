//! Broker state, fan-out, and subscription lifecycle.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    },
};

use tau_core::{CancelRegistration, CooperativeCancellationToken};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{BrokerConfig, Event, EventKind, TryRecvError};

/// Fan-out handle shared by publishers and subscribers of one event stream.
///
/// Cloning yields another handle to the same broker.
pub struct Broker<T> {
    inner: Arc<BrokerInner<T>>,
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Snapshot of broker delivery counters. Introspection only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerMetrics {
    pub published: u64,
    pub delivered: u64,
    pub dropped_full: u64,
    pub subscriptions_created: u64,
}

struct BrokerInner<T> {
    state: RwLock<BrokerState<T>>,
    config: BrokerConfig,
    metrics: BrokerMetricsInner,
}

struct BrokerState<T> {
    subscribers: HashMap<u64, SubscriberSlot<T>>,
    next_id: u64,
    shutdown: bool,
}

struct SubscriberSlot<T> {
    sender: mpsc::Sender<Event<T>>,
    registration: Option<CancelRegistration>,
}

#[derive(Default)]
struct BrokerMetricsInner {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped_full: AtomicU64,
    subscriptions_created: AtomicU64,
}

impl BrokerMetricsInner {
    fn snapshot(&self) -> BrokerMetrics {
        BrokerMetrics {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            subscriptions_created: self.subscriptions_created.load(Ordering::Relaxed),
        }
    }
}

impl<T> Default for Broker<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Broker<T>
where
    T: Send + Sync + 'static,
{
    /// Creates a broker with default queue sizing.
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Creates a broker with explicit per-subscriber buffer and queue-depth ceiling.
    pub fn with_options(buffer_size: usize, max_queue_depth: usize) -> Self {
        Self::with_config(BrokerConfig {
            buffer_size,
            max_queue_depth,
        })
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: RwLock::new(BrokerState {
                    subscribers: HashMap::new(),
                    next_id: 1,
                    shutdown: false,
                }),
                config,
                metrics: BrokerMetricsInner::default(),
            }),
        }
    }

    pub fn config(&self) -> BrokerConfig {
        self.inner.config
    }

    /// Registers a subscriber scoped by `token` and returns its receive end.
    ///
    /// Never blocks. After shutdown, or with an already-cancelled token, the
    /// returned subscription is closed and yields no events.
    pub fn subscribe(&self, token: &CooperativeCancellationToken) -> Subscription<T> {
        let (sender, receiver) = mpsc::channel(self.inner.config.subscriber_capacity());
        if token.is_cancelled() {
            return Subscription::closed(receiver);
        }

        let id = {
            let mut state = write_or_recover(&self.inner.state);
            if state.shutdown {
                return Subscription::closed(receiver);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.subscribers.insert(
                id,
                SubscriberSlot {
                    sender,
                    registration: None,
                },
            );
            id
        };
        self.inner
            .metrics
            .subscriptions_created
            .fetch_add(1, Ordering::Relaxed);

        let weak_inner = Arc::downgrade(&self.inner);
        let registration = token.on_cancel(move || {
            if let Some(inner) = weak_inner.upgrade() {
                inner.remove_subscriber(id);
            }
        });
        let unclaimed = {
            let mut state = write_or_recover(&self.inner.state);
            match state.subscribers.get_mut(&id) {
                Some(slot) => {
                    slot.registration = Some(registration);
                    None
                }
                None => Some(registration),
            }
        };
        if let Some(registration) = unclaimed {
            registration.unregister();
        }

        tracing::debug!(subscriber_id = id, "registered broker subscriber");
        Subscription {
            receiver,
            id: Some(id),
            broker: Arc::downgrade(&self.inner),
        }
    }

    /// Offers one event to every current subscriber and returns how many accepted it.
    ///
    /// Full queues drop this event for that subscriber only. A no-op after shutdown.
    pub fn publish(&self, kind: EventKind, payload: T) -> usize {
        let event = Event {
            kind,
            payload: Arc::new(payload),
        };

        let mut delivered = 0;
        let mut disconnected = Vec::new();
        {
            let state = read_or_recover(&self.inner.state);
            if state.shutdown {
                return 0;
            }
            self.inner.metrics.published.fetch_add(1, Ordering::Relaxed);
            for (id, slot) in &state.subscribers {
                match slot.sender.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        self.inner
                            .metrics
                            .dropped_full
                            .fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(
                            subscriber_id = *id,
                            event_kind = %event.kind,
                            "dropped event for subscriber with full queue"
                        );
                    }
                    Err(TrySendError::Closed(_)) => disconnected.push(*id),
                }
            }
        }
        self.inner
            .metrics
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);

        for id in disconnected {
            self.inner.remove_subscriber(id);
        }
        delivered
    }

    /// Number of live subscribers. Not a synchronization primitive.
    pub fn subscriber_count(&self) -> usize {
        read_or_recover(&self.inner.state).subscribers.len()
    }

    pub fn metrics(&self) -> BrokerMetrics {
        self.inner.metrics.snapshot()
    }

    pub fn is_shutdown(&self) -> bool {
        read_or_recover(&self.inner.state).shutdown
    }

    /// Closes every subscriber queue and rejects further subscriptions. Idempotent.
    pub fn shutdown(&self) {
        let slots = {
            let mut state = write_or_recover(&self.inner.state);
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state
                .subscribers
                .drain()
                .map(|(_, slot)| slot)
                .collect::<Vec<_>>()
        };
        let closed = slots.len();
        for slot in slots {
            if let Some(registration) = slot.registration {
                registration.unregister();
            }
        }
        tracing::debug!(closed_subscribers = closed, "broker shut down");
    }
}

impl<T> BrokerInner<T> {
    fn remove_subscriber(&self, id: u64) -> bool {
        let removed = write_or_recover(&self.state).subscribers.remove(&id);
        let Some(slot) = removed else {
            return false;
        };
        if let Some(registration) = slot.registration {
            registration.unregister();
        }
        tracing::debug!(subscriber_id = id, "removed broker subscriber");
        true
    }
}

/// Receive end of one broker subscription.
///
/// `None` from [`Subscription::recv`] means the subscription is closed: its
/// token was cancelled, the broker shut down, or it never registered.
/// Dropping the subscription deregisters it.
pub struct Subscription<T> {
    receiver: mpsc::Receiver<Event<T>>,
    id: Option<u64>,
    broker: Weak<BrokerInner<T>>,
}

impl<T> Subscription<T> {
    fn closed(mut receiver: mpsc::Receiver<Event<T>>) -> Self {
        receiver.close();
        Self {
            receiver,
            id: None,
            broker: Weak::new(),
        }
    }

    /// Broker-assigned id, or `None` for a subscription that never registered.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Event<T>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Event<T>, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Blocking receive for consumers on plain threads. Panics inside an async context.
    pub fn blocking_recv(&mut self) -> Option<Event<T>> {
        self.receiver.blocking_recv()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let (Some(id), Some(inner)) = (self.id, self.broker.upgrade()) {
            inner.remove_subscriber(id);
        }
    }
}

fn read_or_recover<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_or_recover<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
