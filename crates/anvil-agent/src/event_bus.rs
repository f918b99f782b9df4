//! Per-instance publish/subscribe fan-out.
//!
//! Each subject is a bounded broadcast ring. Publishing never waits: every
//! subscriber keeps its own cursor, and one that falls more than `capacity`
//! values behind skips the oldest ones instead of holding anything back.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use anvil_process::{InstanceEvent, Subject};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug)]
pub struct EventBus<T> {
    tx: broadcast::Sender<T>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns how many subscribers the value was queued for.
    pub fn publish(&self, value: T) -> usize {
        self.tx.send(value).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            id: SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    pub fn unsubscribe(&self, sub: Subscription<T>) {
        drop(sub);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[derive(Debug)]
pub struct Subscription<T> {
    id: SubscriptionId,
    rx: broadcast::Receiver<T>,
    dropped: u64,
}

impl<T: Clone> Subscription<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Values skipped because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next value in publish order, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(v) => return Some(v),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped = self.dropped.saturating_add(n);
                    tracing::debug!(subscription = self.id.0, skipped = n, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`]; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(v) => return Some(v),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped = self.dropped.saturating_add(n);
                }
                Err(_) => return None,
            }
        }
    }
}

pub type EventSubscription = Subscription<InstanceEvent>;

/// The four subjects of one instance.
#[derive(Debug, Clone)]
pub struct InstanceChannels {
    inner: Arc<ChannelSet>,
}

#[derive(Debug)]
struct ChannelSet {
    output: EventBus<InstanceEvent>,
    metrics: EventBus<InstanceEvent>,
    players: EventBus<InstanceEvent>,
    status: EventBus<InstanceEvent>,
}

impl InstanceChannels {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ChannelSet {
                output: EventBus::new(capacity),
                metrics: EventBus::new(capacity),
                players: EventBus::new(capacity),
                status: EventBus::new(capacity),
            }),
        }
    }

    fn bus(&self, subject: Subject) -> &EventBus<InstanceEvent> {
        match subject {
            Subject::Output => &self.inner.output,
            Subject::Metrics => &self.inner.metrics,
            Subject::Players => &self.inner.players,
            Subject::Status => &self.inner.status,
        }
    }

    /// Routes the event to the bus of its own subject.
    pub fn publish(&self, event: InstanceEvent) -> usize {
        self.bus(event.subject()).publish(event)
    }

    pub fn subscribe(&self, subject: Subject) -> EventSubscription {
        self.bus(subject).subscribe()
    }

    pub fn subscriber_count(&self, subject: Subject) -> usize {
        self.bus(subject).subscriber_count()
    }
}
