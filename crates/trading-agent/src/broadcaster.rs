//! Non-blocking fan-out to subscribers
//!
//! Each subscriber owns a bounded queue. Publishing never waits: a full queue
//! loses that one message for that one subscriber, a closed queue is
//! deregistered on the next publish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};

use crate::events::TradingEvent;

pub type EventReceiver = mpsc::Receiver<Arc<TradingEvent>>;

pub struct Broadcaster {
    subscribers: DashMap<String, mpsc::Sender<Arc<TradingEvent>>>,
    capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            capacity: capacity.max(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register `id`. Re-subscribing an existing id closes its old queue.
    pub fn subscribe(&self, id: impl Into<String>) -> EventReceiver {
        let id = id.into();
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.subscribers.insert(id.clone(), tx).is_some() {
            debug!(subscriber = %id, "Replaced existing subscription");
        }
        info!(subscriber = %id, "Subscriber registered");
        rx
    }

    /// Deregister `id` and close its queue. Messages already queued can still
    /// be read by the receiver.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.subscribers.remove(id).is_some();
        if removed {
            info!(subscriber = %id, "Subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Enqueue `event` for every subscriber without waiting. Returns how many
    /// subscribers accepted it.
    pub fn publish(&self, event: TradingEvent) -> usize {
        let kind = event.kind();
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            match entry.value().try_send(Arc::clone(&event)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(subscriber = %entry.key(), kind, "Subscriber queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => closed.push(entry.key().clone()),
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
            debug!(subscriber = %id, "Subscriber went away");
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Deregister everyone
    pub fn close_all(&self) {
        let count = self.subscribers.len();
        self.subscribers.clear();
        if count > 0 {
            info!(count, "All subscribers closed");
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Per-subscriber deliveries lost to full queues
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn ping(n: usize) -> TradingEvent {
        TradingEvent::error(format!("ping {}", n))
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let broadcaster = Broadcaster::new(4);
        let mut slow = broadcaster.subscribe("slow");

        let started = Instant::now();
        for i in 0..4 + 10 {
            broadcaster.publish(ping(i));
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        let mut seen = 0;
        while slow.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 4);
        assert_eq!(broadcaster.dropped_count(), 10);
        assert_eq!(broadcaster.published_count(), 14);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_starve_others() {
        let broadcaster = Broadcaster::new(2);
        let _slow = broadcaster.subscribe("slow");
        let mut fast = broadcaster.subscribe("fast");

        let mut received = 0;
        for i in 0..6 {
            broadcaster.publish(ping(i));
            while fast.try_recv().is_ok() {
                received += 1;
            }
        }
        assert_eq!(received, 6);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_queue() {
        let broadcaster = Broadcaster::new(8);
        let mut rx = broadcaster.subscribe("ui");
        broadcaster.publish(ping(0));

        assert!(broadcaster.unsubscribe("ui"));
        assert!(!broadcaster.unsubscribe("ui"));
        assert_eq!(broadcaster.publish(ping(1)), 0);

        // queued message survives, then the queue reports closed
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let broadcaster = Broadcaster::new(8);
        let rx = broadcaster.subscribe("gone");
        drop(rx);
        assert_eq!(broadcaster.publish(ping(0)), 0);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_queue() {
        let broadcaster = Broadcaster::new(8);
        let mut first = broadcaster.subscribe("ui");
        let mut second = broadcaster.subscribe("ui");
        assert_eq!(broadcaster.subscriber_count(), 1);

        broadcaster.publish(ping(0));
        assert!(first.recv().await.is_none());
        assert!(second.try_recv().is_ok());
    }
}
