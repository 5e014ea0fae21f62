//! Best-effort fan-out of progress events.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::ProgressEvent;

/// Identifier of a subscriber within one broadcaster.
pub type SubscriberId = u64;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<ProgressEvent>>>,
}

/// Fans progress events out to a dynamic set of subscribers.
///
/// Each subscriber owns a bounded channel. Delivery uses `try_send`; a
/// subscriber whose channel is full or closed is removed. The registry lock
/// is held for the whole delivery, so once [`unsubscribe`] returns no further
/// event is queued for that subscriber.
///
/// [`unsubscribe`]: ProgressBroadcaster::unsubscribe
#[derive(Clone, Default)]
pub struct ProgressBroadcaster {
    registry: Arc<Registry>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with room for `capacity` undelivered events.
    pub fn subscribe(&self, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.subscribers.lock().insert(id, tx);
        debug!(subscriber_id = id, "progress subscriber added");

        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.registry.subscribers.lock().remove(&id).is_some() {
            debug!(subscriber_id = id, "progress subscriber removed");
        }
    }

    /// Deliver `event` to every current subscriber. Never fails.
    pub fn broadcast(&self, event: ProgressEvent) {
        let mut subscribers = self.registry.subscribers.lock();
        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(subscriber_id = *id, "dropping lagging progress subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.lock().len()
    }
}

/// Receiving side of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<ProgressEvent>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next event. Returns `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.subscribers.lock().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProgressStep;
    use tokio_stream::StreamExt;

    fn event(message: &str) -> ProgressEvent {
        ProgressEvent::new("node_1", ProgressStep::Starting, message)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let broadcaster = ProgressBroadcaster::new();
        let mut a = broadcaster.subscribe(8);
        let mut b = broadcaster.subscribe(8);

        broadcaster.broadcast(event("hello"));

        assert_eq!(a.recv().await.unwrap().message, "hello");
        assert_eq!(b.next().await.unwrap().message, "hello");
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_noop() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.broadcast(event("nobody listens"));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_no_event_after_unsubscribe() {
        let broadcaster = ProgressBroadcaster::new();
        let mut sub = broadcaster.subscribe(8);

        broadcaster.broadcast(event("before"));
        broadcaster.unsubscribe(sub.id());
        broadcaster.broadcast(event("after"));

        assert_eq!(sub.recv().await.unwrap().message, "before");
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_full_subscriber_is_dropped() {
        let broadcaster = ProgressBroadcaster::new();
        let _slow = broadcaster.subscribe(1);

        broadcaster.broadcast(event("one"));
        assert_eq!(broadcaster.subscriber_count(), 1);
        broadcaster.broadcast(event("two"));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let broadcaster = ProgressBroadcaster::new();
        let sub = broadcaster.subscribe(4);
        assert_eq!(broadcaster.subscriber_count(), 1);
        drop(sub);
        assert_eq!(broadcaster.subscriber_count(), 0);
        broadcaster.broadcast(event("still fine"));
    }

    #[tokio::test]
    async fn test_unsubscribe_while_broadcasting_never_fails() {
        let broadcaster = ProgressBroadcaster::new();
        let subs: Vec<_> = (0..16).map(|_| broadcaster.subscribe(1024)).collect();

        let sender = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move {
                for i in 0..500 {
                    broadcaster.broadcast(event(&format!("event {i}")));
                    tokio::task::yield_now().await;
                }
            })
        };

        for sub in subs {
            broadcaster.unsubscribe(sub.id());
            tokio::task::yield_now().await;
        }

        sender.await.unwrap();
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
