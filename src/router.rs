//! Typed fan-out of inbound frames to registered subscribers.
//!
//! The router is the sole fan-out point for validated frames. Subscribers are
//! keyed by [`FrameKind`] and invoked in registration order; a failing
//! subscriber is logged and never stops delivery to the rest. Dispatch walks
//! a snapshot of the registry, so subscribing or unsubscribing from inside a
//! callback is safe.

use crate::error::Result;
use crate::protocol::{FrameKind, ServerFrame};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Callback invoked for every dispatched frame of a subscribed kind.
pub type Subscriber = Arc<dyn Fn(&ServerFrame) -> Result<()> + Send + Sync>;

/// Identifies one subscription for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct MessageRouter {
    subscribers: Mutex<HashMap<FrameKind, Vec<(SubscriptionId, Subscriber)>>>,
    next_id: AtomicU64,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one frame kind. Callbacks for the same kind
    /// run in registration order.
    pub fn subscribe(&self, kind: FrameKind, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.entry(kind).or_default().push((id, subscriber));
        }
        id
    }

    /// Remove a subscription. Idempotent: removing an unknown or already
    /// removed id is a no-op.
    pub fn unsubscribe(&self, kind: FrameKind, id: SubscriptionId) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            if let Some(list) = subscribers.get_mut(&kind) {
                list.retain(|(existing, _)| *existing != id);
            }
        }
    }

    /// Number of live subscriptions for a kind.
    pub fn subscriber_count(&self, kind: FrameKind) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Deliver one frame to every subscriber of its kind, in registration
    /// order. Returns the number of subscribers reached.
    ///
    /// The registry lock is released before any callback runs, so callbacks
    /// may freely subscribe or unsubscribe; changes take effect from the next
    /// dispatch.
    pub fn dispatch(&self, frame: &ServerFrame) -> usize {
        let kind = frame.kind();
        let snapshot: Vec<(SubscriptionId, Subscriber)> = match self.subscribers.lock() {
            Ok(subscribers) => subscribers.get(&kind).cloned().unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        if snapshot.is_empty() {
            debug!("no subscribers for {kind} frame");
            return 0;
        }

        for (id, subscriber) in &snapshot {
            if let Err(e) = subscriber(frame) {
                warn!("subscriber {id:?} for {kind} failed: {e}");
            }
        }
        snapshot.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoryloomError;
    use std::sync::atomic::AtomicUsize;

    fn status_frame(message: &str) -> ServerFrame {
        ServerFrame::Status {
            message: Some(message.to_string()),
            paragraph_number: None,
        }
    }

    fn complete_frame() -> ServerFrame {
        ServerFrame::Complete { message: None }
    }

    #[test]
    fn test_dispatch_reaches_single_subscriber() {
        let router = MessageRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        router.subscribe(
            FrameKind::Status,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        assert_eq!(router.dispatch(&status_frame("working")), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_ignores_other_kinds() {
        let router = MessageRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        router.subscribe(
            FrameKind::Status,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        assert_eq!(router.dispatch(&complete_frame()), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_multiple_subscribers_invoked_in_registration_order() {
        let router = MessageRouter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = order.clone();
            router.subscribe(
                FrameKind::Status,
                Arc::new(move |_| {
                    order.lock().unwrap().push(label);
                    Ok(())
                }),
            );
        }

        assert_eq!(router.dispatch(&status_frame("x")), 3);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_subscriber_does_not_stop_delivery() {
        let router = MessageRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        router.subscribe(
            FrameKind::Status,
            Arc::new(|_| {
                Err(StoryloomError::Other("subscriber exploded".to_string()))
            }),
        );
        let counter = hits.clone();
        router.subscribe(
            FrameKind::Status,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        assert_eq!(router.dispatch(&status_frame("x")), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1, "later subscriber still ran");
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let router = MessageRouter::new();
        let id = router.subscribe(FrameKind::Status, Arc::new(|_| Ok(())));
        assert_eq!(router.subscriber_count(FrameKind::Status), 1);

        router.unsubscribe(FrameKind::Status, id);
        router.unsubscribe(FrameKind::Status, id);
        assert_eq!(router.subscriber_count(FrameKind::Status), 0);
        assert_eq!(router.dispatch(&status_frame("x")), 0);
    }

    #[test]
    fn test_unsubscribe_from_within_callback() {
        let router = Arc::new(MessageRouter::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let router_inner = Arc::downgrade(&router);
        let id_slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let slot = id_slot.clone();
        let counter = hits.clone();
        let id = router.subscribe(
            FrameKind::Status,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                // Remove ourselves mid-dispatch; takes effect next dispatch.
                if let (Some(router), Some(id)) =
                    (router_inner.upgrade(), *slot.lock().unwrap())
                {
                    router.unsubscribe(FrameKind::Status, id);
                }
                Ok(())
            }),
        );
        *id_slot.lock().unwrap() = Some(id);

        assert_eq!(router.dispatch(&status_frame("x")), 1);
        assert_eq!(router.dispatch(&status_frame("x")), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_from_within_callback() {
        let router = Arc::new(MessageRouter::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let router_inner = Arc::downgrade(&router);
        let counter = hits.clone();
        router.subscribe(
            FrameKind::Status,
            Arc::new(move |_| {
                if let Some(router) = router_inner.upgrade() {
                    let counter = counter.clone();
                    router.subscribe(
                        FrameKind::Complete,
                        Arc::new(move |_| {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }),
                    );
                }
                Ok(())
            }),
        );

        router.dispatch(&status_frame("x"));
        assert_eq!(router.subscriber_count(FrameKind::Complete), 1);

        router.dispatch(&complete_frame());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_with_no_subscribers_is_harmless() {
        let router = MessageRouter::new();
        assert_eq!(router.dispatch(&status_frame("nobody listening")), 0);
    }
}
