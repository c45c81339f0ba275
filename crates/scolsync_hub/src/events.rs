//! Fan-out of change events to event-stream subscribers.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// One event pushed to every subscriber.
///
/// The hub never excludes the sender from delivery: a client that posted a
/// change receives its own notification and discards it by comparing
/// `sender_id` against its own identifier.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Event name, e.g. `db:changed` or `transfer:received`.
    pub event: String,
    /// Identifier of the client that caused the change, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    /// Event payload.
    pub data: serde_json::Value,
}

impl ChangeEvent {
    /// A `db:changed` notification.
    pub fn db_changed(change: &str, sender_id: Option<String>) -> Self {
        Self {
            event: "db:changed".into(),
            sender_id,
            data: serde_json::json!({ "type": change }),
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

/// Holds one sender handle per event-stream subscriber.
///
/// A subscriber is pruned the moment a delivery to it fails (its connection
/// closed); a broken subscriber never blocks or fails delivery to the rest.
#[derive(Default)]
pub struct EventBroadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBroadcaster {
    /// Creates an empty broadcaster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber; returns its id and the receiving end.
    pub fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().push(Subscriber { id, tx });
        (id, rx)
    }

    /// Removes a subscriber explicitly (connection close).
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    /// Delivers an event to every live subscriber; returns how many received
    /// it. Subscribers whose channel is gone are dropped here.
    pub fn broadcast(&self, event: &ChangeEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| s.tx.send(event.clone()).is_ok());
        let delivered = subscribers.len();
        tracing::debug!(event = %event.event, delivered, "broadcast");
        delivered
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_subscribers_receive_including_sender() {
        let broadcaster = EventBroadcaster::new();
        let (_id_a, mut rx_a) = broadcaster.subscribe();
        let (_id_b, mut rx_b) = broadcaster.subscribe();

        let event = ChangeEvent::db_changed("grades_batch", Some("A".into()));
        assert_eq!(broadcaster.broadcast(&event), 2);

        // Both clients get it; A is expected to self-filter on senderId.
        let got_a = rx_a.try_recv().unwrap();
        let got_b = rx_b.try_recv().unwrap();
        assert_eq!(got_a.sender_id.as_deref(), Some("A"));
        assert_eq!(got_b.event, "db:changed");
    }

    #[test]
    fn dead_subscriber_is_pruned_without_affecting_others() {
        let broadcaster = EventBroadcaster::new();
        let (_id_a, rx_a) = broadcaster.subscribe();
        let (_id_b, mut rx_b) = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        drop(rx_a); // connection closed

        let event = ChangeEvent::db_changed("grades_batch", None);
        assert_eq!(broadcaster.broadcast(&event), 1);
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn explicit_unsubscribe() {
        let broadcaster = EventBroadcaster::new();
        let (id, _rx) = broadcaster.subscribe();
        broadcaster.unsubscribe(id);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn event_serialization_shape() {
        let event = ChangeEvent::db_changed("grades_batch", Some("A".into()));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"db:changed""#));
        assert!(json.contains(r#""senderId":"A""#));
        assert!(json.contains(r#""type":"grades_batch""#));

        let anonymous = ChangeEvent::db_changed("grades_batch", None);
        let json = serde_json::to_string(&anonymous).unwrap();
        assert!(!json.contains("senderId"));
    }
}
