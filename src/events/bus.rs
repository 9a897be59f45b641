//! # Event bus for runtime diagnostics.
//!
//! [`Bus`] wraps [`tokio::sync::broadcast`]. Instances, their spawners, outboxes
//! and hook gates publish into it; the [`Runtime`](crate::Runtime) listener
//! forwards everything to the [`SubscriberSet`](crate::SubscriberSet).
//!
//! ```text
//! Publishers:                          Consumer:
//!   Spawner (panics)  ──┐
//!   Solitaire/Connector ┼──► Bus ───► Runtime listener ───► SubscriberSet
//!   HookRegistry      ──┤
//!   Instance          ──┘
//! ```
//!
//! ## Rules
//! - `publish()` never blocks and never fails; without receivers the event is dropped.
//! - One ring buffer of `capacity` events is shared by all receivers.
//! - Receivers that fall behind observe `RecvError::Lagged(n)` and skip `n` events.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for runtime events.
///
/// Cheap to clone; every clone publishes into the same channel.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a new bus with the given channel capacity (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel::<Event>(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to all active receivers.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Creates a receiver that observes events sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publishes a borrowed event by cloning it.
    pub fn publish_ref(&self, ev: &Event) {
        let _ = self.tx.send(ev.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = Bus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(Event::new(EventKind::InstanceCreated).with_instance("abc"));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::InstanceCreated);
        assert_eq!(ev.instance.as_deref(), Some("abc"));
    }

    #[test]
    fn test_publish_without_receivers() {
        let bus = Bus::new(0);
        bus.publish(Event::new(EventKind::SyncError));
        bus.publish_ref(&Event::new(EventKind::SyncError));
    }
}
