//! # SubscriberSet: non-blocking fan-out over multiple subscribers
//!
//! [`SubscriberSet`] hands each [`Event`] to every subscriber **without awaiting**
//! their processing.
//!
//! ## What it guarantees
//! - `emit(&Event)` returns immediately.
//! - Per-subscriber FIFO (queue order).
//! - Panics inside subscribers are caught and published as `SubscriberPanicked`.
//! - A full queue drops the event for that subscriber and publishes
//!   `SubscriberOverflow`; an overflow event that overflows is not re-published.
//!
//! ## What it does **not** guarantee
//! - No global ordering across different subscribers.
//! - No retries on per-subscriber queue overflow.
//!
//! ```text
//!    emit(&Event)
//!        ├────────────────► [queue S1] ─► worker S1 ─► on_event()
//!        └────────────────► [queue SN] ─► worker SN ─► on_event()
//! ```

use std::sync::Arc;

use futures::FutureExt;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::error::panic_message;
use crate::events::{Bus, Event, EventKind};

use super::Subscribe;

struct SubscriberChannel {
    name: &'static str,
    sender: mpsc::Sender<Arc<Event>>,
}

/// Composite fan-out with per-subscriber bounded queues and worker tasks.
pub struct SubscriberSet {
    channels: Vec<SubscriberChannel>,
    workers: Vec<JoinHandle<()>>,
    bus: Bus,
}

impl SubscriberSet {
    /// Creates a new set and spawns one worker per subscriber.
    ///
    /// Panic and overflow reports are published on `bus`.
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(subs: Vec<Arc<dyn Subscribe>>, bus: Bus) -> Self {
        let mut channels = Vec::with_capacity(subs.len());
        let mut workers = Vec::with_capacity(subs.len());

        for sub in subs {
            let cap = sub.queue_capacity().max(1);
            let name = sub.name();
            let (tx, mut rx) = mpsc::channel::<Arc<Event>>(cap);
            let bus_for_worker = bus.clone();

            let handle = tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    let fut = sub.on_event(ev.as_ref());
                    if let Err(panic) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                        bus_for_worker.publish(Event::subscriber_panicked(name, panic_message(panic.as_ref())));
                    }
                }
            });

            channels.push(SubscriberChannel { name, sender: tx });
            workers.push(handle);
        }

        Self {
            channels,
            workers,
            bus,
        }
    }

    /// Fan-out one event to all subscribers (non-blocking).
    ///
    /// A full or closed queue drops the event for that subscriber only.
    pub fn emit(&self, event: &Event) {
        let ev = Arc::new(event.clone());
        let is_overflow = matches!(ev.kind, EventKind::SubscriberOverflow);
        for channel in &self.channels {
            let reason = match channel.sender.try_send(Arc::clone(&ev)) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(_)) => "full",
                Err(mpsc::error::TrySendError::Closed(_)) => "closed",
            };
            if !is_overflow {
                self.bus.publish(Event::subscriber_overflow(channel.name, reason));
            }
        }
    }

    /// Forwards every bus event to this set until `token` is cancelled or the bus closes.
    ///
    /// Events already buffered when `token` is cancelled are still forwarded.
    pub fn listen(self: &Arc<Self>, bus: &Bus, token: CancellationToken) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        let set = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    msg = rx.recv() => match msg {
                        Ok(ev) => set.emit(&ev),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            eprintln!("[doorframe] subscriber listener lagged by {n} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
        })
    }

    /// Graceful shutdown: close all queues and await worker completion.
    pub async fn shutdown(self) {
        drop(self.bus);
        drop(self.channels);
        for h in self.workers {
            let _ = h.await;
        }
    }

    /// True if there are no subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Number of subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    struct Collect(mpsc::UnboundedSender<EventKind>);

    #[async_trait]
    impl Subscribe for Collect {
        async fn on_event(&self, event: &Event) {
            let _ = self.0.send(event.kind);
        }

        fn name(&self) -> &'static str {
            "collect"
        }
    }

    struct Explode;

    #[async_trait]
    impl Subscribe for Explode {
        async fn on_event(&self, _event: &Event) {
            panic!("subscriber exploded");
        }
    }

    #[tokio::test]
    async fn test_emit_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bus = Bus::new(8);
        let mut published = bus.subscribe();
        let set = SubscriberSet::new(vec![Arc::new(Collect(tx)), Arc::new(Explode)], bus);
        assert_eq!(set.len(), 2);
        set.emit(&Event::new(EventKind::InstanceCreated));
        set.emit(&Event::new(EventKind::InstanceEnded));
        assert_eq!(rx.recv().await, Some(EventKind::InstanceCreated));
        assert_eq!(rx.recv().await, Some(EventKind::InstanceEnded));

        let ev = published.recv().await.unwrap();
        assert!(ev.is_subscriber_panic());
        assert!(ev.reason.as_deref().unwrap().contains("panic=subscriber exploded"));
        set.shutdown().await;
    }

    #[tokio::test]
    async fn test_listen_forwards_bus() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bus = Bus::new(8);
        let set = Arc::new(SubscriberSet::new(vec![Arc::new(Collect(tx))], bus.clone()));
        let token = CancellationToken::new();
        let handle = set.listen(&bus, token.clone());
        bus.publish(Event::new(EventKind::SyncError));
        assert_eq!(rx.recv().await, Some(EventKind::SyncError));
        token.cancel();
        handle.await.unwrap();
    }

    struct Stuck {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Subscribe for Stuck {
        async fn on_event(&self, _event: &Event) {
            self.entered.notify_one();
            self.release.notified().await;
        }

        fn name(&self) -> &'static str {
            "stuck"
        }

        fn queue_capacity(&self) -> usize {
            1
        }
    }

    #[tokio::test]
    async fn test_overflow_is_published() {
        let bus = Bus::new(8);
        let mut published = bus.subscribe();
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let stuck = Stuck {
            entered: entered.clone(),
            release: release.clone(),
        };
        let set = SubscriberSet::new(vec![Arc::new(stuck)], bus);

        set.emit(&Event::new(EventKind::CallQueued));
        entered.notified().await;
        set.emit(&Event::new(EventKind::CallQueued));
        set.emit(&Event::new(EventKind::CallQueued));
        set.emit(&Event::subscriber_overflow("other", "full"));

        let ev = published.recv().await.unwrap();
        assert!(ev.is_subscriber_overflow());
        assert_eq!(ev.reason.as_deref(), Some("subscriber=stuck reason=full"));
        assert!(published.try_recv().is_err());

        for _ in 0..3 {
            release.notify_one();
        }
        set.shutdown().await;
    }

    #[test]
    fn test_empty_set() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let set = SubscriberSet::new(Vec::new(), Bus::new(1));
            assert!(set.is_empty());
            set.emit(&Event::new(EventKind::ConnectionOpened));
        });
    }
}
