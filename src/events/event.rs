//! # Runtime events emitted by instances and their components.
//!
//! [`EventKind`] classifies events in four groups:
//! - **Subscriber events**: fan-out problems (overflow, panic)
//! - **Instance events**: creation, end, panicking task bodies, sync errors
//! - **Transport events**: connections opened, rolled and closed; call failures
//! - **Door events**: hooks triggered or cancelled, trackers suspended
//!
//! Transport events also cover the outbox: calls queued, failed or rejected at the queue limit.
//!
//! [`Event`] carries the metadata each kind sets.
//!
//! ## Ordering guarantees
//! Each event has a process-wide sequence number (`seq`) that increases monotonically.
//!
//! ## Example
//! ```rust
//! use doorframe::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::HookTriggered)
//!     .with_instance("k2x9")
//!     .with_door(12)
//!     .with_hook(7);
//!
//! assert_eq!(ev.kind, EventKind::HookTriggered);
//! assert_eq!(ev.door, Some(12));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `reason`: subscriber name and panic message
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `reason`: subscriber name and cause
    SubscriberOverflow,

    // === Instance events ===
    /// A new instance was created.
    ///
    /// Sets:
    /// - `instance`: instance id
    InstanceCreated,

    /// An instance ended.
    ///
    /// Sets:
    /// - `instance`: instance id
    /// - `reason`: end cause label (`killed`, `suspend`, `sync_error`)
    InstanceEnded,

    /// A scheduler task body panicked; its instance is ended.
    ///
    /// Sets:
    /// - `instance`: instance id (when known)
    /// - `reason`: panic message
    TaskPanicked,

    /// The outbox rejected a report or an insert.
    ///
    /// Sets:
    /// - `instance`: instance id
    /// - `reason`: error message
    SyncError,

    // === Transport events ===
    /// A transport connection was attached.
    ///
    /// Sets:
    /// - `instance`: instance id
    ConnectionOpened,

    /// A streaming connection was rolled (size or time limit).
    ///
    /// Sets:
    /// - `instance`: instance id
    /// - `reason`: `size` or `time`
    ConnectionRolled,

    /// A transport connection ended.
    ///
    /// Sets:
    /// - `instance`: instance id
    /// - `reason`: cause
    ConnectionClosed,

    /// A call was accepted by the outbox.
    ///
    /// Sets:
    /// - `instance`: instance id
    /// - `action`: action name
    CallQueued,

    /// Writing a call to the transport failed.
    ///
    /// Sets:
    /// - `instance`: instance id
    /// - `action`: action name (when known)
    /// - `reason`: io error
    CallFailed,

    /// The outbox rejected a call because its queue is full.
    ///
    /// Sets:
    /// - `instance`: instance id
    /// - `action`: action name
    QueueLimit,

    // === Door events ===
    /// A hook was triggered by a browser request.
    ///
    /// Sets:
    /// - `instance`, `door`, `hook`
    HookTriggered,

    /// A hook handler panicked.
    ///
    /// Sets:
    /// - `instance`, `door`, `hook`
    /// - `reason`: panic message
    HookPanicked,

    /// A hook was cancelled.
    ///
    /// Sets:
    /// - `instance`, `door`, `hook`
    HookCancelled,

    /// A door's tracker was suspended (updated, replaced or removed).
    ///
    /// Sets:
    /// - `instance`, `door`
    DoorSuspended,
}

/// Runtime event with optional metadata.
#[derive(Clone, Debug)]
pub struct Event {
    /// Process-wide, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,
    /// Instance id, if applicable.
    pub instance: Option<Arc<str>>,
    /// Door (tracker) id, if applicable.
    pub door: Option<u64>,
    /// Hook id, if applicable.
    pub hook: Option<u64>,
    /// Outbound action name, if applicable.
    pub action: Option<&'static str>,
    /// Human-readable reason (errors, causes, panic messages).
    pub reason: Option<Arc<str>>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            instance: None,
            door: None,
            hook: None,
            action: None,
            reason: None,
        }
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches an instance id.
    #[inline]
    pub fn with_instance(mut self, instance: impl Into<Arc<str>>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Attaches a door id.
    #[inline]
    pub fn with_door(mut self, door: u64) -> Self {
        self.door = Some(door);
        self
    }

    /// Attaches a hook id.
    #[inline]
    pub fn with_hook(mut self, hook: u64) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Attaches an outbound action name.
    #[inline]
    pub fn with_action(mut self, action: &'static str) -> Self {
        self.action = Some(action);
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_reason(format!("subscriber={subscriber} panic={info}"))
    }

    #[inline]
    pub fn is_subscriber_overflow(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberOverflow)
    }

    #[inline]
    pub fn is_subscriber_panic(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberPanicked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_increases() {
        let a = Event::new(EventKind::ConnectionOpened);
        let b = Event::new(EventKind::ConnectionClosed);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn test_subscriber_helpers() {
        let ev = Event::subscriber_overflow("audit", "full");
        assert!(ev.is_subscriber_overflow());
        assert_eq!(ev.reason.as_deref(), Some("subscriber=audit reason=full"));
        assert!(Event::subscriber_panicked("audit", "boom".into()).is_subscriber_panic());
    }
}
