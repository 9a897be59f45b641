//! # Simple logging subscriber for debugging and demos.
//!
//! [`LogWriter`] prints events to stdout, one line per event.
//!
//! ## Output format
//! ```text
//! [instance-created] instance=k2x9
//! [connection-rolled] instance=k2x9 reason="size"
//! [hook-triggered] instance=k2x9 door=12 hook=7
//! [call-failed] instance=k2x9 action=door_update reason="broken pipe"
//! [instance-ended] instance=k2x9 reason="killed"
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Simple stdout logging subscriber.
///
/// Enabled via the `logging` feature. Not intended for production use.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    fn label(kind: EventKind) -> &'static str {
        match kind {
            EventKind::SubscriberPanicked => "subscriber-panicked",
            EventKind::SubscriberOverflow => "subscriber-overflow",
            EventKind::InstanceCreated => "instance-created",
            EventKind::InstanceEnded => "instance-ended",
            EventKind::TaskPanicked => "task-panicked",
            EventKind::SyncError => "sync-error",
            EventKind::ConnectionOpened => "connection-opened",
            EventKind::ConnectionRolled => "connection-rolled",
            EventKind::ConnectionClosed => "connection-closed",
            EventKind::CallQueued => "call-queued",
            EventKind::CallFailed => "call-failed",
            EventKind::QueueLimit => "queue-limit",
            EventKind::HookTriggered => "hook-triggered",
            EventKind::HookPanicked => "hook-panicked",
            EventKind::HookCancelled => "hook-cancelled",
            EventKind::DoorSuspended => "door-suspended",
        }
    }

    /// Formats an event as a single log line.
    pub fn line(e: &Event) -> String {
        let mut out = format!("[{}]", Self::label(e.kind));
        if let Some(instance) = &e.instance {
            out.push_str(&format!(" instance={instance}"));
        }
        if let Some(door) = e.door {
            out.push_str(&format!(" door={door}"));
        }
        if let Some(hook) = e.hook {
            out.push_str(&format!(" hook={hook}"));
        }
        if let Some(action) = e.action {
            out.push_str(&format!(" action={action}"));
        }
        if let Some(reason) = &e.reason {
            out.push_str(&format!(" reason={reason:?}"));
        }
        out
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        println!("{}", Self::line(e));
    }

    fn name(&self) -> &'static str {
        "log-writer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_format() {
        let ev = Event::new(EventKind::HookTriggered)
            .with_instance("k2x9")
            .with_door(12)
            .with_hook(7);
        assert_eq!(LogWriter::line(&ev), "[hook-triggered] instance=k2x9 door=12 hook=7");

        let ev = Event::new(EventKind::InstanceEnded).with_reason("killed");
        assert_eq!(LogWriter::line(&ev), "[instance-ended] reason=\"killed\"");
    }
}
