//! # Event subscriber trait.
//!
//! [`Subscribe`] is the extension point for observing a [`Runtime`](crate::Runtime):
//! instance lifecycle, transport connections, hook traffic and panics.
//!
//! ```text
//! SubscriberSet ──► [bounded queue] ──► worker task ──► subscriber.on_event()
//!                                    └─► panic caught and reported
//! ```
//!
//! ## Rules
//! - A slow subscriber only affects its own queue.
//! - Overflow drops the event for that subscriber only.
//! - Events are processed sequentially (FIFO) per subscriber.
//!
//! ## Example
//! ```rust
//! use async_trait::async_trait;
//! use doorframe::{Event, EventKind, Subscribe};
//!
//! struct SyncAlarm;
//!
//! #[async_trait]
//! impl Subscribe for SyncAlarm {
//!     async fn on_event(&self, ev: &Event) {
//!         if matches!(ev.kind, EventKind::SyncError) {
//!             // page someone
//!         }
//!     }
//!
//!     fn name(&self) -> &'static str { "sync-alarm" }
//! }
//! ```

use async_trait::async_trait;

use crate::events::Event;

/// Event subscriber for runtime observability.
///
/// Runs on a dedicated worker task with its own bounded queue; panics are caught.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Processes a single event.
    async fn on_event(&self, event: &Event);

    /// Returns the subscriber name used in overflow/panic reports.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Returns the preferred queue capacity for this subscriber (clamped to at least 1).
    ///
    /// Default: 1024.
    fn queue_capacity(&self) -> usize {
        1024
    }
}
