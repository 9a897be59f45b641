//! Runtime events: types and broadcast bus.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `Spawner` (task panics), `Solitaire`/`Connector` (connections,
//!   write failures), `HookRegistry` (hooks), `Instance` (lifecycle, sync errors),
//!   `SubscriberSet` workers (overflow/panic).
//! - **Consumers**: the `Runtime` listener, which fans out to `SubscriberSet`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
