//! # Instance layer: pages, outboxes and the runtime.
//!
//! ```text
//! Runtime ── id ──► Instance ── Host ──► door tree (trackers, hooks, beams)
//!                      │
//!                      └─ outbox: every Call gets a sequence number
//!                           ├─ Solitaire ── Deck ── wire units ──► io::Write (stream)
//!                           └─ Connector ── one call at a time ──► EventSender
//!
//! browser reports / acknowledgements ──► results resolve the calls
//! ```
//!
//! ## Rules
//! - Calls are delivered in sequence order; numbers that will never carry a
//!   call are accounted for explicitly (filler units or skipped sends).
//! - Every call is resolved exactly once: with the browser's result, with
//!   `Cancelled` when it is dropped, or with `InstanceEnded`.
//! - A report that contradicts what was issued ends the instance.

mod action;
mod call;
mod connector;
mod deck;
#[allow(clippy::module_inception)]
mod instance;
mod report;
mod runtime;
mod solitaire;
mod timer;
mod wire;

pub use action::Action;
pub use call::{ActionCall, Call, CallData, CallResult};
pub use connector::{Connector, EventSender};
pub use deck::Deck;
pub use instance::{EndCause, Instance};
pub use report::{CallResponse, Gap, Report};
pub use runtime::Runtime;
pub use solitaire::{ChannelSink, Solitaire};
pub use wire::Signal;
