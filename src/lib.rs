//! # doorframe
//!
//! **Doorframe** is the concurrency core of a server-driven UI: the server keeps
//! the canonical page and pushes incremental updates to the browser, while the
//! browser reaches back through hooks.
//!
//! It provides a cooperative lane scheduler, reactive values that every part of
//! a page observes consistently, lifetimes for dynamic subtrees, and an ordered
//! outbox that survives dropped and replaced connections.
//!
//! ## Architecture
//! ### Overview
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  Runtime                                                             │
//! │  - Bus (broadcast events) ──► SubscriberSet ──► LogWriter / custom   │
//! │  - instances by id                                                   │
//! └──────┬───────────────────────────────────────────────────────────────┘
//!        ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  Instance                                                            │
//! │  - Spawner (bounded blocking pool) + Threads (lanes)                 │
//! │  - root Tracker ── Doors ── Trackers ...   (subtree lifetimes)       │
//! │  - Cinemas / Screens ◄── SourceBeam / Beam (consistent propagation)  │
//! │  - HookRegistry (browser ─► server)                                  │
//! │  - outbox (server ─► browser): Solitaire (stream) | Connector        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ### Lifecycle
//! ```text
//! Runtime::create ──► Instance::render(page) ──► html (doors get ids, hooks register)
//!
//! loop {
//!   ├─► browser connects (report) ──► outbox writes queued calls in order
//!   ├─► hook request ──► DoorHook::trigger ──► beams update ──► doors re-render
//!   │                                                  └─► DoorUpdate calls
//!   └─► exit:
//!        - TTL without connection / failed render / task panic ─► Killed
//!        - browser left the page                                ─► Suspend
//!        - report contradicts the outbox                        ─► SyncError
//! }
//! ```
//!
//! ## Features
//! | Area              | Description                                                  | Key types / traits                          |
//! |-------------------|--------------------------------------------------------------|---------------------------------------------|
//! | **Scheduler**     | Lanes with read/write/starving-write admission and joins.    | [`Spawner`], [`Thread`], [`shredder::run`]  |
//! | **Beams**         | Versioned values, derived projections, render-consistent.    | [`SourceBeam`], [`Beam`], [`Watcher`]       |
//! | **Doors**         | Dynamic subtrees with their own lifetimes and hooks.         | [`Door`], [`Scope`], [`Content`], [`Hook`]  |
//! | **Outbox**        | Ordered, gap-tolerant delivery of calls to the browser.      | [`Deck`], [`Solitaire`], [`Connector`]      |
//! | **Runtime**       | Instances by id, routing, shutdown.                          | [`Runtime`], [`Instance`]                   |
//! | **Subscriber API**| Hook into runtime events (logging, metrics, custom).         | [`Subscribe`], [`Event`]                    |
//! | **Errors**        | Typed errors for every failure surface.                      | [`DeckError`], [`ConnectError`], ...        |
//! | **Configuration** | Centralize outbox and instance timings.                      | [`Config`]                                  |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`LogWriter`] _(demo/reference only)_.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use doorframe::{Config, Door, Runtime, content_fn};
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Build subscribers (optional)
//!     #[cfg(feature = "logging")]
//!     let subs: Vec<Arc<dyn doorframe::Subscribe>> = vec![Arc::new(doorframe::LogWriter)];
//!     #[cfg(not(feature = "logging"))]
//!     let subs: Vec<Arc<dyn doorframe::Subscribe>> = Vec::new();
//!
//!     let runtime = Runtime::new(Config::default(), subs);
//!     let instance = runtime.create();
//!
//!     let counter = Door::with_content("0");
//!     let page = {
//!         let counter = counter.clone();
//!         content_fn(move |r| {
//!             r.write_str("<main>");
//!             r.render(&counter)?;
//!             r.write_str("</main>");
//!             Ok(())
//!         })
//!     };
//!     let html = instance.render(page).await?;
//!     assert!(html.starts_with("<main><d0-0r"));
//!
//!     // Later updates travel through the outbox as `door_update` calls.
//!     let _ = counter.update("1");
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```
mod beam;
mod config;
mod door;
mod error;
mod events;
mod ids;
mod instance;
pub mod shredder;
mod subscribers;
mod valve;

// ---- Public re-exports ----

pub use beam::{Beam, Propagation, SourceBeam, WatchHandle, Watcher};
pub use config::{Config, Transport};
pub use door::{
    Completion, Content, Door, DoorHook, FnContent, FnHook, Hook, HookHandle, HookOutcome, HookRegistry,
    Renderer, Request, Scope, content_fn,
};
pub use error::{
    CallError, ConnectError, DeckError, DoorError, HookError, RenderError, ReportError, RuntimeError,
};
pub use events::{Bus, Event, EventKind};
pub use ids::IdGen;
pub use instance::{
    Action, ActionCall, Call, CallData, CallResponse, CallResult, ChannelSink, Connector, Deck, EndCause,
    EventSender, Gap, Instance, Report, Runtime, Signal, Solitaire,
};
pub use shredder::{Joined, Spawner, Thread};
pub use subscribers::{Subscribe, SubscriberSet};
pub use valve::Valve;

// Optional: expose a simple built-in logger subscriber (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
