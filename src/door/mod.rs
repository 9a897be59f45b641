//! # Door: lifetimes of dynamic subtrees.
//!
//! A [`Door`] is a placeholder in rendered content whose subtree can later be
//! updated, replaced or removed. While mounted, a door is backed by a tracker: its
//! own scheduler lane, cancellation token, [`Cinema`] of beam screens, child doors
//! and hooks. Every structural change retires the tracker and its whole subtree.
//!
//! ```text
//! Instance (Host)
//!   └─ root tracker ── thread, token, cinema
//!        ├─ Door#7 ── tracker ── thread, child token, cinema(parent = root cinema)
//!        │     └─ Door#9 ── tracker ...
//!        └─ Door#8 ── tracker ...
//! ```
//!
//! User code receives a [`Scope`]: the token and tracker of the door it runs in.
//! Scopes never keep a tracker or an instance alive.
//!
//! ## Rules
//! - Parents own child doors; doors and scopes point back with `Weak`.
//! - Hooks are keyed by door id. A door keeps its id across updates and loses it
//!   on replace, remove or remount.
//! - Killing a tracker cancels its token, kills its cinema and suspends every child door.

mod cinema;
mod door;
mod hook;
mod render;
mod tracker;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Arc, Weak};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::events::Bus;
use crate::instance::{Action, ActionCall, Call, CallResult};
use crate::shredder::Spawner;

pub(crate) use cinema::{Cinema, Init, ScreenWatcher, WatchSlot};
pub use door::{Completion, Door};
pub(crate) use door::render_root;
pub use hook::{DoorHook, FnHook, Hook, HookHandle, HookOutcome, HookRegistry, Request};
pub use render::{Content, FnContent, Renderer, content_fn};
pub(crate) use render::{Hole, Output};
pub(crate) use tracker::{Tracker, TrackerInner};

/// Services a door tree needs from its owning instance.
pub(crate) trait Host: Send + Sync + 'static {
    fn spawner(&self) -> &Spawner;

    fn new_id(&self) -> u64;

    /// Cinema of the root tracker; `None` before the root exists.
    fn root_cinema(&self) -> Option<Cinema>;

    fn hooks(&self) -> &HookRegistry;

    /// Queues an outbound call.
    fn call(&self, call: Arc<dyn Call>);

    fn bus(&self) -> &Bus;

    /// Instance id used in events.
    fn label(&self) -> &Arc<str>;
}

/// Execution context of code running inside a door.
///
/// Cheap to clone. A scope is cancelled when its door is updated, replaced,
/// removed or suspended, or when the instance ends.
#[derive(Clone)]
pub struct Scope {
    token: CancellationToken,
    tracker: Weak<TrackerInner>,
}

impl Scope {
    pub(crate) fn new(token: CancellationToken, tracker: Weak<TrackerInner>) -> Self {
        Self { token, tracker }
    }

    /// A scope bound to no door.
    ///
    /// Useful for driving source beams from background tasks; watchers cannot be
    /// attached through it.
    pub fn detached(token: CancellationToken) -> Self {
        Self {
            token,
            tracker: Weak::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves once the scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Id of the door this scope belongs to.
    pub fn door_id(&self) -> Option<u64> {
        self.tracker().map(|t| t.id())
    }

    /// Registers `hook` on this scope's door.
    ///
    /// Returns `None` if the scope is cancelled or its door has moved on.
    pub fn register_hook(&self, hook: impl Hook) -> Option<HookHandle> {
        if self.is_cancelled() {
            return None;
        }
        self.tracker()?.register_hook(Arc::new(hook))
    }

    /// Sends `action` to the browser.
    ///
    /// The call is dropped if the scope is cancelled before it is written.
    /// Returns `None` if the scope is already cancelled.
    pub fn call(&self, action: Action) -> Option<oneshot::Receiver<CallResult>> {
        if self.is_cancelled() {
            return None;
        }
        let host = self.host()?;
        let (call, rx) = ActionCall::reply(action, Vec::new(), Some(self.token.clone()));
        host.call(Arc::new(call));
        Some(rx)
    }

    pub(crate) fn tracker(&self) -> Option<Tracker> {
        self.tracker.upgrade().map(Tracker::from_inner)
    }

    pub(crate) fn host(&self) -> Option<Arc<dyn Host>> {
        self.tracker()?.host()
    }

    pub(crate) fn cinema(&self) -> Option<Cinema> {
        self.tracker().map(|t| t.cinema().clone())
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("door", &self.door_id())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
