//! # Hooks: server callbacks reachable from browser requests.
//!
//! A door registers a [`Hook`] through its [`Scope`]; the browser reaches it with a
//! request keyed by `(instance, door, hook)`. Each registration is wrapped in a
//! [`DoorHook`] gate and stored in the instance's [`HookRegistry`].
//!
//! ```text
//! trigger ─► serial lock ─► running += 1 ─► hook.trigger() ─► running -= 1
//!                                                               │
//! cancel ─► done = true ─► running == 0 ? hook.cancel() : ◄─────┘ last trigger cancels
//! ```
//!
//! ## Rules
//! - Triggers of one hook run one at a time, in arrival order.
//! - `cancel` racing a trigger waits for it: the cancel callback runs once the
//!   trigger returns or is dropped, and never twice.
//! - A hook that reports `done` (or panics) is never cancelled afterwards.
//! - A panicking trigger answers with status 500 and retires the hook.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{HookError, panic_message};
use crate::events::{Bus, Event, EventKind};

use super::{Host, Scope};

/// Browser request delivered to a hook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub body: Vec<u8>,
}

impl Request {
    /// A `POST` request carrying `body`.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: "POST".to_string(),
            body: body.into(),
        }
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Response produced by a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOutcome {
    pub status: u16,
    pub body: Vec<u8>,
    /// Retires the hook after this trigger.
    pub done: bool,
}

impl HookOutcome {
    /// Empty `200` response that keeps the hook alive.
    pub fn ok() -> Self {
        Self {
            status: 200,
            body: Vec::new(),
            done: false,
        }
    }

    /// `200` response with a JSON body.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            body: serde_json::to_vec(value)?,
            ..Self::ok()
        })
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Marks the hook as finished.
    pub fn done(mut self) -> Self {
        self.done = true;
        self
    }
}

/// A server callback bound to a door.
#[async_trait]
pub trait Hook: Send + Sync + 'static {
    /// Serves one browser request.
    async fn trigger(&self, scope: &Scope, req: Request) -> HookOutcome;

    /// Called once when the hook is retired without reporting `done`.
    fn cancel(&self, _scope: &Scope) {}
}

type CancelFn = Box<dyn Fn(&Scope) + Send + Sync>;

/// [`Hook`] built from a synchronous closure.
///
/// # Example
/// ```
/// use doorframe::{FnHook, HookOutcome};
///
/// let hook = FnHook::new(|_scope, req| HookOutcome::ok().with_body(req.body))
///     .on_cancel(|_scope| println!("hook retired"));
/// # let _ = hook;
/// ```
pub struct FnHook<F> {
    f: F,
    on_cancel: Option<CancelFn>,
}

impl<F> FnHook<F>
where
    F: Fn(&Scope, Request) -> HookOutcome + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f, on_cancel: None }
    }

    pub fn on_cancel(mut self, c: impl Fn(&Scope) + Send + Sync + 'static) -> Self {
        self.on_cancel = Some(Box::new(c));
        self
    }
}

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(&Scope, Request) -> HookOutcome + Send + Sync + 'static,
{
    async fn trigger(&self, scope: &Scope, req: Request) -> HookOutcome {
        (self.f)(scope, req)
    }

    fn cancel(&self, scope: &Scope) {
        if let Some(c) = &self.on_cancel {
            c(scope);
        }
    }
}

struct Gate {
    running: usize,
    done: bool,
}

/// One trigger in flight; releases the gate when the trigger returns or is dropped.
struct Running<'a> {
    hook: &'a DoorHook,
    done: bool,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        let last = {
            let mut gate = self.hook.lock();
            gate.running -= 1;
            if self.done {
                gate.done = true;
            }
            !self.done && gate.running == 0 && gate.done
        };
        if last {
            self.hook.hook.cancel(&self.hook.scope);
        }
    }
}

/// Trigger/cancel gate around one registered hook.
pub struct DoorHook {
    hook: Arc<dyn Hook>,
    scope: Scope,
    gate: Mutex<Gate>,
    serial: tokio::sync::Mutex<()>,
}

impl DoorHook {
    pub(crate) fn new(hook: Arc<dyn Hook>, scope: Scope) -> Self {
        Self {
            hook,
            scope,
            gate: Mutex::new(Gate {
                running: 0,
                done: false,
            }),
            serial: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs the hook for `req`.
    ///
    /// Fails with [`HookError::Cancelled`] once the hook is retired and with
    /// [`HookError::Panicked`] if the handler panics.
    pub async fn trigger(&self, req: Request) -> Result<HookOutcome, HookError> {
        let _serial = self.serial.lock().await;
        let mut running = {
            let mut gate = self.lock();
            if gate.done {
                return Err(HookError::Cancelled);
            }
            gate.running += 1;
            Running {
                hook: self,
                done: false,
            }
        };

        let res = AssertUnwindSafe(self.hook.trigger(&self.scope, req))
            .catch_unwind()
            .await;
        match res {
            Ok(outcome) => {
                running.done = outcome.done;
                Ok(outcome)
            }
            Err(panic) => {
                running.done = true;
                Err(HookError::Panicked {
                    message: panic_message(panic.as_ref()),
                })
            }
        }
    }

    /// Retires the hook; the cancel callback runs now or after the running trigger.
    pub fn cancel(&self) {
        let now = {
            let mut gate = self.lock();
            if gate.done {
                return;
            }
            gate.done = true;
            gate.running == 0
        };
        if now {
            self.hook.cancel(&self.scope);
        }
    }

    pub fn is_done(&self) -> bool {
        self.lock().done
    }
}

/// Handle to a registered hook.
#[derive(Clone, Debug)]
pub struct HookHandle {
    door: u64,
    hook: u64,
    host: Weak<dyn Host>,
}

impl HookHandle {
    pub(crate) fn new(door: u64, hook: u64, host: Weak<dyn Host>) -> Self {
        Self { door, hook, host }
    }

    pub fn door_id(&self) -> u64 {
        self.door
    }

    pub fn hook_id(&self) -> u64 {
        self.hook
    }

    /// Retires the hook.
    pub fn cancel(&self) {
        if let Some(host) = self.host.upgrade() {
            host.hooks().cancel_hook(self.door, self.hook);
        }
    }
}

type DoorHooks = HashMap<u64, HashMap<u64, Arc<DoorHook>>>;

/// Per-instance registry: `door id -> hook id -> gate`.
pub struct HookRegistry {
    hooks: Mutex<DoorHooks>,
    bus: Bus,
    label: Arc<str>,
}

impl HookRegistry {
    pub(crate) fn new(bus: Bus, label: Arc<str>) -> Self {
        Self {
            hooks: Mutex::new(HashMap::new()),
            bus,
            label,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DoorHooks> {
        self.hooks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn event(&self, kind: EventKind, door: u64, hook: u64) -> Event {
        Event::new(kind)
            .with_instance(self.label.clone())
            .with_door(door)
            .with_hook(hook)
    }

    pub(crate) fn register(&self, door: u64, hook: u64, gate: Arc<DoorHook>) {
        self.lock().entry(door).or_default().insert(hook, gate);
    }

    fn get(&self, door: u64, hook: u64) -> Option<Arc<DoorHook>> {
        self.lock().get(&door).and_then(|hooks| hooks.get(&hook)).cloned()
    }

    fn remove(&self, door: u64, hook: u64) -> Option<Arc<DoorHook>> {
        let mut hooks = self.lock();
        let door_hooks = hooks.get_mut(&door)?;
        let gate = door_hooks.remove(&hook);
        if door_hooks.is_empty() {
            hooks.remove(&door);
        }
        gate
    }

    /// Delivers `req` to hook `hook` of door `door`.
    pub async fn trigger(&self, door: u64, hook: u64, req: Request) -> Result<HookOutcome, HookError> {
        let gate = self.get(door, hook).ok_or(HookError::NotFound { door, hook })?;
        self.bus.publish(self.event(EventKind::HookTriggered, door, hook));
        match gate.trigger(req).await {
            Ok(outcome) => {
                if outcome.done {
                    self.remove(door, hook);
                }
                Ok(outcome)
            }
            Err(HookError::Panicked { message }) => {
                self.remove(door, hook);
                self.bus.publish(
                    self.event(EventKind::HookPanicked, door, hook)
                        .with_reason(message.clone()),
                );
                Err(HookError::Panicked { message })
            }
            Err(e) => Err(e),
        }
    }

    /// Retires one hook.
    pub fn cancel_hook(&self, door: u64, hook: u64) {
        if let Some(gate) = self.remove(door, hook) {
            gate.cancel();
            self.bus.publish(self.event(EventKind::HookCancelled, door, hook));
        }
    }

    /// Retires every hook of `door`.
    pub fn cancel_hooks(&self, door: u64) {
        let Some(hooks) = self.lock().remove(&door) else {
            return;
        };
        for (hook, gate) in hooks {
            gate.cancel();
            self.bus.publish(self.event(EventKind::HookCancelled, door, hook));
        }
    }

    /// Retires every hook of the instance.
    pub fn cancel_all(&self) {
        let all = std::mem::take(&mut *self.lock());
        for (door, hooks) in all {
            for (hook, gate) in hooks {
                gate.cancel();
                self.bus.publish(self.event(EventKind::HookCancelled, door, hook));
            }
        }
    }

    /// Number of live hooks.
    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
