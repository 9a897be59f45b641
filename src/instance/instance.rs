//! # Instance: one live page.
//!
//! An instance owns everything a rendered page needs while the browser keeps it
//! open: the scheduler, the door tree, the hook registry and one outbox.
//!
//! ```text
//! Instance::new ─► spawner, root tracker, outbox (Solitaire | Connector), TTL timer
//! render(content) ─► root html ─► ready valve opens (hooks start serving)
//! trigger_hook ─► wait ready ─► HookRegistry ─► ReportHook(track)
//! connect_* ─► outbox
//! end(cause) ─► outbox end ─► hooks cancelled ─► root suspended ─► spawner killed
//! ```
//!
//! ## Rules
//! - `end` is idempotent; the first cause wins.
//! - A failed render, an expired TTL or a panicking task body ends with [`EndCause::Killed`].
//! - An integrity violation in the outbox ends with [`EndCause::SyncError`].
//! - Calls made after the end resolve with [`CallError::InstanceEnded`].

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Transport};
use crate::door::{Cinema, Content, Host, HookOutcome, HookRegistry, Request, Scope, Tracker, render_root};
use crate::error::{CallError, ConnectError, DeckError, HookError, RenderError};
use crate::events::{Bus, Event, EventKind};
use crate::ids::{self, IdGen};
use crate::shredder::Spawner;
use crate::valve::Valve;

use super::report::CallResponse;
use super::timer::Timer;
use super::{Action, ActionCall, Call, CallResult, Connector, EventSender, Solitaire};

/// Why an instance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCause {
    /// Expired, failed or shut down; the page should reload.
    Killed,
    /// The browser left the page.
    Suspend,
    /// The browser and the outbox disagree about what was delivered.
    SyncError,
}

impl EndCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndCause::Killed => "killed",
            EndCause::Suspend => "suspend",
            EndCause::SyncError => "sync_error",
        }
    }
}

enum Outbox {
    Stream(Solitaire),
    Events(Arc<Connector>),
}

type OnEnd = Box<dyn FnOnce() + Send>;

pub(crate) struct InstanceInner {
    id: Arc<str>,
    transport: Transport,
    ids: IdGen,
    spawner: Spawner,
    token: CancellationToken,
    bus: Bus,
    hooks: HookRegistry,
    outbox: Outbox,
    root: OnceLock<Tracker>,
    rendered: AtomicBool,
    ready: Valve,
    ended: AtomicBool,
    ttl: Timer,
    on_end: Mutex<Option<OnEnd>>,
}

impl InstanceInner {
    fn event(&self, kind: EventKind) -> Event {
        Event::new(kind).with_instance(self.id.clone())
    }

    fn sync_error(&self, e: DeckError) {
        self.bus
            .publish(self.event(EventKind::SyncError).with_reason(e.as_label()));
        self.end(EndCause::SyncError);
    }

    fn end(&self, cause: EndCause) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        self.bus
            .publish(self.event(EventKind::InstanceEnded).with_reason(cause.as_str()));
        self.ttl.stop();
        match &self.outbox {
            Outbox::Stream(s) => s.end(cause),
            Outbox::Events(c) => c.end(cause),
        }
        self.ready.break_valve();
        self.hooks.cancel_all();
        if let Some(root) = self.root.get() {
            root.suspend(false);
        }
        self.spawner.kill();
        self.token.cancel();
        let on_end = self.on_end.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(f) = on_end {
            f();
        }
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

impl Host for InstanceInner {
    fn spawner(&self) -> &Spawner {
        &self.spawner
    }

    fn new_id(&self) -> u64 {
        self.ids.next()
    }

    fn root_cinema(&self) -> Option<Cinema> {
        self.root.get().map(|r| r.cinema().clone())
    }

    fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    fn call(&self, call: Arc<dyn Call>) {
        if self.is_ended() {
            call.on_result(Err(CallError::InstanceEnded));
            return;
        }
        match &self.outbox {
            Outbox::Stream(s) => s.call(call),
            Outbox::Events(c) => c.call(call),
        }
    }

    fn bus(&self) -> &Bus {
        &self.bus
    }

    fn label(&self) -> &Arc<str> {
        &self.id
    }
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Handle to a live page. Cheap to clone.
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

impl Instance {
    /// Creates an instance with a random id; `on_end` runs once when it ends.
    ///
    /// Must be called inside a tokio runtime.
    pub(crate) fn new(config: &Config, bus: Bus, on_end: impl FnOnce() + Send + 'static) -> Self {
        let id: Arc<str> = ids::instance_id().into();
        let token = CancellationToken::new();
        let inner = Arc::new_cyclic(|me: &Weak<InstanceInner>| {
            let killer = |me: Weak<InstanceInner>| {
                move || {
                    if let Some(inst) = me.upgrade() {
                        inst.end(EndCause::Killed);
                    }
                }
            };
            let outbox = match config.transport {
                Transport::Stream => {
                    let me = me.clone();
                    Outbox::Stream(Solitaire::new(
                        config,
                        bus.clone(),
                        id.clone(),
                        token.clone(),
                        move |e: DeckError| {
                            if let Some(inst) = me.upgrade() {
                                inst.sync_error(e);
                            }
                        },
                    ))
                }
                Transport::Events => Outbox::Events(Connector::new(
                    config,
                    bus.clone(),
                    id.clone(),
                    killer(me.clone()),
                )),
            };
            InstanceInner {
                id: id.clone(),
                transport: config.transport,
                ids: IdGen::new(),
                spawner: Spawner::new(config.worker_limit(), bus.clone(), token.clone(), Some(id.clone())),
                token: token.clone(),
                bus: bus.clone(),
                hooks: HookRegistry::new(bus.clone(), id.clone()),
                outbox,
                root: OnceLock::new(),
                rendered: AtomicBool::new(false),
                ready: Valve::new(),
                ended: AtomicBool::new(false),
                ttl: Timer::new(config.ttl(), killer(me.clone())),
                on_end: Mutex::new(Some(Box::new(on_end))),
            }
        });

        let host: Arc<dyn Host> = inner.clone();
        let _ = inner.root.set(Tracker::root(&host, token.clone()));
        inner.ttl.reset();

        // A panicking task body cancels the spawner token.
        let me = Arc::downgrade(&inner);
        tokio::spawn(async move {
            token.cancelled().await;
            if let Some(inst) = me.upgrade() {
                inst.end(EndCause::Killed);
            }
        });

        bus.publish(inner.event(EventKind::InstanceCreated));
        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn transport(&self) -> Transport {
        self.inner.transport
    }

    /// Scope of the root door, for driving beams from outside the page.
    pub fn scope(&self) -> Option<Scope> {
        self.inner.root.get().map(|r| r.scope())
    }

    /// Renders the page. Hooks start serving once this succeeds.
    ///
    /// A failed render ends the instance. Rendering twice is an error.
    pub async fn render(&self, content: impl Content) -> Result<String, RenderError> {
        if self.inner.is_ended() {
            return Err(RenderError::Cancelled);
        }
        if self.inner.rendered.swap(true, Ordering::AcqRel) {
            return Err(RenderError::Content {
                error: "instance already rendered".to_string(),
            });
        }
        let Some(root) = self.inner.root.get() else {
            return Err(RenderError::Cancelled);
        };
        let res = render_root(root, Arc::new(content))
            .await
            .unwrap_or(Err(RenderError::Cancelled));
        match res {
            Ok(html) => {
                self.inner.ready.open();
                Ok(html)
            }
            Err(e) => {
                self.inner.end(EndCause::Killed);
                Err(e)
            }
        }
    }

    /// Sends `action` with `payload` to the browser.
    pub fn call(&self, action: Action, payload: Vec<u8>) -> oneshot::Receiver<CallResult> {
        let (call, rx) = ActionCall::reply(action, payload, None);
        Host::call(self.inner.as_ref(), Arc::new(call));
        rx
    }

    /// Delivers a browser request to hook `hook` of door `door`.
    ///
    /// Waits for the first render to finish. A non-zero `track` queues a
    /// `ReportHook` call once the hook has answered, so the browser learns
    /// which of its requests have been applied.
    pub async fn trigger_hook(
        &self,
        door: u64,
        hook: u64,
        req: Request,
        track: u64,
    ) -> Result<HookOutcome, HookError> {
        let (tx, rx) = oneshot::channel();
        self.inner.ready.put(move |ok| {
            let _ = tx.send(ok);
        });
        if !rx.await.unwrap_or(false) {
            return Err(HookError::Cancelled);
        }
        let outcome = self.inner.hooks.trigger(door, hook, req).await?;
        self.inner.ttl.reset();
        if track != 0 {
            Host::call(
                self.inner.as_ref(),
                Arc::new(ActionCall::fire(Action::ReportHook { hook_id: track })),
            );
        }
        Ok(outcome)
    }

    /// Serves one streaming connection; see [`Solitaire`].
    pub async fn connect_stream<W: io::Write + Send>(&self, report: &[u8], sink: W) -> Result<(), ConnectError> {
        let Outbox::Stream(solitaire) = &self.inner.outbox else {
            return Err(ConnectError::WrongTransport { expected: "stream" });
        };
        if self.inner.is_ended() || !self.inner.ttl.reset() {
            return Err(ConnectError::Gone);
        }
        solitaire.connect(report, sink).await
    }

    /// Attaches an event-sender connection; see [`Connector`].
    pub fn connect_events(&self, sender: Arc<dyn EventSender>) -> Result<(), ConnectError> {
        let connector = self.connector()?;
        if self.inner.is_ended() || !self.inner.ttl.reset() {
            return Err(ConnectError::Gone);
        }
        connector.connect(sender);
        Ok(())
    }

    /// Reports the outcome of an event-sender write.
    pub fn on_write(&self, seq: u64, ok: bool) -> Result<(), ConnectError> {
        self.connector()?.on_write(seq, ok);
        Ok(())
    }

    /// Applies an event-sender acknowledgement body.
    pub fn call_response(&self, body: &[u8]) -> Result<(), ConnectError> {
        let connector = self.connector()?;
        let resp = CallResponse::parse(body)?;
        if !connector.call_response(resp) {
            return Err(ConnectError::Gone);
        }
        Ok(())
    }

    fn connector(&self) -> Result<&Connector, ConnectError> {
        match &self.inner.outbox {
            Outbox::Events(c) => Ok(c.as_ref()),
            Outbox::Stream(_) => Err(ConnectError::WrongTransport { expected: "events" }),
        }
    }

    pub fn end(&self, cause: EndCause) {
        self.inner.end(cause);
    }

    pub fn is_ended(&self) -> bool {
        self.inner.is_ended()
    }

    /// Cancelled when the instance ends.
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.inner.id)
            .field("transport", &self.inner.transport.as_str())
            .field("ended", &self.is_ended())
            .finish()
    }
}
