use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::sync::oneshot;

use crate::door::{Init, ScreenWatcher, Scope, WatchSlot};
use crate::shredder::Collector;
use crate::valve::Valve;

use super::Chain;

/// Observer of a beam inside one door.
pub trait Watcher<T>: Send + Sync + 'static {
    /// Called once with the value the door currently sees. Return `true` to stop.
    fn init(&self, scope: &Scope, value: &T, seq: u64) -> bool;

    /// Called for every later change. Return `true` to stop.
    fn update(&self, scope: &Scope, value: &T, seq: u64) -> bool;

    /// Called when the watcher is cancelled by its handle or by the end of its door.
    fn cancel(&self) {}
}

/// Cancels a watcher early.
pub struct WatchHandle {
    watcher: Weak<dyn ScreenWatcher>,
}

impl WatchHandle {
    pub(crate) fn new<W: ScreenWatcher + 'static>(watcher: &Arc<W>) -> Self {
        let watcher: Arc<dyn ScreenWatcher> = watcher.clone();
        Self {
            watcher: Arc::downgrade(&watcher),
        }
    }

    /// Cancels the watcher; its `cancel` callback runs at most once.
    pub fn cancel(&self) {
        if let Some(w) = self.watcher.upgrade() {
            w.cancel();
        }
    }
}

/// Adapts a [`Watcher`] to its screen.
pub(crate) struct BeamWatcher<T> {
    chain: Arc<dyn Chain<T>>,
    w: Box<dyn Watcher<T>>,
    scope: Scope,
    slot: OnceLock<WatchSlot>,
    /// Opens once `init` has run; syncs wait on it.
    ready: Valve,
    done: AtomicBool,
}

/// Opens the ready valve when dropped, including on unwind.
struct Opener<T: Send + Sync + 'static>(Arc<BeamWatcher<T>>);

impl<T: Send + Sync + 'static> Drop for Opener<T> {
    fn drop(&mut self) {
        self.0.ready.open();
    }
}

impl<T: Send + Sync + 'static> BeamWatcher<T> {
    pub(crate) fn new(chain: Arc<dyn Chain<T>>, w: Box<dyn Watcher<T>>, scope: Scope) -> Self {
        Self {
            chain,
            w,
            scope,
            slot: OnceLock::new(),
            ready: Valve::new(),
            done: AtomicBool::new(false),
        }
    }

    fn finish(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(slot) = self.slot.get() {
            slot.release();
        }
    }

    /// Blocks until `init` has run. Only called from scheduler bodies.
    fn wait_ready(&self) {
        if self.ready.is_open() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        self.ready.put(move |_| {
            let _ = tx.send(());
        });
        let _ = rx.blocking_recv();
    }
}

impl<T: Send + Sync + 'static> ScreenWatcher for BeamWatcher<T> {
    fn init(self: Arc<Self>, slot: WatchSlot, seq: u64) -> Init {
        let _ = self.slot.set(slot);
        let value = self.chain.sync(seq, None);
        let opener = Opener(self);
        Box::new(move || {
            let me = &opener.0;
            let Some((value, _)) = value else {
                me.finish();
                return;
            };
            if me.done.load(Ordering::SeqCst) {
                return;
            }
            if me.w.init(&me.scope, &value, seq) {
                me.finish();
            }
        })
    }

    fn sync(&self, seq: u64, collector: &Collector) {
        self.wait_ready();
        if self.done.load(Ordering::SeqCst) {
            return;
        }
        let Some((value, updated)) = self.chain.sync(seq, Some(collector)) else {
            return;
        };
        if updated && self.w.update(&self.scope, &value, seq) {
            self.finish();
        }
    }

    fn cancel(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ready.break_valve();
        self.w.cancel();
        if let Some(slot) = self.slot.get() {
            slot.release();
        }
    }
}

pub(crate) type OnValue<T> = Arc<dyn Fn(&Scope, &T) -> bool + Send + Sync>;
pub(crate) type OnCancel = Box<dyn Fn() + Send + Sync>;

/// Value captured by a reading watcher's `init`.
pub(crate) struct Captured<T>(Mutex<Option<T>>);

impl<T> Captured<T> {
    pub(crate) fn take(&self) -> Option<T> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

enum First<T> {
    Deliver,
    Capture(Box<dyn Fn(&T) + Send + Sync>),
}

/// Closure-backed watcher behind `sub`, `read` and `read_and_sub`.
pub(crate) struct FnWatcher<T> {
    first: First<T>,
    on_value: Option<OnValue<T>>,
    on_cancel: Option<OnCancel>,
}

impl<T> FnWatcher<T> {
    pub(crate) fn sub(
        on_value: impl Fn(&Scope, &T) -> bool + Send + Sync + 'static,
        on_cancel: Option<OnCancel>,
    ) -> Self {
        Self {
            first: First::Deliver,
            on_value: Some(Arc::new(on_value)),
            on_cancel,
        }
    }
}

impl<T: Clone + Send + 'static> FnWatcher<T> {
    /// Captures the first value; keeps watching only when `on_value` is given.
    pub(crate) fn read(on_value: Option<OnValue<T>>, on_cancel: Option<OnCancel>) -> (Self, Arc<Captured<T>>) {
        let slot = Arc::new(Captured(Mutex::new(None)));
        let capture = {
            let slot = slot.clone();
            move |v: &T| *slot.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(v.clone())
        };
        let w = Self {
            first: First::Capture(Box::new(capture)),
            on_value,
            on_cancel,
        };
        (w, slot)
    }
}

impl<T: Send + Sync + 'static> Watcher<T> for FnWatcher<T> {
    fn init(&self, scope: &Scope, value: &T, _seq: u64) -> bool {
        match &self.first {
            First::Capture(capture) => {
                capture(value);
                self.on_value.is_none()
            }
            First::Deliver => self.on_value.as_ref().is_none_or(|f| f(scope, value)),
        }
    }

    fn update(&self, scope: &Scope, value: &T, _seq: u64) -> bool {
        self.on_value.as_ref().is_none_or(|f| f(scope, value))
    }

    fn cancel(&self) {
        if let Some(f) = &self.on_cancel {
            f();
        }
    }
}
