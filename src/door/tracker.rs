use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventKind};
use crate::shredder::Thread;

use super::door::DoorInner;
use super::hook::{DoorHook, Hook, HookHandle};
use super::{Cinema, Door, Host, Scope};

pub(crate) struct TrackerInner {
    id: u64,
    host: Weak<dyn Host>,
    thread: Thread,
    cinema: Cinema,
    token: CancellationToken,
    /// Owning door; `None` for the root tracker.
    door: Option<Weak<DoorInner>>,
    children: Mutex<Vec<Door>>,
}

/// Lifetime owner of one mounted door (or of the root).
#[derive(Clone)]
pub(crate) struct Tracker {
    inner: Arc<TrackerInner>,
}

impl Tracker {
    pub(crate) fn from_inner(inner: Arc<TrackerInner>) -> Self {
        Self { inner }
    }

    /// Creates the root tracker of `host`.
    pub(crate) fn root(host: &Arc<dyn Host>, token: CancellationToken) -> Self {
        let id = host.new_id();
        let thread = host.spawner().new_thread();
        let cinema = Cinema::new(None, thread.clone(), host.spawner().clone(), id);
        Self::build(id, Arc::downgrade(host), thread, cinema, token, None)
    }

    /// Creates the tracker of door `id` mounted under `parent`.
    pub(crate) fn child(
        id: u64,
        host: &Arc<dyn Host>,
        parent: &Scope,
        parent_cinema: &Cinema,
        door: Weak<DoorInner>,
    ) -> Self {
        let thread = host.spawner().new_thread();
        let cinema = Cinema::new(
            Some(parent_cinema.clone()),
            thread.clone(),
            host.spawner().clone(),
            id,
        );
        let token = parent.token().child_token();
        Self::build(id, Arc::downgrade(host), thread, cinema, token, Some(door))
    }

    fn build(
        id: u64,
        host: Weak<dyn Host>,
        thread: Thread,
        cinema: Cinema,
        token: CancellationToken,
        door: Option<Weak<DoorInner>>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                id,
                host,
                thread,
                cinema,
                token,
                door,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    fn children(&self) -> MutexGuard<'_, Vec<Door>> {
        self.inner.children.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn thread(&self) -> &Thread {
        &self.inner.thread
    }

    pub(crate) fn cinema(&self) -> &Cinema {
        &self.inner.cinema
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub(crate) fn host(&self) -> Option<Arc<dyn Host>> {
        self.inner.host.upgrade()
    }

    pub(crate) fn scope(&self) -> Scope {
        Scope::new(self.inner.token.clone(), Arc::downgrade(&self.inner))
    }

    pub(crate) fn downgrade(&self) -> Weak<TrackerInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn is(&self, other: &Weak<TrackerInner>) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.inner), other.as_ptr())
    }

    pub(crate) fn register_hook(&self, hook: Arc<dyn Hook>) -> Option<HookHandle> {
        match &self.inner.door {
            Some(door) => {
                let door = door.upgrade()?;
                Door::from_inner(door).register_hook(self, hook)
            }
            None => self.register_hook_unchecked(hook),
        }
    }

    /// Registers `hook` under this tracker's door id, if the tracker is live.
    pub(crate) fn register_hook_unchecked(&self, hook: Arc<dyn Hook>) -> Option<HookHandle> {
        if self.inner.token.is_cancelled() {
            return None;
        }
        let host = self.host()?;
        let hook_id = host.new_id();
        let gate = Arc::new(DoorHook::new(hook, self.scope()));
        host.hooks().register(self.inner.id, hook_id, gate);
        Some(HookHandle::new(self.inner.id, hook_id, self.inner.host.clone()))
    }

    /// Adopts `door`; a killed tracker suspends it instead.
    pub(crate) fn add_child(&self, door: Door) {
        let me = self.clone();
        self.inner.thread.write(move |t| {
            if t.is_none() {
                door.suspend(&me);
                return;
            }
            me.children().push(door);
        });
    }

    pub(crate) fn remove_child(&self, door: &Door) {
        let me = self.clone();
        let door = door.clone();
        self.inner.thread.write(move |t| {
            if t.is_none() {
                return;
            }
            me.children().retain(|d| !d.is(&door));
        });
    }

    /// Cancels the tracker and, once its lane drains, kills its cinema and
    /// suspends every child door.
    ///
    /// `init` detaches the cinema's screens from the parent door's screens.
    pub(crate) fn suspend(&self, init: bool) {
        self.inner.token.cancel();
        let me = self.clone();
        let killed = self.inner.thread.kill_then(move || {
            me.inner.cinema.kill(init);
            let children = mem::take(&mut *me.children());
            for child in children {
                child.suspend(&me);
            }
        });
        if killed && self.inner.door.is_some() {
            if let Some(host) = self.host() {
                host.bus().publish(
                    Event::new(EventKind::DoorSuspended)
                        .with_instance(host.label().clone())
                        .with_door(self.inner.id),
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn child_count(&self) -> usize {
        self.children().len()
    }
}
