//! # Cinema: per-door registry of screens.
//!
//! Every tracker owns one [`Cinema`]. A cinema holds one [`Screen`] per beam that
//! has watchers inside the door; a screen of a nested door is registered as a
//! child of the same beam's screen in the parent door's cinema.
//!
//! ```text
//! root cinema          door 7 cinema          door 9 cinema
//!   screen(beam 3) ───►  screen(beam 3) ───►   screen(beam 3)
//!     watchers             watchers              watchers
//! ```
//!
//! A propagation pass for `seq` starts at the root screen and walks down:
//!
//! ```text
//! sync(seq):  W(screen.thread) + Ri(sync thread)
//!               └─ W(task) + R(door core): commit seq, then every watcher syncs (reads)
//!               └─ W(task): children sync
//! ```
//!
//! ## Rules
//! - Parents own their children; children point back with `Weak` and only use it
//!   to detach themselves.
//! - A screen without watchers and children kills itself and detaches from its parent.
//! - Killing a cinema kills every screen and cancels every watcher exactly once.

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::shredder::{self, Collector, Spawner, Thread};

/// Deferred initialization returned by [`ScreenWatcher::init`]; runs outside the cinema lock.
pub(crate) type Init = Box<dyn FnOnce() + Send>;

/// A watcher as seen by its screen.
pub(crate) trait ScreenWatcher: Send + Sync {
    /// Binds the watcher to its screen slot at the screen's committed `seq`.
    ///
    /// Called under the screen lock.
    fn init(self: Arc<Self>, slot: WatchSlot, seq: u64) -> Init;

    /// Observes pass `seq`.
    fn sync(&self, seq: u64, collector: &Collector);

    fn cancel(&self);
}

/// Position of a watcher inside a screen; used to unregister it.
#[derive(Clone)]
pub(crate) struct WatchSlot {
    screen: Weak<ScreenInner>,
    id: u64,
}

impl WatchSlot {
    /// Removes the watcher from its screen.
    pub(crate) fn release(&self) {
        if let Some(inner) = self.screen.upgrade() {
            Screen { inner }.unreg_watcher(self.id);
        }
    }
}

struct ScreenState {
    counter: u64,
    watchers: BTreeMap<u64, Arc<dyn ScreenWatcher>>,
    parent: Option<Weak<ScreenInner>>,
    children: Vec<Screen>,
    seq: u64,
}

pub(crate) struct ScreenInner {
    beam: u64,
    root: bool,
    thread: Thread,
    core: Thread,
    cinema: Weak<CinemaInner>,
    state: Mutex<ScreenState>,
}

/// One beam's subscription scope inside a cinema.
#[derive(Clone)]
pub(crate) struct Screen {
    inner: Arc<ScreenInner>,
}

impl Screen {
    fn lock(&self) -> MutexGuard<'_, ScreenState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init(&self, parent: Option<&Screen>, seq: u64) {
        let mut st = self.lock();
        st.parent = parent.map(|p| Arc::downgrade(&p.inner));
        st.seq = seq;
    }

    fn is(&self, other: &Screen) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn seq(&self) -> u64 {
        self.lock().seq
    }

    fn cinema(&self) -> Option<Cinema> {
        self.inner.cinema.upgrade().map(|inner| Cinema { inner })
    }

    fn kill(&self, init: bool) {
        let me = self.clone();
        self.inner.thread.kill_then(move || {
            let (parent, watchers) = {
                let mut st = me.lock();
                (st.parent.take(), mem::take(&mut st.watchers))
            };
            if init && !me.inner.root {
                if let Some(parent) = parent.and_then(|p| p.upgrade()) {
                    Screen { inner: parent }.remove_child(&me);
                }
            }
            for w in watchers.into_values() {
                w.cancel();
            }
        });
    }

    /// Kills the screen if it has nothing left to serve.
    fn try_kill(&self) -> bool {
        let st = self.lock();
        if !st.watchers.is_empty() || !st.children.is_empty() {
            return false;
        }
        let parent = st.parent.clone();
        drop(st);
        self.inner.thread.kill_then({
            let me = self.clone();
            move || {
                if let Some(parent) = parent.and_then(|p| p.upgrade()) {
                    Screen { inner: parent }.remove_child(&me);
                }
            }
        });
        true
    }

    fn add_watcher(&self, w: Arc<dyn ScreenWatcher>) -> Init {
        let mut st = self.lock();
        st.counter += 1;
        let id = st.counter;
        st.watchers.insert(id, w.clone());
        let slot = WatchSlot {
            screen: Arc::downgrade(&self.inner),
            id,
        };
        w.init(slot, st.seq)
    }

    fn add_child(&self, child: &Screen) {
        let mut st = self.lock();
        st.children.push(child.clone());
        child.init(Some(self), st.seq);
    }

    fn unreg_watcher(&self, id: u64) {
        if self.inner.thread.is_killed() {
            return;
        }
        let empty = {
            let mut st = self.lock();
            st.watchers.remove(&id);
            st.watchers.is_empty() && st.children.is_empty()
        };
        if empty {
            self.release();
        }
    }

    fn remove_child(&self, child: &Screen) {
        if self.inner.thread.is_killed() {
            return;
        }
        let empty = {
            let mut st = self.lock();
            st.children.retain(|c| !c.is(child));
            st.watchers.is_empty() && st.children.is_empty()
        };
        if empty {
            self.release();
        }
    }

    fn release(&self) {
        if let Some(cinema) = self.cinema() {
            cinema.try_kill(self.inner.beam);
        }
    }

    fn commit(&self, seq: u64) -> (Vec<Arc<dyn ScreenWatcher>>, Vec<Screen>) {
        let mut st = self.lock();
        st.seq = seq;
        (st.watchers.values().cloned().collect(), st.children.clone())
    }

    /// Applies pass `seq` to this screen and, after it, to its children.
    fn sync(&self, sync_thread: &Thread, seq: u64, collector: &Collector) {
        let screen = self.clone();
        let st = sync_thread.clone();
        let collector = collector.clone();
        shredder::run(
            move |t| {
                let Some(t) = t else {
                    return;
                };
                let children = Arc::new(Mutex::new(Vec::new()));
                {
                    let core = screen.inner.core.r();
                    let screen = screen.clone();
                    let children = children.clone();
                    let collector = collector.clone();
                    shredder::run(
                        move |t| {
                            let Some(t) = t else {
                                return;
                            };
                            let (watchers, kids) = screen.commit(seq);
                            *children.lock().unwrap_or_else(|e| e.into_inner()) = kids;
                            for w in watchers {
                                let collector = collector.clone();
                                t.read(move |t| {
                                    if t.is_some() {
                                        w.sync(seq, &collector);
                                    }
                                });
                            }
                        },
                        [t.w(), core],
                    );
                }
                t.write(move |t| {
                    if t.is_none() {
                        return;
                    }
                    let kids = mem::take(&mut *children.lock().unwrap_or_else(|e| e.into_inner()));
                    for child in kids {
                        child.sync(&st, seq, &collector);
                    }
                });
            },
            [self.inner.thread.w(), sync_thread.r().instant()],
        );
    }
}

struct CinemaState {
    killed: bool,
    screens: HashMap<u64, Screen>,
}

pub(crate) struct CinemaInner {
    door: u64,
    core: Thread,
    spawner: Spawner,
    parent: Option<Cinema>,
    state: Mutex<CinemaState>,
}

/// Registry of screens for one door.
///
/// Cheap to clone; clones refer to the same cinema.
#[derive(Clone)]
pub(crate) struct Cinema {
    inner: Arc<CinemaInner>,
}

impl Cinema {
    /// Creates a cinema for door `door`, whose tracker runs on `core`.
    ///
    /// `parent` is `None` for the root door.
    pub(crate) fn new(parent: Option<Cinema>, core: Thread, spawner: Spawner, door: u64) -> Self {
        Self {
            inner: Arc::new(CinemaInner {
                door,
                core,
                spawner,
                parent,
                state: Mutex::new(CinemaState {
                    killed: false,
                    screens: HashMap::new(),
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CinemaState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn door(&self) -> u64 {
        self.inner.door
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.lock().killed
    }

    /// Registers `w` on the screen of `beam`, creating the screen at `last_seq` if needed.
    ///
    /// The returned [`Init`] must be run by the caller once its own locks are
    /// released. Returns `None` if the cinema has been killed.
    pub(crate) fn add_watcher(&self, beam: u64, w: Arc<dyn ScreenWatcher>, last_seq: u64) -> Option<Init> {
        let mut st = self.lock();
        let screen = self.ensure(&mut st, beam, last_seq)?;
        Some(screen.add_watcher(w))
    }

    fn ensure(&self, st: &mut CinemaState, beam: u64, last_seq: u64) -> Option<Screen> {
        if st.killed {
            return None;
        }
        if let Some(screen) = st.screens.get(&beam) {
            return Some(screen.clone());
        }
        let screen = Screen {
            inner: Arc::new(ScreenInner {
                beam,
                root: self.inner.parent.is_none(),
                thread: self.inner.spawner.new_thread(),
                core: self.inner.core.clone(),
                cinema: Arc::downgrade(&self.inner),
                state: Mutex::new(ScreenState {
                    counter: 0,
                    watchers: BTreeMap::new(),
                    parent: None,
                    children: Vec::new(),
                    seq: last_seq,
                }),
            }),
        };
        st.screens.insert(beam, screen.clone());
        match &self.inner.parent {
            Some(parent) => parent.add_child(beam, &screen, last_seq),
            None => screen.init(None, last_seq),
        }
        Some(screen)
    }

    fn add_child(&self, beam: u64, child: &Screen, last_seq: u64) {
        let screen = {
            let mut st = self.lock();
            self.ensure(&mut st, beam, last_seq)
        };
        match screen {
            Some(screen) => screen.add_child(child),
            None => child.init(None, last_seq),
        }
    }

    fn try_kill(&self, beam: u64) {
        let me = self.clone();
        self.inner.core.read(move |_| {
            let mut st = me.lock();
            let dead = st.screens.get(&beam).is_some_and(|s| s.try_kill());
            if dead {
                st.screens.remove(&beam);
            }
        });
    }

    /// Starts pass `seq` of `beam` from this (root) cinema.
    pub(crate) fn init_sync(&self, sync_thread: &Thread, beam: u64, seq: u64, collector: &Collector) {
        if self.inner.parent.is_some() {
            return;
        }
        let screen = self.lock().screens.get(&beam).cloned();
        if let Some(screen) = screen {
            screen.sync(sync_thread, seq, collector);
        }
    }

    /// Kills every screen; `init` detaches them from the parent door's screens.
    pub(crate) fn kill(&self, init: bool) {
        let screens = {
            let mut st = self.lock();
            if st.killed {
                return;
            }
            st.killed = true;
            mem::take(&mut st.screens)
        };
        for screen in screens.into_values() {
            screen.kill(init);
        }
    }

    #[cfg(test)]
    pub(crate) fn screen_count(&self) -> usize {
        self.lock().screens.len()
    }
}
