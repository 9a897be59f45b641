use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use tokio::sync::oneshot;

use crate::door::{Cinema, Host, Init, ScreenWatcher, Scope};
use crate::error::RuntimeError;
use crate::shredder::Collector;

use super::{Beam, Chain};

/// Resolves once a change has been observed by every watcher attached when it
/// was made.
///
/// Holds `Ok(())` at once when nothing changed or nothing watches the beam, and
/// `Err(InstanceEnded)` when the instance ended mid-pass. Closed without a value
/// when the write was dropped because its scope was cancelled.
pub type Propagation = oneshot::Receiver<Result<(), RuntimeError>>;

type Distinct<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

struct SourceState<T> {
    seq: u64,
    latest: Arc<T>,
    /// Values a pass may still ask for: the latest and those of unfinished passes.
    values: HashMap<u64, Arc<T>>,
}

/// Instance a source propagates through, fixed by its first watcher.
struct Bound {
    host: Weak<dyn Host>,
    id: u64,
}

pub(crate) struct SourceInner<T> {
    state: Mutex<SourceState<T>>,
    /// Orders changes against watcher registration.
    order: Mutex<()>,
    distinct: Option<Distinct<T>>,
    bound: OnceLock<Bound>,
}

/// Writable root of a beam chain.
///
/// Dereferences to [`Beam`] for reading and subscribing.
///
/// # Example
/// ```no_run
/// use doorframe::{Scope, SourceBeam};
/// use tokio_util::sync::CancellationToken;
///
/// let count = SourceBeam::new(0u32);
/// let label = count.map(|n| format!("{n} clicks"));
/// let scope = Scope::detached(CancellationToken::new());
/// count.mutate(&scope, |n| {
///     *n += 1;
///     true
/// });
/// # let _ = label;
/// ```
pub struct SourceBeam<T> {
    inner: Arc<SourceInner<T>>,
    beam: Beam<T>,
}

impl<T> Clone for SourceBeam<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            beam: self.beam.clone(),
        }
    }
}

impl<T> Deref for SourceBeam<T> {
    type Target = Beam<T>;

    fn deref(&self) -> &Beam<T> {
        &self.beam
    }
}

impl<T: PartialEq + Send + Sync + 'static> SourceBeam<T> {
    /// A source that ignores writes equal to the current value.
    pub fn new(init: T) -> Self {
        Self::build(init, Some(Box::new(|new: &T, old: &T| new != old)))
    }
}

impl<T: Send + Sync + 'static> SourceBeam<T> {
    /// A source with a custom change test: `distinct(new, old)` returns `true`
    /// when `new` should be propagated.
    pub fn with_distinct(init: T, distinct: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        Self::build(init, Some(Box::new(distinct)))
    }

    /// A source propagating every write.
    pub fn unfiltered(init: T) -> Self {
        Self::build(init, None)
    }

    fn build(init: T, distinct: Option<Distinct<T>>) -> Self {
        let latest = Arc::new(init);
        let inner = Arc::new(SourceInner {
            state: Mutex::new(SourceState {
                seq: 1,
                latest: latest.clone(),
                values: HashMap::from([(1, latest)]),
            }),
            order: Mutex::new(()),
            distinct,
            bound: OnceLock::new(),
        });
        let beam = Beam::from_chain(inner.clone());
        Self { inner, beam }
    }

    /// Last written value, outside any render pass.
    ///
    /// Unlike [`Beam::read`] this does not agree with what a door currently shows.
    pub fn latest(&self) -> Arc<T> {
        self.inner.lock().latest.clone()
    }

    /// Replaces the value. Returns `false` only when `scope` is cancelled.
    pub fn update(&self, scope: &Scope, value: T) -> bool {
        self.inner.apply(scope, |_| Some(value)).is_some()
    }

    /// Like [`update`](Self::update), resolving once the change has propagated.
    pub fn x_update(&self, scope: &Scope, value: T) -> Propagation {
        self.inner.apply(scope, |_| Some(value)).unwrap_or_else(closed)
    }
}

impl<T: Clone + Send + Sync + 'static> SourceBeam<T> {
    /// Edits a copy of the value; the copy is written only if `f` returns `true`.
    ///
    /// Returns `false` only when `scope` is cancelled. `f` must not touch this beam.
    pub fn mutate(&self, scope: &Scope, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.inner.apply(scope, edit(f)).is_some()
    }

    /// Like [`mutate`](Self::mutate), resolving once the change has propagated.
    pub fn x_mutate(&self, scope: &Scope, f: impl FnOnce(&mut T) -> bool) -> Propagation {
        self.inner.apply(scope, edit(f)).unwrap_or_else(closed)
    }
}

fn edit<T: Clone>(f: impl FnOnce(&mut T) -> bool) -> impl FnOnce(&T) -> Option<T> {
    move |current| {
        let mut copy = current.clone();
        f(&mut copy).then_some(copy)
    }
}

fn closed() -> Propagation {
    oneshot::channel().1
}

impl<T: Send + Sync + 'static> SourceInner<T> {
    fn lock(&self) -> MutexGuard<'_, SourceState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bound(&self) -> Option<(Arc<dyn Host>, u64)> {
        let bound = self.bound.get()?;
        Some((bound.host.upgrade()?, bound.id))
    }

    /// Applies `change` to the current value and starts a pass if it produced a
    /// distinct value. `None` when `scope` is cancelled.
    fn apply(self: &Arc<Self>, scope: &Scope, change: impl FnOnce(&T) -> Option<T>) -> Option<Propagation> {
        if scope.is_cancelled() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        let _order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        let (seq, host, id) = {
            let mut st = self.lock();
            let next = change(st.latest.as_ref()).filter(|next| {
                self.distinct
                    .as_ref()
                    .is_none_or(|distinct| distinct(next, st.latest.as_ref()))
            });
            let Some(next) = next else {
                let _ = tx.send(Ok(()));
                return Some(rx);
            };
            st.seq += 1;
            let seq = st.seq;
            let next = Arc::new(next);
            st.values.insert(seq, next.clone());
            st.latest = next;
            match self.bound() {
                Some((host, id)) => (seq, host, id),
                None => {
                    st.values.remove(&(seq - 1));
                    let _ = tx.send(Ok(()));
                    return Some(rx);
                }
            }
        };
        let sync_thread = host.spawner().new_thread();
        let collector = Collector::new();
        if let Some(cinema) = host.root_cinema() {
            cinema.init_sync(&sync_thread, id, seq, &collector);
        }
        let me = self.clone();
        sync_thread.write_starving(move |t| {
            if t.is_none() {
                let _ = tx.send(Err(RuntimeError::InstanceEnded));
                return;
            }
            collector.apply();
            me.lock().values.remove(&(seq - 1));
            let _ = tx.send(Ok(()));
        });
        Some(rx)
    }
}

impl<T: Send + Sync + 'static> Chain<T> for SourceInner<T> {
    fn sync(&self, seq: u64, _collector: Option<&Collector>) -> Option<(Arc<T>, bool)> {
        self.lock().values.get(&seq).map(|v| (v.clone(), true))
    }

    fn watch(&self, host: &Arc<dyn Host>, cinema: &Cinema, w: Arc<dyn ScreenWatcher>) -> Option<Init> {
        let _order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        let bound = self.bound.get_or_init(|| Bound {
            host: Arc::downgrade(host),
            id: host.new_id(),
        });
        if !std::ptr::addr_eq(bound.host.as_ptr(), Arc::as_ptr(host)) {
            return None;
        }
        let seq = self.lock().seq;
        cinema.add_watcher(bound.id, w, seq)
    }
}
