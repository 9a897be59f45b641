//! # Beam: versioned values with render-consistent subscriptions.
//!
//! A [`SourceBeam`] holds a value and a sequence number. Every accepted change
//! bumps the sequence and starts a propagation pass over the screens of the
//! instance's cinemas. Derived beams ([`Beam::map`]) project a parent beam and
//! cache their projection per sequence.
//!
//! ```text
//! SourceBeam(seq 4) ──map──► Beam<U> ──map──► Beam<V>
//!        │
//!        └─ pass 4: root screen ─► door 7 screen ─► door 9 screen
//!                     watchers       watchers         watchers
//!                     sync(4)        sync(4)          sync(4)
//! ```
//!
//! ## Rules
//! - Within one pass every watcher of a beam, wherever it sits in the door tree,
//!   observes the value of the same sequence.
//! - A watcher starts at the sequence its screen has committed, not at the latest
//!   value, so late subscribers inside a door agree with the rest of that door.
//! - `sync(seq)` is idempotent: a derived beam answers the same value and flag for
//!   a sequence until the entry is pruned after a later pass.
//! - A derived beam reports a change only when its projection differs from the
//!   last value it emitted.
//! - Writes through a cancelled [`Scope`] are dropped silently.

mod derived;
mod source;
mod watcher;

use std::sync::Arc;

use crate::door::{Cinema, Host, Init, ScreenWatcher, Scope};
use crate::shredder::Collector;

pub use source::{Propagation, SourceBeam};
pub use watcher::{WatchHandle, Watcher};

use derived::Derived;
use watcher::{BeamWatcher, FnWatcher, OnCancel, OnValue};

/// Link in a beam chain: anything that can answer for a sequence.
pub(crate) trait Chain<T>: Send + Sync {
    /// Value at `seq` and whether it changed relative to `seq - 1`.
    ///
    /// `None` once `seq` is no longer retained.
    fn sync(&self, seq: u64, collector: Option<&Collector>) -> Option<(Arc<T>, bool)>;

    /// Registers `w` in `cinema` under the id of the chain's source, binding the
    /// source to `host` on first use.
    fn watch(&self, host: &Arc<dyn Host>, cinema: &Cinema, w: Arc<dyn ScreenWatcher>) -> Option<Init>;
}

/// Read side of a value stream.
///
/// Cheap to clone; clones observe the same stream.
pub struct Beam<T> {
    chain: Arc<dyn Chain<T>>,
}

impl<T> Clone for Beam<T> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Beam<T> {
    pub(crate) fn from_chain(chain: Arc<dyn Chain<T>>) -> Self {
        Self { chain }
    }

    /// Derived beam notifying only when the projection changes.
    pub fn map<U>(&self, cast: impl Fn(&T) -> U + Send + Sync + 'static) -> Beam<U>
    where
        U: PartialEq + Send + Sync + 'static,
    {
        self.map_with(cast, |new: &U, old: &U| new != old)
    }

    /// Derived beam with a custom change test: `distinct(new, old)` returns `true`
    /// when `new` should be emitted.
    pub fn map_with<U>(
        &self,
        cast: impl Fn(&T) -> U + Send + Sync + 'static,
        distinct: impl Fn(&U, &U) -> bool + Send + Sync + 'static,
    ) -> Beam<U>
    where
        U: Send + Sync + 'static,
    {
        Beam::from_chain(Arc::new(Derived::new(
            self.chain.clone(),
            Box::new(cast),
            Some(Box::new(distinct)),
        )))
    }

    /// Derived beam emitting every time the parent does.
    pub fn map_unfiltered<U>(&self, cast: impl Fn(&T) -> U + Send + Sync + 'static) -> Beam<U>
    where
        U: Send + Sync + 'static,
    {
        Beam::from_chain(Arc::new(Derived::new(self.chain.clone(), Box::new(cast), None)))
    }

    /// Attaches `w` inside the door of `scope`.
    ///
    /// `w.init` runs before this returns. Returns `None` if the scope is cancelled,
    /// not bound to a door, or the beam belongs to another instance.
    pub fn add_watcher(&self, scope: &Scope, w: impl Watcher<T>) -> Option<WatchHandle> {
        self.attach(scope, Box::new(w))
    }

    fn attach(&self, scope: &Scope, w: Box<dyn Watcher<T>>) -> Option<WatchHandle> {
        if scope.is_cancelled() {
            return None;
        }
        let tracker = scope.tracker()?;
        let host = tracker.host()?;
        let watcher = Arc::new(BeamWatcher::new(self.chain.clone(), w, scope.clone()));
        let handle = WatchHandle::new(&watcher);
        let init = self.chain.watch(&host, tracker.cinema(), watcher)?;
        init();
        Some(handle)
    }

    /// Calls `on_value` with the current value and on every change until it
    /// returns `true` or the scope ends.
    pub fn sub(&self, scope: &Scope, on_value: impl Fn(&Scope, &T) -> bool + Send + Sync + 'static) -> bool {
        self.attach(scope, Box::new(FnWatcher::sub(on_value, None)))
            .is_some()
    }

    /// Like [`sub`](Self::sub), with a cancel callback and a handle.
    pub fn x_sub(
        &self,
        scope: &Scope,
        on_value: impl Fn(&Scope, &T) -> bool + Send + Sync + 'static,
        on_cancel: impl Fn() + Send + Sync + 'static,
    ) -> Option<WatchHandle> {
        let on_cancel: OnCancel = Box::new(on_cancel);
        self.attach(scope, Box::new(FnWatcher::sub(on_value, Some(on_cancel))))
    }
}

impl<T: Clone + Send + Sync + 'static> Beam<T> {
    /// Value as seen by the door of `scope`.
    pub fn read(&self, scope: &Scope) -> Option<T> {
        let (w, slot) = FnWatcher::read(None, None);
        self.attach(scope, Box::new(w))?;
        slot.take()
    }

    /// Returns the current value and calls `on_value` on every later change.
    pub fn read_and_sub(
        &self,
        scope: &Scope,
        on_value: impl Fn(&Scope, &T) -> bool + Send + Sync + 'static,
    ) -> Option<T> {
        let on_value: OnValue<T> = Arc::new(on_value);
        let (w, slot) = FnWatcher::read(Some(on_value), None);
        self.attach(scope, Box::new(w))?;
        slot.take()
    }

    /// Like [`read_and_sub`](Self::read_and_sub), with a cancel callback and a handle.
    pub fn x_read_and_sub(
        &self,
        scope: &Scope,
        on_value: impl Fn(&Scope, &T) -> bool + Send + Sync + 'static,
        on_cancel: impl Fn() + Send + Sync + 'static,
    ) -> Option<(T, WatchHandle)> {
        let on_value: OnValue<T> = Arc::new(on_value);
        let on_cancel: OnCancel = Box::new(on_cancel);
        let (w, slot) = FnWatcher::read(Some(on_value), Some(on_cancel));
        let handle = self.attach(scope, Box::new(w))?;
        Some((slot.take()?, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    use crate::door::testing::TestHost;
    use crate::door::{Door, Tracker, content_fn};

    async fn wait<T>(rx: oneshot::Receiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("timed out")
            .expect("closed")
    }

    async fn collect<T>(rx: &mut UnboundedReceiver<T>, n: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let v = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out")
                .expect("closed");
            out.push(v);
        }
        out
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unattached_source() {
        let scope = Scope::detached(CancellationToken::new());
        let b = SourceBeam::new(1);
        assert!(b.update(&scope, 2));
        assert_eq!(*b.latest(), 2);
        assert_eq!(wait(b.x_update(&scope, 3)).await, Ok(()));
        assert_eq!(wait(b.x_update(&scope, 3)).await, Ok(()));
        assert!(b.mutate(&scope, |v| {
            *v += 1;
            true
        }));
        assert_eq!(*b.latest(), 4);
        assert!(b.mutate(&scope, |v| {
            *v += 100;
            false
        }));
        assert_eq!(*b.latest(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_scope_drops_writes() {
        let token = CancellationToken::new();
        let scope = Scope::detached(token.clone());
        token.cancel();
        let b = SourceBeam::new("a");
        assert!(!b.update(&scope, "b"));
        assert!(wait_closed(b.x_update(&scope, "c")).await);
        assert_eq!(*b.latest(), "a");
    }

    async fn wait_closed<T>(rx: oneshot::Receiver<T>) -> bool {
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("timed out")
            .is_err()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_detached_scope_cannot_watch() {
        let b = SourceBeam::new(0);
        let scope = Scope::detached(CancellationToken::new());
        assert!(!b.sub(&scope, |_, _| false));
        assert_eq!(b.read(&scope), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sub_sees_every_update() {
        let (host, _sent) = TestHost::new();
        let scope = host.scope();
        let b = SourceBeam::new(1);
        let (tx, mut rx) = unbounded_channel();
        assert!(b.sub(&scope, move |_, v| {
            let _ = tx.send(*v);
            false
        }));
        for v in 2..=4 {
            assert_eq!(wait(b.x_update(&scope, v)).await, Ok(()));
        }
        assert_eq!(wait(b.x_update(&scope, 4)).await, Ok(()));
        assert_eq!(collect(&mut rx, 4).await, vec![1, 2, 3, 4]);
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_derived_emits_on_projection_change() {
        let (host, _sent) = TestHost::new();
        let scope = host.scope();
        let b = SourceBeam::new(0);
        let tens = b.map(|v| v / 10);
        let (tx, mut rx) = unbounded_channel();
        assert!(tens.sub(&scope, move |_, v| {
            let _ = tx.send(*v);
            false
        }));
        for v in 1..=25 {
            assert_eq!(wait(b.x_update(&scope, v)).await, Ok(()));
        }
        assert_eq!(collect(&mut rx, 3).await, vec![0, 1, 2]);
        settle().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(tens.read(&scope), Some(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sub_done_stops_updates() {
        let (host, _sent) = TestHost::new();
        let scope = host.scope();
        let b = SourceBeam::new(0);
        let (tx, mut rx) = unbounded_channel();
        assert!(b.sub(&scope, move |_, v| {
            let _ = tx.send(*v);
            *v >= 1
        }));
        for v in 1..=3 {
            assert_eq!(wait(b.x_update(&scope, v)).await, Ok(()));
        }
        assert_eq!(collect(&mut rx, 2).await, vec![0, 1]);
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handle_cancel() {
        let (host, _sent) = TestHost::new();
        let scope = host.scope();
        let b = SourceBeam::new(0);
        let cancels = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (first, handle) = {
            let cancels = cancels.clone();
            let seen = seen.clone();
            b.x_read_and_sub(
                &scope,
                move |_, v| {
                    seen.lock().unwrap().push(*v);
                    false
                },
                move || {
                    cancels.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap()
        };
        assert_eq!(first, 0);
        assert_eq!(wait(b.x_update(&scope, 1)).await, Ok(()));
        handle.cancel();
        handle.cancel();
        assert_eq!(wait(b.x_update(&scope, 2)).await, Ok(()));
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_follows_door_reload() {
        let (host, _sent) = TestHost::new();
        let scope = host.scope();
        let b = SourceBeam::new(1);
        let door = Door::with_content(content_fn({
            let b = b.clone();
            move |r| {
                let v = b.read(r.scope()).unwrap_or_default();
                r.write_str(&v.to_string());
                Ok(())
            }
        }));
        let page: Arc<dyn crate::door::Content> = Arc::new(content_fn({
            let door = door.clone();
            move |r| r.render(&door)
        }));
        let html = wait(crate::door::render_root(host.root(), page)).await.unwrap();
        assert!(html.contains(">1<"));

        assert_eq!(wait(b.x_update(&scope, 7)).await, Ok(()));
        let (tx, mut rx) = unbounded_channel();
        let reader = Door::with_content(content_fn({
            let b = b.clone();
            move |r| {
                let _ = tx.send(b.read(r.scope()));
                Ok(())
            }
        }));
        let page: Arc<dyn crate::door::Content> = Arc::new(content_fn({
            let reader = reader.clone();
            move |r| r.render(&reader)
        }));
        wait(crate::door::render_root(host.root(), page)).await.unwrap();
        assert_eq!(collect(&mut rx, 1).await, vec![Some(7)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_door_update_cancels_watchers() {
        let (host, _sent) = TestHost::new();
        let b = SourceBeam::new(0);
        let cancels = Arc::new(AtomicUsize::new(0));
        let door = Door::with_content(content_fn({
            let b = b.clone();
            let cancels = cancels.clone();
            move |r| {
                let cancels = cancels.clone();
                b.x_sub(r.scope(), |_, _| false, move || {
                    cancels.fetch_add(1, Ordering::SeqCst);
                });
                Ok(())
            }
        }));
        let page: Arc<dyn crate::door::Content> = Arc::new(content_fn({
            let door = door.clone();
            move |r| r.render(&door)
        }));
        wait(crate::door::render_root(host.root(), page)).await.unwrap();
        assert_eq!(cancels.load(Ordering::SeqCst), 0);

        wait(door.update("static")).await.unwrap();
        for _ in 0..250 {
            if cancels.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_beam_bound_to_first_instance() {
        let (a, _sa) = TestHost::new();
        let (b, _sb) = TestHost::new();
        let beam = SourceBeam::new(5);
        assert_eq!(beam.read(&a.scope()), Some(5));
        assert_eq!(beam.read(&b.scope()), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nested_screens_share_sequence() {
        let (host, _sent) = TestHost::new();
        let scope = host.scope();
        let b = SourceBeam::new(0);
        let (tx, mut rx) = unbounded_channel();
        let inner = Door::with_content(content_fn({
            let b = b.clone();
            let tx = tx.clone();
            move |r| {
                let tx = tx.clone();
                b.sub(r.scope(), move |_, v| {
                    let _ = tx.send(("inner", *v));
                    false
                });
                Ok(())
            }
        }));
        let outer = Door::with_content(content_fn({
            let b = b.clone();
            let inner = inner.clone();
            move |r| {
                let tx = tx.clone();
                b.sub(r.scope(), move |_, v| {
                    let _ = tx.send(("outer", *v));
                    false
                });
                r.render(&inner)
            }
        }));
        let page: Arc<dyn crate::door::Content> = Arc::new(content_fn({
            let outer = outer.clone();
            move |r| r.render(&outer)
        }));
        wait(crate::door::render_root(host.root(), page)).await.unwrap();
        let mut first = collect(&mut rx, 2).await;
        first.sort();
        assert_eq!(first, vec![("inner", 0), ("outer", 0)]);

        assert_eq!(wait(b.x_update(&scope, 9)).await, Ok(()));
        assert_eq!(collect(&mut rx, 2).await, vec![("outer", 9), ("inner", 9)]);
        let root: &Tracker = host.root();
        assert_eq!(root.cinema().screen_count(), 1);
    }
}
