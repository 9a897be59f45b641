//! # Door state machine.
//!
//! ```text
//!            render                    replace
//!  Dynamic ──────────► Dynamic+mounted ─────────► Static ──render──► inline content
//!     ▲                   │   │  update/clear/reload: same id, fresh tracker
//!     └── suspend ────────┘   │
//!                             └── remove ────────► Removed ──render──► nothing
//! ```
//!
//! ## Rules
//! - Content set while a door is not mounted is kept and rendered on the next mount.
//! - Every transition of a mounted door cancels the hooks of its id before the
//!   tracker is swapped out.
//! - Operations on a door that is not mounted complete at once with a closed
//!   [`Completion`].

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{CallError, DoorError, RenderError};
use crate::instance::{Action, ActionCall};
use crate::shredder::{self, Thread};

use super::hook::{Hook, HookHandle};
use super::render::{Content, Hole, Output, Renderer};
use super::tracker::{Tracker, TrackerInner};
use super::{Cinema, Host, Scope};

/// Resolves once a door operation has been applied by the browser.
///
/// Closed without a value when the door was not mounted.
pub type Completion = oneshot::Receiver<Result<(), DoorError>>;

type Reply = oneshot::Sender<Result<(), DoorError>>;

type Rendered = Arc<Mutex<Option<Result<Output, RenderError>>>>;

const TAG: &str = "d0-0r";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Dynamic,
    Static,
    Removed,
}

/// A mounted door: its id, where it hangs and the tracker currently serving it.
struct Container {
    id: u64,
    host: Weak<dyn Host>,
    parent: Scope,
    parent_cinema: Cinema,
    tracker: Tracker,
}

struct DoorState {
    mode: Mode,
    content: Option<Arc<dyn Content>>,
    parent: Weak<TrackerInner>,
    container: Option<Container>,
}

pub(crate) struct DoorInner {
    state: Mutex<DoorState>,
}

/// Dynamic placeholder whose subtree can be updated, replaced or removed.
///
/// Cheap to clone; clones refer to the same door.
#[derive(Clone)]
pub struct Door {
    inner: Arc<DoorInner>,
}

impl Default for Door {
    fn default() -> Self {
        Self::new()
    }
}

impl Door {
    /// An empty door.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DoorInner {
                state: Mutex::new(DoorState {
                    mode: Mode::Dynamic,
                    content: None,
                    parent: Weak::new(),
                    container: None,
                }),
            }),
        }
    }

    /// A door showing `content`.
    pub fn with_content(content: impl Content) -> Self {
        let door = Self::new();
        door.lock().content = Some(Arc::new(content));
        door
    }

    pub(crate) fn from_inner(inner: Arc<DoorInner>) -> Self {
        Self { inner }
    }

    fn lock(&self) -> MutexGuard<'_, DoorState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is(&self, other: &Door) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Id of the mounted door.
    pub fn id(&self) -> Option<u64> {
        self.lock().container.as_ref().map(|c| c.id)
    }

    pub fn is_mounted(&self) -> bool {
        self.lock().container.is_some()
    }

    /// Renders `content` into the door, keeping its id.
    pub fn update(&self, content: impl Content) -> Completion {
        self.set(Some(Arc::new(content)))
    }

    /// Empties the door, keeping its id.
    pub fn clear(&self) -> Completion {
        self.set(None)
    }

    /// Renders the current content again.
    pub fn reload(&self) -> Completion {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.lock();
        let st = &mut *guard;
        if let Some(c) = st.container.as_mut() {
            c.cancel_hooks();
            c.update(self, st.content.clone(), tx);
        }
        rx
    }

    /// Replaces the door with static `content`; the door is no longer tracked.
    pub fn replace(&self, content: impl Content) -> Completion {
        let (tx, rx) = oneshot::channel();
        let content: Arc<dyn Content> = Arc::new(content);
        let mut guard = self.lock();
        let st = &mut *guard;
        st.mode = Mode::Static;
        st.content = Some(content.clone());
        if let Some(c) = st.container.take() {
            c.cancel_hooks();
            detach(&st.parent, self);
            c.replace(Some(content), tx);
        }
        rx
    }

    /// Removes the door and its content.
    pub fn remove(&self) -> Completion {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.lock();
        let st = &mut *guard;
        st.mode = Mode::Removed;
        if let Some(c) = st.container.take() {
            c.cancel_hooks();
            detach(&st.parent, self);
            c.replace(None, tx);
        }
        rx
    }

    fn set(&self, content: Option<Arc<dyn Content>>) -> Completion {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.lock();
        let st = &mut *guard;
        st.content = content.clone();
        match st.container.as_mut() {
            Some(c) => {
                c.cancel_hooks();
                c.update(self, content, tx);
            }
            None => st.mode = Mode::Dynamic,
        }
        rx
    }

    fn mount(&self, r: &mut Renderer) -> Result<(), RenderError> {
        let mut guard = self.lock();
        let st = &mut *guard;
        if let Some(c) = st.container.take() {
            c.cancel_hooks();
            detach(&st.parent, self);
            let (tx, _) = oneshot::channel();
            c.replace(None, tx);
        }
        match st.mode {
            Mode::Removed => Ok(()),
            Mode::Static => {
                let content = st.content.clone();
                drop(guard);
                match content {
                    Some(content) => r.render(content.as_ref()),
                    None => Ok(()),
                }
            }
            Mode::Dynamic => {
                let parent_scope = r.scope().clone();
                let parent = parent_scope.tracker().ok_or(RenderError::Cancelled)?;
                let host = parent.host().ok_or(RenderError::Cancelled)?;
                st.parent = parent.downgrade();
                let hole = r.hole();
                st.container = Some(Container::mount(
                    self,
                    &host,
                    parent_scope,
                    parent.cinema().clone(),
                    r.thread(),
                    hole,
                    st.content.clone(),
                ));
                drop(guard);
                parent.add_child(self.clone());
                Ok(())
            }
        }
    }

    /// Drops the mount if `parent` still owns this door. Content is kept.
    pub(crate) fn suspend(&self, parent: &Tracker) {
        let mut st = self.lock();
        if !parent.is(&st.parent) {
            return;
        }
        if let Some(c) = st.container.take() {
            c.cancel_hooks();
            c.tracker.suspend(false);
        }
    }

    pub(crate) fn register_hook(&self, tracker: &Tracker, hook: Arc<dyn Hook>) -> Option<HookHandle> {
        let st = self.lock();
        let c = st.container.as_ref()?;
        if !c.tracker.is(&tracker.downgrade()) {
            return None;
        }
        tracker.register_hook_unchecked(hook)
    }
}

impl Content for Door {
    fn render(&self, r: &mut Renderer) -> Result<(), RenderError> {
        self.mount(r)
    }
}

fn detach(parent: &Weak<TrackerInner>, door: &Door) {
    if let Some(parent) = parent.upgrade() {
        Tracker::from_inner(parent).remove_child(door);
    }
}

fn live(t: Option<Thread>, token: &CancellationToken) -> Option<Thread> {
    t.filter(|_| !token.is_cancelled())
}

fn render_into(rendered: &Rendered, scope: Scope, t: Thread, content: Option<&dyn Content>, tag: Option<u64>) {
    let mut r = Renderer::new(scope, t);
    if let Some(id) = tag {
        r.write_str(&format!("<{TAG} id=\"d00r/{id}\">"));
    }
    let res = content.map_or(Ok(()), |c| c.render(&mut r));
    if tag.is_some() {
        r.write_str(&format!("</{TAG}>"));
    }
    *rendered.lock().unwrap_or_else(|e| e.into_inner()) = Some(res.map(|()| r.finish()));
}

fn assembled(rendered: &Rendered) -> Result<String, RenderError> {
    match rendered.lock().unwrap_or_else(|e| e.into_inner()).take() {
        Some(Ok(output)) => output.assemble(),
        Some(Err(e)) => Err(e),
        None => Ok(String::new()),
    }
}

fn cancelled(reply: Reply) {
    let _ = reply.send(Err(CallError::Cancelled.into()));
}

/// Sends the rendered patch as `action`; `reply` resolves with the browser's result.
fn submit(host: &Weak<dyn Host>, action: Action, rendered: &Rendered, token: CancellationToken, reply: Reply) {
    let html = match assembled(rendered) {
        Ok(html) => html,
        Err(e) => {
            let _ = reply.send(Err(e.into()));
            return;
        }
    };
    let Some(host) = host.upgrade() else {
        return;
    };
    let call = ActionCall::new(action, html.into_bytes(), Some(token), move |res| {
        let _ = reply.send(res.map(|_| ()).map_err(DoorError::from));
    });
    host.call(Arc::new(call));
}

impl Container {
    fn mount(
        door: &Door,
        host: &Arc<dyn Host>,
        parent: Scope,
        parent_cinema: Cinema,
        thread: &Thread,
        hole: Hole,
        content: Option<Arc<dyn Content>>,
    ) -> Self {
        let id = host.new_id();
        let tracker = Tracker::child(id, host, &parent, &parent_cinema, Arc::downgrade(&door.inner));
        let c = Self {
            id,
            host: Arc::downgrade(host),
            parent,
            parent_cinema,
            tracker,
        };
        c.render(thread, hole, content);
        c
    }

    fn new_tracker(&self, host: &Arc<dyn Host>, door: &Door) -> Tracker {
        Tracker::child(
            self.id,
            host,
            &self.parent,
            &self.parent_cinema,
            Arc::downgrade(&door.inner),
        )
    }

    fn cancel_hooks(&self) {
        if let Some(host) = self.host.upgrade() {
            host.hooks().cancel_hooks(self.id);
        }
    }

    /// Renders the door (wrapper tag included) into `hole`, joined to `thread`.
    fn render(&self, thread: &Thread, hole: Hole, content: Option<Arc<dyn Content>>) {
        let id = self.id;
        let parent = self.parent.token().clone();
        let scope = self.tracker.scope();
        shredder::run(
            move |t| {
                let Some(t) = live(t, &parent) else {
                    hole.fill(Ok(String::new()));
                    return;
                };
                let rendered = Rendered::default();
                {
                    let rendered = rendered.clone();
                    let parent = parent.clone();
                    t.write(move |t| {
                        if let Some(t) = live(t, &parent) {
                            render_into(&rendered, scope, t, content.as_deref(), Some(id));
                        }
                    });
                }
                t.write(move |t| {
                    if live(t, &parent).is_none() {
                        hole.fill(Ok(String::new()));
                        return;
                    }
                    hole.fill(assembled(&rendered));
                });
            },
            [thread.r(), self.tracker.thread().w()],
        );
    }

    /// Swaps in a fresh tracker and patches the door's children.
    fn update(&mut self, door: &Door, content: Option<Arc<dyn Content>>, reply: Reply) {
        self.tracker.suspend(true);
        let Some(host) = self.host.upgrade() else {
            return;
        };
        let tracker = self.new_tracker(&host, door);
        let id = self.id;
        let token = tracker.token().clone();
        let scope = tracker.scope();
        let weak = self.host.clone();
        tracker.thread().write(move |t| {
            let Some(t) = live(t, &token) else {
                cancelled(reply);
                return;
            };
            let rendered = Rendered::default();
            {
                let rendered = rendered.clone();
                let token = token.clone();
                t.write(move |t| {
                    if let Some(t) = live(t, &token) {
                        render_into(&rendered, scope, t, content.as_deref(), None);
                    }
                });
            }
            t.write(move |t| {
                if live(t, &token).is_none() {
                    cancelled(reply);
                    return;
                }
                submit(&weak, Action::DoorUpdate { id }, &rendered, token, reply);
            });
        });
        self.tracker = tracker;
    }

    /// Retires the door and replaces its node with `content` rendered in the parent scope.
    fn replace(self, content: Option<Arc<dyn Content>>, reply: Reply) {
        self.tracker.suspend(true);
        let Some(host) = self.host.upgrade() else {
            return;
        };
        let thread = host.spawner().new_thread();
        let id = self.id;
        let token = self.parent.token().clone();
        let rendered = Rendered::default();
        {
            let rendered = rendered.clone();
            let token = token.clone();
            let scope = self.parent.clone();
            thread.write(move |t| {
                if let Some(t) = live(t, &token) {
                    render_into(&rendered, scope, t, content.as_deref(), None);
                }
            });
        }
        let weak = self.host.clone();
        thread.write(move |t| {
            if live(t, &token).is_none() {
                cancelled(reply);
                return;
            }
            submit(&weak, Action::DoorReplace { id }, &rendered, token, reply);
        });
    }
}

/// Renders `content` as the page of `root`.
pub(crate) fn render_root(root: &Tracker, content: Arc<dyn Content>) -> oneshot::Receiver<Result<String, RenderError>> {
    let (tx, rx) = oneshot::channel();
    let token = root.token().clone();
    let scope = root.scope();
    root.thread().write(move |t| {
        let Some(t) = live(t, &token) else {
            let _ = tx.send(Err(RenderError::Cancelled));
            return;
        };
        let rendered = Rendered::default();
        {
            let rendered = rendered.clone();
            let token = token.clone();
            t.write(move |t| {
                if let Some(t) = live(t, &token) {
                    render_into(&rendered, scope, t, Some(content.as_ref()), None);
                }
            });
        }
        t.write(move |t| {
            if live(t, &token).is_none() {
                let _ = tx.send(Err(RenderError::Cancelled));
                return;
            }
            let _ = tx.send(assembled(&rendered));
        });
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use crate::door::testing::{Sent, TestHost};
    use crate::door::{FnHook, HookOutcome, content_fn};

    async fn wait<T>(rx: oneshot::Receiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("timed out")
            .expect("closed")
    }

    fn page(door: &Door) -> Arc<dyn Content> {
        let door = door.clone();
        Arc::new(content_fn(move |r| {
            r.write_str("<main>");
            r.render(&door)?;
            r.write_str("</main>");
            Ok(())
        }))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_render_nested_doors() {
        let (host, _sent) = TestHost::new();
        let inner = Door::with_content("b");
        let outer = Door::with_content(content_fn({
            let inner = inner.clone();
            move |r| {
                r.write_str("a");
                r.render(&inner)
            }
        }));

        let html = wait(render_root(host.root(), page(&outer))).await.unwrap();
        let (a, b) = (outer.id().unwrap(), inner.id().unwrap());
        assert_ne!(a, b);
        assert_eq!(
            html,
            format!("<main><d0-0r id=\"d00r/{a}\">a<d0-0r id=\"d00r/{b}\">b</d0-0r></d0-0r></main>")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_keeps_id() {
        let (host, mut sent) = TestHost::new();
        let door = Door::with_content("one");
        wait(render_root(host.root(), page(&door))).await.unwrap();
        let id = door.id().unwrap();

        wait(door.update("two")).await.unwrap();
        assert_eq!(door.id(), Some(id));
        assert_eq!(
            sent.recv().await.unwrap(),
            Sent {
                name: "door_update",
                arg: json!([id]),
                payload: "two".into(),
            }
        );

        wait(door.clear()).await.unwrap();
        assert_eq!(sent.recv().await.unwrap().payload, "");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unmounted_door_buffers_content() {
        let (host, _sent) = TestHost::new();
        let door = Door::new();
        let res = tokio::time::timeout(Duration::from_secs(5), door.update("later"))
            .await
            .unwrap();
        assert!(res.is_err());
        assert!(!door.is_mounted());

        let html = wait(render_root(host.root(), page(&door))).await.unwrap();
        let id = door.id().unwrap();
        assert_eq!(html, format!("<main><d0-0r id=\"d00r/{id}\">later</d0-0r></main>"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replace_and_remove() {
        let (host, mut sent) = TestHost::new();
        let door = Door::with_content("live");
        wait(render_root(host.root(), page(&door))).await.unwrap();
        let id = door.id().unwrap();

        wait(door.replace("<p>static</p>")).await.unwrap();
        assert_eq!(door.id(), None);
        assert_eq!(
            sent.recv().await.unwrap(),
            Sent {
                name: "door_replace",
                arg: json!([id]),
                payload: "<p>static</p>".into(),
            }
        );
        let html = wait(render_root(host.root(), page(&door))).await.unwrap();
        assert_eq!(html, "<main><p>static</p></main>");

        let gone = Door::with_content("x");
        wait(render_root(host.root(), page(&gone))).await.unwrap();
        let id = gone.id().unwrap();
        wait(gone.remove()).await.unwrap();
        let s = sent.recv().await.unwrap();
        assert_eq!((s.name, s.arg, s.payload.as_str()), ("door_replace", json!([id]), ""));
        let html = wait(render_root(host.root(), page(&gone))).await.unwrap();
        assert_eq!(html, "<main></main>");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_retires_scope_and_hooks() {
        let (host, _sent) = TestHost::new();
        let cancels = Arc::new(AtomicUsize::new(0));
        let scopes = Arc::new(Mutex::new(Vec::new()));
        let door = Door::with_content(content_fn({
            let cancels = cancels.clone();
            let scopes = scopes.clone();
            move |r| {
                scopes.lock().unwrap().push(r.scope().clone());
                let cancels = cancels.clone();
                let hook = FnHook::new(|_, _| HookOutcome::ok()).on_cancel(move |_| {
                    cancels.fetch_add(1, Ordering::SeqCst);
                });
                assert!(r.scope().register_hook(hook).is_some());
                Ok(())
            }
        }));
        wait(render_root(host.root(), page(&door))).await.unwrap();
        assert_eq!(host.hooks().len(), 1);
        let first = scopes.lock().unwrap()[0].clone();
        assert_eq!(first.door_id(), door.id());

        wait(door.update("plain")).await.unwrap();
        assert!(first.is_cancelled());
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert!(host.hooks().is_empty());
        assert!(first.register_hook(FnHook::new(|_, _| HookOutcome::ok())).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_suspends_children() {
        let (host, _sent) = TestHost::new();
        let inner_scope = Arc::new(Mutex::new(None));
        let inner = Door::with_content(content_fn({
            let inner_scope = inner_scope.clone();
            move |r| {
                *inner_scope.lock().unwrap() = Some(r.scope().clone());
                Ok(())
            }
        }));
        let outer = Door::with_content(content_fn({
            let inner = inner.clone();
            move |r| r.render(&inner)
        }));
        wait(render_root(host.root(), page(&outer))).await.unwrap();
        assert!(inner.is_mounted());

        wait(outer.update("flat")).await.unwrap();
        let scope = inner_scope.lock().unwrap().clone().unwrap();
        assert!(scope.is_cancelled());
        for _ in 0..250 {
            if !inner.is_mounted() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!inner.is_mounted());
    }
}
