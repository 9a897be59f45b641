//! Joined tasks: one body that runs once every joined thread admitted it.
//!
//! Joins are admitted group by group. A group is a join followed by the `instant`
//! joins right after it; the members of a group are admitted together, the next
//! group only once the whole previous group has arrived.
//!
//! ```text
//! run(body, [a.w(), b.r().instant(), c.w()])
//!   group 1: a.w + b.r   ── both arrived ──►  group 2: c.w  ── arrived ──► body(Some(t))
//!   any admission refused or any joined thread killed ──────────────────► body(None)
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::thread::{Mode, Thread};

type Body = Box<dyn FnOnce(Option<Thread>) + Send>;

/// A thread joined for one task, in a given mode.
pub struct Joined {
    thread: Thread,
    mode: Mode,
    instant: bool,
}

impl Joined {
    pub(crate) fn new(thread: Thread, mode: Mode) -> Self {
        Self {
            thread,
            mode,
            instant: false,
        }
    }

    /// Admits this join together with the preceding one instead of after it.
    pub fn instant(mut self) -> Self {
        self.instant = true;
        self
    }
}

struct JoinState {
    groups: VecDeque<Vec<(Thread, Mode)>>,
    remaining: usize,
    aborted: bool,
    body: Option<Body>,
}

pub(crate) struct JoinTask {
    thread: Thread,
    state: Mutex<JoinState>,
}

/// Releases the task thread when the body returns or unwinds.
struct MainGuard(Thread);

impl Drop for MainGuard {
    fn drop(&mut self) {
        self.0.finish_main();
    }
}

impl Drop for JoinTask {
    fn drop(&mut self) {
        let body = self.state.get_mut().unwrap_or_else(|e| e.into_inner()).body.take();
        if let Some(body) = body {
            self.spawn_main(body, false);
        }
    }
}

impl JoinTask {
    pub(crate) fn start(body: Body, joins: Vec<Joined>) {
        let Some(first) = joins.first() else {
            body(None);
            return;
        };
        let spawner = first.thread.spawner().clone();

        let mut groups: VecDeque<Vec<(Thread, Mode)>> = VecDeque::new();
        for join in joins {
            match groups.back_mut() {
                Some(group) if join.instant => group.push((join.thread, join.mode)),
                _ => groups.push_back(vec![(join.thread, join.mode)]),
            }
        }

        let task = Arc::new(JoinTask {
            thread: Thread::task(spawner),
            state: Mutex::new(JoinState {
                groups,
                remaining: 0,
                aborted: false,
                body: Some(body),
            }),
        });
        task.next_group();
    }

    fn lock(&self) -> MutexGuard<'_, JoinState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn thread(&self) -> &Thread {
        &self.thread
    }

    fn next_group(self: &Arc<Self>) {
        let group = {
            let mut st = self.lock();
            if st.aborted {
                return;
            }
            match st.groups.pop_front() {
                Some(group) => {
                    st.remaining = group.len();
                    group
                }
                None => {
                    let body = st.body.take();
                    drop(st);
                    if let Some(body) = body {
                        self.spawn_main(body, true);
                    }
                    return;
                }
            }
        };
        for (owner, mode) in group {
            if !owner.admit(mode, self) {
                self.abort();
            }
        }
    }

    /// Called by `owner` when the frame holding this task becomes active.
    ///
    /// Returns `false` if the task thread is already done; the owner then drops
    /// the membership itself.
    pub(crate) fn arrive(self: &Arc<Self>, owner: &Thread, frame: u64, killed: bool) -> bool {
        if !self.thread.add_head(owner, frame) {
            return false;
        }
        let ready = {
            let mut st = self.lock();
            if st.aborted {
                return true;
            }
            if killed {
                drop(st);
                self.abort();
                return true;
            }
            st.remaining = st.remaining.saturating_sub(1);
            st.remaining == 0
        };
        if ready {
            self.next_group();
        }
        true
    }

    fn abort(&self) {
        let body = {
            let mut st = self.lock();
            if st.aborted {
                return;
            }
            st.aborted = true;
            st.body.take()
        };
        if let Some(body) = body {
            self.spawn_main(body, false);
        }
    }

    fn spawn_main(&self, body: Body, live: bool) {
        let thread = self.thread.clone();
        let job = Box::new(move |ok: bool| {
            let _guard = MainGuard(thread.clone());
            let arg = (live && ok && !thread.is_killed()).then(|| thread.clone());
            body(arg);
        });
        if let Err(job) = self.thread.spawner().try_go(job) {
            job(false);
        }
    }
}
