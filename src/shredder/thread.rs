//! # Thread: a serializable execution lane.
//!
//! A thread holds a FIFO of frames. The front frame is the active one; a frame
//! completes once every task joined into it has finished, and then the next frame
//! starts.
//!
//! ```text
//! frames:  [ R(started) {a, b} ] [ W {c} ] [ WS {d} ] [ R {e, f} ]
//!              active                 queued
//! ```
//!
//! ## Rules
//! - `Write` and `WriteStarving` always open their own frame.
//! - `Read` joins the last read frame unless a write stands behind it; an unstarted
//!   `WriteStarving` frame does not block it, which is what lets starving writes wait.
//! - A running `WriteStarving` frame never holds readers back: they join it.
//! - Queued frames keep their lane alive, so dropping every `Thread` handle does
//!   not drop admitted work.
//! - A task joined into a started frame arrives immediately; otherwise it waits in
//!   the frame's pending list until the frame starts.
//! - Killing a thread rejects new admissions, cascades the kill to the tasks of the
//!   active frame and runs `after` once nothing is left.
//! - Task threads (created per joined task) are done once their body has returned
//!   and their own frames drained; completion is reported to every frame that holds
//!   them as a member.

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use super::spawner::Spawner;
use super::task::{JoinTask, Joined};

pub(crate) type After = Box<dyn FnOnce() + Send>;

/// How a task is admitted onto a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    Read,
    Write,
    WriteStarving,
}

struct Frame {
    id: u64,
    mode: Mode,
    started: bool,
    pending: Vec<Arc<JoinTask>>,
    members: Vec<Thread>,
}

enum Kind {
    Lane,
    Task { finished: bool },
}

/// A frame waiting for a task thread; keeps the owning lane alive until then.
struct Head {
    owner: Thread,
    frame: u64,
}

struct ThreadState {
    frames: VecDeque<Frame>,
    next_frame: u64,
    kind: Kind,
    killed: bool,
    done: bool,
    heads: Vec<Head>,
    after: Option<After>,
}

pub(crate) struct ThreadInner {
    spawner: Spawner,
    state: Mutex<ThreadState>,
}

/// Serializable execution lane.
///
/// Cheap to clone; clones refer to the same lane.
#[derive(Clone)]
pub struct Thread {
    inner: Arc<ThreadInner>,
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.lock();
        f.debug_struct("Thread")
            .field("frames", &st.frames.len())
            .field("killed", &st.killed)
            .field("done", &st.done)
            .finish()
    }
}

impl Thread {
    pub(crate) fn lane(spawner: Spawner) -> Self {
        Self::with_kind(spawner, Kind::Lane)
    }

    pub(crate) fn task(spawner: Spawner) -> Self {
        Self::with_kind(spawner, Kind::Task { finished: false })
    }

    fn with_kind(spawner: Spawner, kind: Kind) -> Self {
        Self {
            inner: Arc::new(ThreadInner {
                spawner,
                state: Mutex::new(ThreadState {
                    frames: VecDeque::new(),
                    next_frame: 0,
                    kind,
                    killed: false,
                    done: false,
                    heads: Vec::new(),
                    after: None,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ThreadState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawner executing this thread's tasks.
    pub fn spawner(&self) -> &Spawner {
        &self.inner.spawner
    }

    /// Joins this thread for reading.
    pub fn r(&self) -> Joined {
        Joined::new(self.clone(), Mode::Read)
    }

    /// Joins this thread for exclusive writing.
    pub fn w(&self) -> Joined {
        Joined::new(self.clone(), Mode::Write)
    }

    /// Joins this thread for a starving write.
    pub fn ws(&self) -> Joined {
        Joined::new(self.clone(), Mode::WriteStarving)
    }

    /// Runs `f` alongside other readers of this thread.
    pub fn read(&self, f: impl FnOnce(Option<Thread>) + Send + 'static) {
        super::run(f, [self.r()]);
    }

    /// Runs `f` with exclusive access to this thread.
    pub fn write(&self, f: impl FnOnce(Option<Thread>) + Send + 'static) {
        super::run(f, [self.w()]);
    }

    /// Runs `f` exclusively, letting later reads overtake it while it waits.
    pub fn write_starving(&self, f: impl FnOnce(Option<Thread>) + Send + 'static) {
        super::run(f, [self.ws()]);
    }

    /// Kills the thread. Returns `false` if it was already killed.
    pub fn kill(&self) -> bool {
        self.kill_with(None)
    }

    /// Kills the thread and runs `after` once it has fully drained.
    ///
    /// Returns `false` (and drops `after`) if the thread was already killed.
    pub fn kill_then(&self, after: impl FnOnce() + Send + 'static) -> bool {
        self.kill_with(Some(Box::new(after)))
    }

    /// True once the thread has been killed (or has finished).
    pub fn is_killed(&self) -> bool {
        self.lock().killed
    }

    pub(crate) fn kill_with(&self, after: Option<After>) -> bool {
        let members = {
            let mut st = self.lock();
            if st.killed {
                return false;
            }
            st.killed = true;
            st.after = after;
            match st.frames.front() {
                Some(front) if front.started => front.members.clone(),
                Some(_) => Vec::new(),
                None => {
                    drop(st);
                    self.settle();
                    return true;
                }
            }
        };
        for member in members {
            member.kill_with(None);
        }
        true
    }

    /// Admits `task` in `mode`. Returns `false` if the thread no longer accepts work.
    pub(crate) fn admit(&self, mode: Mode, task: &Arc<JoinTask>) -> bool {
        let frame = {
            let mut st = self.lock();
            if st.killed || st.done {
                return false;
            }
            let target = match mode {
                Mode::Read => st.read_target(),
                Mode::Write | Mode::WriteStarving => None,
            };
            match target {
                Some(i) if st.frames[i].started => {
                    let frame = &mut st.frames[i];
                    frame.members.push(task.thread().clone());
                    frame.id
                }
                Some(i) => {
                    st.frames[i].pending.push(task.clone());
                    return true;
                }
                None => {
                    let started = st.frames.is_empty();
                    let id = st.next_frame;
                    st.next_frame += 1;
                    let mut frame = Frame {
                        id,
                        mode,
                        started,
                        pending: Vec::new(),
                        members: Vec::new(),
                    };
                    if started {
                        frame.members.push(task.thread().clone());
                    } else {
                        frame.pending.push(task.clone());
                    }
                    st.frames.push_back(frame);
                    if !started {
                        return true;
                    }
                    id
                }
            }
        };
        if !task.arrive(self, frame, false) {
            self.remove_member(frame, task.thread());
            self.settle();
        }
        true
    }

    /// Registers `owner`'s frame to be notified when this task thread is done.
    ///
    /// Returns `false` if the thread is already done.
    pub(crate) fn add_head(&self, owner: &Thread, frame: u64) -> bool {
        let mut st = self.lock();
        if st.done {
            return false;
        }
        st.heads.push(Head {
            owner: owner.clone(),
            frame,
        });
        true
    }

    /// Marks the body of a task thread as returned.
    pub(crate) fn finish_main(&self) {
        {
            let mut st = self.lock();
            if let Kind::Task { finished } = &mut st.kind {
                *finished = true;
            }
        }
        self.settle();
    }

    fn member_done(&self, frame: u64, member: &Thread) {
        self.remove_member(frame, member);
        self.settle();
    }

    fn remove_member(&self, frame: u64, member: &Thread) {
        let mut st = self.lock();
        let Some(f) = st.frames.iter_mut().find(|f| f.id == frame) else {
            return;
        };
        if let Some(pos) = f.members.iter().position(|m| Arc::ptr_eq(&m.inner, &member.inner)) {
            f.members.swap_remove(pos);
        }
    }

    /// Advances frames and detects completion.
    fn settle(&self) {
        loop {
            let mut st = self.lock();
            if st.done {
                return;
            }
            match st.frames.front() {
                Some(front) if front.started && front.pending.is_empty() && front.members.is_empty() => {
                    st.frames.pop_front();
                    let killed = st.killed;
                    let Some(next) = st.frames.front_mut() else {
                        continue;
                    };
                    next.started = true;
                    let id = next.id;
                    let pending = mem::take(&mut next.pending);
                    next.members.extend(pending.iter().map(|t| t.thread().clone()));
                    drop(st);
                    for task in pending {
                        if !task.arrive(self, id, killed) {
                            self.remove_member(id, task.thread());
                        }
                    }
                }
                Some(_) => return,
                None => {
                    let finished = match st.kind {
                        Kind::Lane => st.killed,
                        Kind::Task { finished } => finished,
                    };
                    if !finished {
                        return;
                    }
                    st.done = true;
                    st.killed = true;
                    let heads = mem::take(&mut st.heads);
                    let after = st.after.take();
                    drop(st);
                    for head in heads {
                        head.owner.member_done(head.frame, self);
                    }
                    if let Some(after) = after {
                        after();
                    }
                    return;
                }
            }
        }
    }
}

impl ThreadState {
    /// Index of the frame a new reader joins, if any.
    ///
    /// Queued starving writes are skipped; a running one takes the reader in.
    fn read_target(&self) -> Option<usize> {
        for (i, frame) in self.frames.iter().enumerate().rev() {
            match frame.mode {
                Mode::WriteStarving if !frame.started => continue,
                Mode::Read | Mode::WriteStarving => return Some(i),
                Mode::Write => return None,
            }
        }
        None
    }
}
