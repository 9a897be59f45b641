//! # Spawner: bounded execution of synchronous task bodies.
//!
//! Jobs are queued on an unbounded channel and dispatched by one tokio task.
//! Each job acquires a permit (when a worker limit is set) and runs on the
//! blocking pool under `catch_unwind`.
//!
//! ```text
//! go(job) ──► [unbounded queue] ──► dispatcher ──► permit ──► spawn_blocking(job(ok))
//!                                                               └─ panic ─► TaskPanicked
//!                                                                          + token.cancel()
//! ```
//!
//! ## Rules
//! - `go()` after `kill()` returns `false` and drops the job.
//! - Jobs already queued when the spawner is killed (or its token cancelled) run with `ok = false`.
//! - A panicking job cancels the spawner token: the owning instance treats it as fatal.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::panic_message;
use crate::events::{Bus, Event, EventKind};

use super::thread::Thread;

pub(crate) type Job = Box<dyn FnOnce(bool) + Send>;

struct SpawnerInner {
    tx: mpsc::UnboundedSender<Job>,
    killed: Arc<AtomicBool>,
    token: CancellationToken,
}

/// Creates threads and executes their task bodies.
#[derive(Clone)]
pub struct Spawner {
    inner: Arc<SpawnerInner>,
}

impl Spawner {
    /// Creates a spawner and its dispatcher task.
    ///
    /// `limit` bounds concurrently running bodies (`None` = unbounded). Panics are
    /// published on `bus` tagged with `label` and cancel `token`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        limit: Option<usize>,
        bus: Bus,
        token: CancellationToken,
        label: Option<Arc<str>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let killed = Arc::new(AtomicBool::new(false));
        let semaphore = limit.map(|n| Arc::new(Semaphore::new(n.max(1))));

        tokio::spawn(dispatch(
            rx,
            semaphore,
            killed.clone(),
            token.clone(),
            bus,
            label,
        ));

        Self {
            inner: Arc::new(SpawnerInner { tx, killed, token }),
        }
    }

    /// Creates a new independent lane.
    pub fn new_thread(&self) -> Thread {
        Thread::lane(self.clone())
    }

    /// Queues a job. Returns `false` if the spawner no longer accepts work.
    pub fn go(&self, job: impl FnOnce(bool) + Send + 'static) -> bool {
        self.try_go(Box::new(job)).is_ok()
    }

    /// Queues a job, handing it back if the spawner no longer accepts work.
    pub(crate) fn try_go(&self, job: Job) -> Result<(), Job> {
        if self.is_killed() {
            return Err(job);
        }
        self.inner.tx.send(job).map_err(|e| e.0)
    }

    /// Stops accepting work; queued jobs run with `ok = false`.
    pub fn kill(&self) {
        self.inner.killed.store(true, Ordering::Release);
    }

    /// True after `kill()` or once the token is cancelled.
    pub fn is_killed(&self) -> bool {
        self.inner.killed.load(Ordering::Acquire) || self.inner.token.is_cancelled()
    }

    /// Token cancelled when a job panics.
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<Job>,
    semaphore: Option<Arc<Semaphore>>,
    killed: Arc<AtomicBool>,
    token: CancellationToken,
    bus: Bus,
    label: Option<Arc<str>>,
) {
    while let Some(job) = rx.recv().await {
        let permit = match &semaphore {
            Some(sem) => sem.clone().acquire_owned().await.ok(),
            None => None,
        };
        let ok = !killed.load(Ordering::Acquire) && !token.is_cancelled();
        let token = token.clone();
        let bus = bus.clone();
        let label = label.clone();

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| job(ok))) {
                let mut ev =
                    Event::new(EventKind::TaskPanicked).with_reason(panic_message(panic.as_ref()));
                if let Some(label) = label {
                    ev = ev.with_instance(label);
                }
                bus.publish(ev);
                token.cancel();
            }
        });
    }
}
