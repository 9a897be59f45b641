//! Restartable one-shot timer running a callback on the tokio runtime.
//!
//! Each arming bumps a generation; a sleeper whose generation is stale when it
//! wakes does nothing. The callback runs without any lock held.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::AbortHandle;

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct State {
    generation: u64,
    fired: bool,
    handle: Option<AbortHandle>,
}

pub(crate) struct Timer {
    after: Duration,
    f: Callback,
    state: Arc<Mutex<State>>,
}

impl Timer {
    /// Creates a stopped timer.
    pub(crate) fn new(after: Duration, f: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            after,
            f: Arc::new(f),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// (Re)arms the timer unless it has already fired.
    ///
    /// Must be called inside a tokio runtime.
    pub(crate) fn reset(&self) -> bool {
        let mut st = self.lock();
        if st.fired {
            return false;
        }
        self.arm(&mut st);
        true
    }

    /// (Re)arms the timer, forgetting an earlier firing.
    pub(crate) fn restart(&self) {
        let mut st = self.lock();
        st.fired = false;
        self.arm(&mut st);
    }

    pub(crate) fn stop(&self) {
        let mut st = self.lock();
        st.generation += 1;
        if let Some(h) = st.handle.take() {
            h.abort();
        }
    }

    fn arm(&self, st: &mut State) {
        st.generation += 1;
        if let Some(h) = st.handle.take() {
            h.abort();
        }
        let generation = st.generation;
        let state = self.state.clone();
        let f = self.f.clone();
        let after = self.after;
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            {
                let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
                if st.generation != generation {
                    return;
                }
                st.fired = true;
                st.handle = None;
            }
            f();
        });
        st.handle = Some(task.abort_handle());
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}
