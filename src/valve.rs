//! # Valve: run a callback now or once a condition is met.
//!
//! ```text
//!            put(f) queues            put(f) runs f(true)          put(f) runs f(false)
//!   ┌────────┐   open()   ┌────────┐              ┌────────┐
//!   │ Closed │ ─────────► │  Open  │              │ Broken │
//!   └────────┘            └────────┘              └────────┘
//!        └──────────────── break_valve() ────────────▲
//!   reset() returns Open/Broken to Closed.
//! ```
//!
//! ## Rules
//! - A put after open runs immediately, it never queues.
//! - Callbacks queued while closed run in put order.
//! - Callbacks always run outside the internal lock, so they may touch the valve.

use std::mem;
use std::sync::Mutex;

type Callback = Box<dyn FnOnce(bool) + Send>;

enum State {
    Closed(Vec<Callback>),
    Open,
    Broken,
}

/// Run-now-or-later gate.
pub struct Valve {
    state: Mutex<State>,
}

impl Valve {
    /// Creates a closed valve.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Closed(Vec::new())),
        }
    }

    /// Runs `f(true)` if open, `f(false)` if broken, otherwise queues it.
    pub fn put(&self, f: impl FnOnce(bool) + Send + 'static) {
        let ready = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match &mut *state {
                State::Closed(queue) => {
                    queue.push(Box::new(f));
                    return;
                }
                State::Open => true,
                State::Broken => false,
            }
        };
        f(ready);
    }

    /// Opens the valve and runs queued callbacks with `true`.
    ///
    /// Returns `false` when the valve was not closed.
    pub fn open(&self) -> bool {
        self.settle(State::Open, true)
    }

    /// Breaks the valve and runs queued callbacks with `false`.
    ///
    /// Returns `false` when the valve was not closed.
    pub fn break_valve(&self) -> bool {
        self.settle(State::Broken, false)
    }

    /// Returns an open or broken valve to the closed state.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !matches!(*state, State::Closed(_)) {
            *state = State::Closed(Vec::new());
        }
    }

    /// True once the valve has been opened (and not reset).
    pub fn is_open(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(|e| e.into_inner()),
            State::Open
        )
    }

    fn settle(&self, next: State, ready: bool) -> bool {
        let queued = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let State::Closed(queue) = &mut *state else {
                return false;
            };
            let queued = mem::take(queue);
            *state = next;
            queued
        };
        for f in queued {
            f(ready);
        }
        true
    }
}

impl Default for Valve {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<(u32, bool)>>>, impl Fn(u32) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let make = move |n: u32| -> Callback {
            let l = l.clone();
            Box::new(move |ok| l.lock().unwrap().push((n, ok)))
        };
        (log, make)
    }

    #[test]
    fn test_queue_then_open() {
        let (log, make) = recorder();
        let valve = Valve::new();
        valve.put(make(1));
        valve.put(make(2));
        assert!(log.lock().unwrap().is_empty());
        assert!(valve.open());
        assert_eq!(*log.lock().unwrap(), vec![(1, true), (2, true)]);
    }

    #[test]
    fn test_put_after_open_runs_now() {
        let (log, make) = recorder();
        let valve = Valve::new();
        valve.open();
        valve.put(make(3));
        assert_eq!(*log.lock().unwrap(), vec![(3, true)]);
        assert!(!valve.open());
        assert!(valve.is_open());
    }

    #[test]
    fn test_break() {
        let (log, make) = recorder();
        let valve = Valve::new();
        valve.put(make(1));
        assert!(valve.break_valve());
        valve.put(make(2));
        assert_eq!(*log.lock().unwrap(), vec![(1, false), (2, false)]);
    }

    #[test]
    fn test_reset() {
        let (log, make) = recorder();
        let valve = Valve::new();
        valve.open();
        valve.reset();
        valve.put(make(1));
        assert!(log.lock().unwrap().is_empty());
        valve.open();
        assert_eq!(*log.lock().unwrap(), vec![(1, true)]);
    }

    #[test]
    fn test_callback_may_reenter() {
        let valve = Arc::new(Valve::new());
        let (log, make) = recorder();
        let v = valve.clone();
        let inner = make(2);
        valve.put(move |_| v.put(inner));
        valve.open();
        assert_eq!(*log.lock().unwrap(), vec![(2, true)]);
    }
}
