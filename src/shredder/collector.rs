use std::sync::{Arc, Mutex};

type Cleanup = Box<dyn FnOnce() + Send>;

/// Cleanups gathered during one propagation pass and applied once it completes.
#[derive(Clone, Default)]
pub struct Collector {
    inner: Arc<Mutex<Vec<Cleanup>>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cleanup.
    pub fn add(&self, f: impl FnOnce() + Send + 'static) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(f));
    }

    /// Runs and clears every registered cleanup, in registration order.
    pub fn apply(&self) {
        let cleanups = std::mem::take(&mut *self.inner.lock().unwrap_or_else(|e| e.into_inner()));
        for f in cleanups {
            f();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
