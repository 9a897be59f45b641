//! # Runtime: owner of all live instances.
//!
//! The transport layer in front of the runtime routes browser requests by
//! instance id. The runtime also carries the event bus and forwards its events
//! to the configured subscribers.
//!
//! ```text
//! Runtime::new(config, subscribers)
//!   ├─ Bus ──► listener ──► SubscriberSet ──► LogWriter / custom
//!   └─ instances: id ──► Instance   (removed when the instance ends)
//!
//! trigger_hook(id, door, hook, req, track) ─► Instance::trigger_hook
//! connect_stream(id, report, sink)         ─► Instance::connect_stream
//! connect_events(id, sender)               ─► Instance::connect_events
//! shutdown()                               ─► end all (Killed), drain subscribers
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::door::{HookOutcome, Request};
use crate::error::{ConnectError, HookError};
use crate::events::Bus;
use crate::subscribers::{Subscribe, SubscriberSet};

use super::{EndCause, EventSender, Instance};

struct RuntimeInner {
    config: Config,
    bus: Bus,
    token: CancellationToken,
    instances: Mutex<HashMap<String, Instance>>,
    subs: Mutex<Option<Arc<SubscriberSet>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeInner {
    fn instances(&self) -> MutexGuard<'_, HashMap<String, Instance>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Registry of live instances. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Creates a runtime and starts forwarding events to `subscribers`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: Config, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        let bus = Bus::new(config.bus_capacity_clamped());
        let token = CancellationToken::new();
        let subs = Arc::new(SubscriberSet::new(subscribers, bus.clone()));
        let listener = subs.listen(&bus, token.clone());
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                bus,
                token,
                instances: Mutex::new(HashMap::new()),
                subs: Mutex::new(Some(subs)),
                listener: Mutex::new(Some(listener)),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Event bus shared by every instance.
    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    /// Creates and registers a new instance.
    pub fn create(&self) -> Instance {
        let runtime: Weak<RuntimeInner> = Arc::downgrade(&self.inner);
        let id = Arc::new(Mutex::new(None::<String>));
        let slot = id.clone();
        let instance = Instance::new(&self.inner.config, self.inner.bus.clone(), move || {
            let id = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let (Some(rt), Some(id)) = (runtime.upgrade(), id) {
                rt.instances().remove(&id);
            }
        });
        *id.lock().unwrap_or_else(|e| e.into_inner()) = Some(instance.id().to_string());
        self.inner
            .instances()
            .insert(instance.id().to_string(), instance.clone());
        instance
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        self.inner.instances().get(id).cloned()
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.inner.instances().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers a browser request to a hook of instance `id`.
    pub async fn trigger_hook(
        &self,
        id: &str,
        door: u64,
        hook: u64,
        req: Request,
        track: u64,
    ) -> Result<HookOutcome, HookError> {
        let instance = self.get(id).ok_or(HookError::Gone)?;
        instance.trigger_hook(door, hook, req, track).await
    }

    /// Serves a streaming connection of instance `id`.
    pub async fn connect_stream<W: io::Write + Send>(
        &self,
        id: &str,
        report: &[u8],
        sink: W,
    ) -> Result<(), ConnectError> {
        let instance = self.get(id).ok_or(ConnectError::Gone)?;
        instance.connect_stream(report, sink).await
    }

    /// Attaches an event-sender connection to instance `id`.
    pub fn connect_events(&self, id: &str, sender: Arc<dyn EventSender>) -> Result<(), ConnectError> {
        let instance = self.get(id).ok_or(ConnectError::Gone)?;
        instance.connect_events(sender)
    }

    /// Applies an event-sender acknowledgement for instance `id`.
    pub fn call_response(&self, id: &str, body: &[u8]) -> Result<(), ConnectError> {
        let instance = self.get(id).ok_or(ConnectError::Gone)?;
        instance.call_response(body)
    }

    /// Ends instance `id`, typically because the browser left the page.
    pub fn end(&self, id: &str, cause: EndCause) -> bool {
        match self.get(id) {
            Some(instance) => {
                instance.end(cause);
                true
            }
            None => false,
        }
    }

    /// Ends every instance and waits for subscribers to drain.
    pub async fn shutdown(&self) {
        let instances: Vec<Instance> = self.inner.instances().drain().map(|(_, i)| i).collect();
        for instance in instances {
            instance.end(EndCause::Killed);
        }
        self.inner.token.cancel();
        let listener = self.inner.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = listener {
            let _ = handle.await;
        }
        let subs = self.inner.subs.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(set) = subs.and_then(|s| Arc::try_unwrap(s).ok()) {
            set.shutdown().await;
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("instances", &self.len())
            .field("transport", &self.inner.config.transport)
            .finish()
    }
}
