//! Host double for door and beam tests: records outbound calls and acknowledges them at once.

use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::Bus;
use crate::ids::IdGen;
use crate::instance::Call;
use crate::shredder::Spawner;

use super::{Cinema, Host, HookRegistry, Scope, Tracker};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Sent {
    pub name: &'static str,
    pub arg: Value,
    pub payload: String,
}

pub(crate) struct TestHost {
    spawner: Spawner,
    ids: IdGen,
    hooks: HookRegistry,
    bus: Bus,
    label: Arc<str>,
    token: CancellationToken,
    root: OnceLock<Tracker>,
    sent: mpsc::UnboundedSender<Sent>,
}

impl TestHost {
    /// Must be called inside a tokio runtime.
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Sent>) {
        let bus = Bus::new(64);
        let token = CancellationToken::new();
        let label: Arc<str> = "test".into();
        let (tx, rx) = mpsc::unbounded_channel();
        let host = Arc::new(Self {
            spawner: Spawner::new(Some(8), bus.clone(), token.clone(), Some(label.clone())),
            ids: IdGen::with_seed(1),
            hooks: HookRegistry::new(bus.clone(), label.clone()),
            bus,
            label,
            token: token.clone(),
            root: OnceLock::new(),
            sent: tx,
        });
        let dyn_host: Arc<dyn Host> = host.clone();
        let _ = host.root.set(Tracker::root(&dyn_host, token));
        (host, rx)
    }

    pub(crate) fn root(&self) -> &Tracker {
        self.root.get().expect("root tracker")
    }

    pub(crate) fn scope(&self) -> Scope {
        self.root().scope()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Host for TestHost {
    fn spawner(&self) -> &Spawner {
        &self.spawner
    }

    fn new_id(&self) -> u64 {
        self.ids.next()
    }

    fn root_cinema(&self) -> Option<Cinema> {
        self.root.get().map(|r| r.cinema().clone())
    }

    fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    fn call(&self, call: Arc<dyn Call>) {
        let Some(data) = call.data() else {
            return;
        };
        let _ = self.sent.send(Sent {
            name: data.name,
            arg: data.arg,
            payload: String::from_utf8_lossy(&data.payload).into_owned(),
        });
        call.on_result(Ok(None));
    }

    fn bus(&self) -> &Bus {
        &self.bus
    }

    fn label(&self) -> &Arc<str> {
        &self.label
    }
}
