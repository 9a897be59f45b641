//! # Outbound calls.
//!
//! A [`Call`] is what the outbox queues: it produces its [`CallData`] lazily at
//! write time, decides whether it may be written again after a delivery failure,
//! and receives the browser's result.
//!
//! ## Rules
//! - `data()` returning `None` or `on_write_err()` returning `false` drops the
//!   call; the outbox then resolves it with [`CallError::Cancelled`].
//! - `on_write_err` may run with the outbox locked and must not queue calls.
//! - [`ActionCall`] resolves once; later results are ignored.

use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::CallError;

use super::Action;

/// Browser result of a call: an optional output value or an error.
pub type CallResult = Result<Option<Value>, CallError>;

/// What gets written for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallData {
    pub name: &'static str,
    pub arg: Value,
    pub payload: Vec<u8>,
}

/// A unit of outbound work.
pub trait Call: Send + Sync + 'static {
    /// Data to write, or `None` when the call is no longer relevant.
    fn data(&self) -> Option<CallData>;

    /// Whether the call may be written again after its delivery failed.
    fn on_write_err(&self) -> bool;

    /// Delivers the browser's result.
    fn on_result(&self, result: CallResult);

    /// Action name for events, when known without building the data.
    fn action(&self) -> Option<&'static str> {
        None
    }
}

type Callback = Box<dyn FnOnce(CallResult) + Send>;

/// [`Call`] sending one [`Action`], optionally bound to a cancellation token.
pub struct ActionCall {
    action: Action,
    payload: Vec<u8>,
    token: Option<CancellationToken>,
    callback: Mutex<Option<Callback>>,
}

impl ActionCall {
    /// Creates a call; `on_result` runs once with the outcome.
    pub fn new(
        action: Action,
        payload: Vec<u8>,
        token: Option<CancellationToken>,
        on_result: impl FnOnce(CallResult) + Send + 'static,
    ) -> Self {
        Self {
            action,
            payload,
            token,
            callback: Mutex::new(Some(Box::new(on_result))),
        }
    }

    /// Creates a call whose outcome arrives on the returned receiver.
    pub fn reply(
        action: Action,
        payload: Vec<u8>,
        token: Option<CancellationToken>,
    ) -> (Self, oneshot::Receiver<CallResult>) {
        let (tx, rx) = oneshot::channel();
        let call = Self::new(action, payload, token, move |res| {
            let _ = tx.send(res);
        });
        (call, rx)
    }

    /// A call nobody waits for.
    pub(crate) fn fire(action: Action) -> Self {
        Self::new(action, Vec::new(), None, |_| {})
    }

    fn is_cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(|t| t.is_cancelled())
    }

    fn resolve(&self, result: CallResult) {
        let callback = self.callback.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(f) = callback {
            f(result);
        }
    }
}

impl Call for ActionCall {
    fn data(&self) -> Option<CallData> {
        if self.is_cancelled() {
            return None;
        }
        Some(CallData {
            name: self.action.name(),
            arg: self.action.arg(),
            payload: self.payload.clone(),
        })
    }

    fn on_write_err(&self) -> bool {
        !self.is_cancelled()
    }

    fn on_result(&self, result: CallResult) {
        self.resolve(result);
    }

    fn action(&self) -> Option<&'static str> {
        Some(self.action.name())
    }
}

impl std::fmt::Debug for ActionCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionCall")
            .field("action", &self.action)
            .field("payload", &self.payload.len())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_resolves_once() {
        let (call, mut rx) = ActionCall::reply(Action::Test { arg: json!(1) }, b"x".to_vec(), None);
        let data = call.data().unwrap();
        assert_eq!(data.name, "test");
        assert_eq!(data.arg, json!([1]));
        assert_eq!(data.payload, b"x");
        call.on_result(Ok(Some(json!("done"))));
        call.on_result(Err(CallError::InstanceEnded));
        assert_eq!(rx.try_recv().unwrap(), Ok(Some(json!("done"))));
    }

    #[test]
    fn test_cancelled_call_is_skipped() {
        let token = CancellationToken::new();
        let (call, mut rx) = ActionCall::reply(Action::Touch, Vec::new(), Some(token.clone()));
        assert!(call.on_write_err());
        token.cancel();
        assert!(call.data().is_none());
        assert!(!call.on_write_err());
        assert!(rx.try_recv().is_err());
        call.on_result(Err(CallError::Cancelled));
        assert_eq!(rx.try_recv().unwrap(), Err(CallError::Cancelled));
    }
}
