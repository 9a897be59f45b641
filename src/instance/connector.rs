//! # Connector: the event-sender transport.
//!
//! Instead of one long response carrying framed units, the transport hands the
//! connector an [`EventSender`] that delivers one call at a time and reports
//! each write back through [`Connector::on_write`]. The browser acknowledges
//! with a [`CallResponse`] carrying the last sequence number it received and
//! any results.
//!
//! ```text
//!   seq       last number assigned to a call
//!   send_seq  last number handed to the sender and written
//!   ack_seq   last number the browser confirmed
//!
//!   ack_seq ≤ send_seq ≤ seq
//! ```
//!
//! ## Rules
//! - At most one call is in flight; the next one goes out when the previous
//!   write succeeded.
//! - A failed write or a new connection rewinds `send_seq` to `ack_seq`; calls in
//!   between are resent unless their `on_write_err` refuses.
//! - While connected and idle, a `Touch` call goes out every `touch_interval()`.
//! - Without a result for `ttl()` the kill timer ends the instance.
//! - `EventSender` methods run with the connector locked and must not call back
//!   into it synchronously.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::config::Config;
use crate::error::CallError;
use crate::events::{Bus, Event, EventKind};

use super::report::CallResponse;
use super::timer::Timer;
use super::{Action, ActionCall, Call, CallData, CallResult, EndCause};

/// Live connection of the event-sender transport.
pub trait EventSender: Send + Sync + 'static {
    /// Starts writing call `seq`; `false` if the connection is already gone.
    ///
    /// The outcome is reported later through [`Connector::on_write`].
    fn send(&self, seq: u64, data: CallData) -> bool;

    /// The connection was replaced; the browser should reconnect.
    fn roll(&self);

    /// The instance was suspended.
    fn suspend(&self);

    /// The instance was killed.
    fn kill(&self);
}

type Resolved = Vec<(Arc<dyn Call>, CallResult)>;

#[derive(Default)]
struct Line {
    ended: bool,
    sender: Option<Arc<dyn EventSender>>,
    seq: u64,
    send_seq: u64,
    ack_seq: u64,
    calls: BTreeMap<u64, Arc<dyn Call>>,
}

impl Line {
    fn send_next(&mut self, out: &mut Resolved) {
        while self.send_seq < self.seq {
            let Some(sender) = self.sender.clone() else {
                return;
            };
            let next = self.send_seq + 1;
            let Some(call) = self.calls.get(&next).cloned() else {
                self.send_seq = next;
                continue;
            };
            let Some(data) = call.data() else {
                self.calls.remove(&next);
                out.push((call, Err(CallError::Cancelled)));
                self.send_seq = next;
                continue;
            };
            if !sender.send(next, data) {
                self.sender = None;
            }
            return;
        }
    }

    /// Rewinds to `ack_seq`, dropping calls up to `upto` that refuse a retry.
    fn reset(&mut self, upto: u64, out: &mut Resolved) {
        if upto > self.ack_seq {
            let refused: Vec<u64> = self
                .calls
                .range(self.ack_seq + 1..=upto)
                .filter(|(_, call)| !call.on_write_err())
                .map(|(seq, _)| *seq)
                .collect();
            for seq in refused {
                if let Some(call) = self.calls.remove(&seq) {
                    out.push((call, Err(CallError::Cancelled)));
                }
            }
        }
        self.send_seq = self.ack_seq;
    }

    fn touch(&mut self) {
        if self.seq != self.send_seq || self.sender.is_none() {
            return;
        }
        self.seq += 1;
        self.calls.insert(self.seq, Arc::new(ActionCall::fire(Action::Touch)));
    }
}

fn resolve(out: Resolved) {
    for (call, result) in out {
        call.on_result(result);
    }
}

/// Event-sender outbox of one instance.
pub struct Connector {
    bus: Bus,
    label: Arc<str>,
    line: Mutex<Line>,
    kill_timer: Timer,
    touch_timer: Timer,
}

impl Connector {
    /// Creates the connector and arms its kill timer; `on_expire` runs when it fires.
    ///
    /// Must be called inside a tokio runtime.
    pub(crate) fn new(
        config: &Config,
        bus: Bus,
        label: Arc<str>,
        on_expire: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        let connector = Arc::new_cyclic(|me: &Weak<Self>| {
            let me = me.clone();
            Self {
                bus,
                label,
                line: Mutex::new(Line::default()),
                kill_timer: Timer::new(config.ttl(), on_expire),
                touch_timer: Timer::new(config.touch_interval(), move || {
                    if let Some(c) = me.upgrade() {
                        c.on_touch_timer();
                    }
                }),
            }
        });
        connector.kill_timer.reset();
        connector
    }

    fn lock(&self) -> MutexGuard<'_, Line> {
        self.line.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn event(&self, kind: EventKind) -> Event {
        Event::new(kind).with_instance(self.label.clone())
    }

    /// Queues `call`, sending it at once when nothing is in flight.
    pub(crate) fn call(&self, call: Arc<dyn Call>) {
        let mut out = Resolved::new();
        {
            let mut line = self.lock();
            if line.ended {
                out.push((call, Err(CallError::InstanceEnded)));
            } else {
                let ready = line.seq == line.send_seq;
                line.seq += 1;
                let seq = line.seq;
                if let Some(action) = call.action() {
                    self.bus
                        .publish(self.event(EventKind::CallQueued).with_action(action));
                }
                line.calls.insert(seq, call);
                if ready {
                    line.send_next(&mut out);
                }
            }
        }
        resolve(out);
    }

    /// Attaches a new connection, replacing the previous one, and replays
    /// everything the browser has not acknowledged.
    pub fn connect(&self, sender: Arc<dyn EventSender>) {
        let mut out = Resolved::new();
        {
            let mut line = self.lock();
            if line.ended {
                drop(line);
                sender.kill();
                return;
            }
            self.touch_timer.restart();
            if let Some(prev) = line.sender.replace(sender) {
                prev.roll();
                self.bus.publish(
                    self.event(EventKind::ConnectionRolled)
                        .with_reason("replaced"),
                );
            }
            self.bus.publish(self.event(EventKind::ConnectionOpened));
            let upto = line.send_seq;
            line.reset(upto, &mut out);
            line.touch();
            line.send_next(&mut out);
        }
        resolve(out);
    }

    /// Reports the outcome of writing call `seq`.
    pub fn on_write(&self, seq: u64, ok: bool) {
        let mut out = Resolved::new();
        {
            let mut line = self.lock();
            if line.ended {
                return;
            }
            if ok {
                line.send_seq = seq;
            } else {
                line.sender = None;
                self.bus.publish(
                    self.event(EventKind::ConnectionClosed)
                        .with_reason("write_error"),
                );
                line.reset(seq, &mut out);
            }
            line.send_next(&mut out);
        }
        resolve(out);
    }

    /// Applies an acknowledgement from the browser.
    ///
    /// Returns `false` if the connector is ended or its kill timer already fired.
    pub fn call_response(&self, resp: CallResponse) -> bool {
        let mut out = Resolved::new();
        {
            let mut line = self.lock();
            if line.ended {
                return false;
            }
            line.ack_seq = resp.ack;
            if line.send_seq < line.ack_seq {
                line.send_seq = line.ack_seq;
            }
            if resp.results.is_empty() {
                return true;
            }
            if !self.kill_timer.reset() {
                return false;
            }
            self.touch_timer.restart();
            for (seq, result) in resp.results {
                if let Some(call) = line.calls.remove(&seq) {
                    out.push((call, result));
                }
            }
        }
        resolve(out);
        true
    }

    fn on_touch_timer(&self) {
        let mut out = Resolved::new();
        {
            let mut line = self.lock();
            if line.ended {
                return;
            }
            line.touch();
            line.send_next(&mut out);
            self.touch_timer.restart();
        }
        resolve(out);
    }

    /// Closes the connection with the signal matching `cause`, stops the timers
    /// and resolves every outstanding call with [`CallError::InstanceEnded`].
    pub(crate) fn end(&self, cause: EndCause) {
        let calls = {
            let mut line = self.lock();
            if line.ended {
                return;
            }
            line.ended = true;
            if let Some(sender) = line.sender.take() {
                match cause {
                    EndCause::Suspend => sender.suspend(),
                    EndCause::Killed | EndCause::SyncError => sender.kill(),
                }
                self.bus.publish(
                    self.event(EventKind::ConnectionClosed)
                        .with_reason(cause.as_str()),
                );
            }
            std::mem::take(&mut line.calls)
        };
        self.kill_timer.stop();
        self.touch_timer.stop();
        for call in calls.into_values() {
            call.on_result(Err(CallError::InstanceEnded));
        }
    }

    /// Calls queued but not yet resolved.
    pub fn outstanding(&self) -> usize {
        self.lock().calls.len()
    }
}
