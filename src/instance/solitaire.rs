//! # Solitaire: the streaming transport.
//!
//! The browser holds one long-lived response open at a time. Each connection
//! starts with a report, then receives units as the deck produces them.
//!
//! ```text
//! connect(report) ─► deck.on_report ─► replace previous connection ─► loop:
//!   write_next ─ Written ──► flush; roll once roll_size is exceeded
//!              ─ Nothing ──► wait (wake | deadline | cancel); roll if anything was written
//!              ─ PendingLimit ► pause if nothing was written, roll, close
//!   roll: signal Roll and keep streaming ("zombie") until replaced
//! end(cause) ─► Kill / Suspend signal, close
//! ```
//!
//! ## Rules
//! - Only one connection writes at a time; a new one cancels and awaits the old.
//! - The deadline is `min(request() - elapsed, roll_time())`, or
//!   `roll_pending_time` while calls await a result.
//! - A connection that reaches its deadline without writing anything while calls
//!   are pending queues a `Touch` call to provoke a fresh report.
//! - A malformed report leaves the instance alone; a contradicting one ends it.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{CallError, ConnectError, DeckError};
use crate::events::{Bus, Event, EventKind};

use super::deck::{Deck, WriteOutcome};
use super::report::Report;
use super::wire::Signal;
use super::{Action, ActionCall, Call, EndCause};

type Fault = Box<dyn Fn(DeckError) + Send + Sync>;

/// [`io::Write`] sink that forwards each flushed chunk over a channel.
///
/// Writes fail with `BrokenPipe` once the receiver is dropped.
pub struct ChannelSink {
    buf: Vec<u8>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { buf: Vec::new(), tx }, rx)
    }
}

impl io::Write for ChannelSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.tx.is_closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::take(&mut self.buf);
        self.tx.send(chunk).map_err(|_| io::ErrorKind::BrokenPipe.into())
    }
}

/// Counts bytes written through it.
struct Counted<W> {
    inner: W,
    total: usize,
}

impl<W: io::Write> io::Write for Counted<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(data)?;
        self.total += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: io::Write> Counted<W> {
    fn signal(&mut self, s: Signal) -> io::Result<()> {
        self.inner.write_all(&s.encode())?;
        self.inner.flush()
    }
}

enum Wake {
    Notified,
    Deadline,
    Cancelled,
}

struct Conn {
    token: CancellationToken,
    cause: Mutex<Option<EndCause>>,
    wake: Notify,
}

impl Conn {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            cause: Mutex::new(None),
            wake: Notify::new(),
        }
    }

    fn end(&self, cause: EndCause) {
        *self.cause.lock().unwrap_or_else(|e| e.into_inner()) = Some(cause);
        self.token.cancel();
    }

    fn cause(&self) -> Option<EndCause> {
        *self.cause.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn wait(&self, deadline: Option<Instant>) -> Wake {
        let timer = async {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Wake::Cancelled,
            _ = self.wake.notified() => Wake::Notified,
            _ = timer => Wake::Deadline,
        }
    }
}

/// Why the loop stopped writing.
enum Stop {
    Roll(&'static str),
    /// Roll, then close.
    RollAndClose,
    Close(&'static str),
}

#[derive(Default)]
struct Line {
    conn: Option<Arc<Conn>>,
    ended: bool,
}

/// Streaming outbox of one instance.
pub struct Solitaire {
    config: Config,
    deck: Deck,
    bus: Bus,
    label: Arc<str>,
    token: CancellationToken,
    line: Mutex<Line>,
    writing: tokio::sync::Mutex<()>,
    on_sync_error: Fault,
}

impl Solitaire {
    /// Creates the transport. `token` is the instance token; `on_sync_error`
    /// runs whenever the deck is found inconsistent.
    pub(crate) fn new(
        config: &Config,
        bus: Bus,
        label: Arc<str>,
        token: CancellationToken,
        on_sync_error: impl Fn(DeckError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            deck: Deck::new(config.queue_limit(), config.pending_limit()),
            config: config.clone(),
            bus,
            label,
            token,
            line: Mutex::new(Line::default()),
            writing: tokio::sync::Mutex::new(()),
            on_sync_error: Box::new(on_sync_error),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Line> {
        self.line.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn event(&self, kind: EventKind) -> Event {
        Event::new(kind).with_instance(self.label.clone())
    }

    pub(crate) fn deck(&self) -> &Deck {
        &self.deck
    }

    /// Queues `call` and wakes the active connection.
    ///
    /// After [`Solitaire::end`] the call is resolved with [`CallError::InstanceEnded`].
    pub(crate) fn call(&self, call: Arc<dyn Call>) {
        let action = call.action();
        let (queued, conn) = {
            let line = self.lock();
            if line.ended {
                drop(line);
                call.on_result(Err(CallError::InstanceEnded));
                return;
            }
            (self.deck.insert(call), line.conn.clone())
        };
        let mut ev = self.event(match queued {
            Ok(_) => EventKind::CallQueued,
            Err(_) => EventKind::QueueLimit,
        });
        if let Some(action) = action {
            ev = ev.with_action(action);
        }
        self.bus.publish(ev);
        if let Err(e) = queued {
            (self.on_sync_error)(e);
            return;
        }
        if let Some(conn) = conn {
            conn.wake.notify_one();
        }
    }

    /// Ends the active connection with the signal matching `cause` and
    /// resolves every outstanding call with [`CallError::InstanceEnded`].
    pub(crate) fn end(&self, cause: EndCause) {
        let calls = {
            let mut line = self.lock();
            if line.ended {
                return;
            }
            line.ended = true;
            if let Some(conn) = line.conn.take() {
                conn.end(cause);
            }
            self.deck.drain()
        };
        for call in calls {
            call.on_result(Err(CallError::InstanceEnded));
        }
    }

    /// Serves one connection until it is replaced, rolled out or ended.
    pub(crate) async fn connect<W: io::Write + Send>(&self, body: &[u8], sink: W) -> Result<(), ConnectError> {
        let start = Instant::now();
        let report = Report::parse(body)?;
        if let Err(e) = self.deck.on_report(&report) {
            (self.on_sync_error)(e.clone());
            return Err(e.into());
        }
        let conn = Arc::new(Conn::new(self.token.child_token()));
        {
            let mut line = self.lock();
            if line.ended {
                return Err(ConnectError::Gone);
            }
            if let Some(prev) = line.conn.replace(conn.clone()) {
                prev.token.cancel();
            }
        }
        let _writing = self.writing.lock().await;
        self.bus.publish(self.event(EventKind::ConnectionOpened));
        let mut w = Counted { inner: sink, total: 0 };
        let reason = self.run(&conn, &mut w, start).await;
        {
            let mut line = self.lock();
            if line.conn.as_ref().is_some_and(|c| Arc::ptr_eq(c, &conn)) {
                line.conn = None;
            }
        }
        self.bus
            .publish(self.event(EventKind::ConnectionClosed).with_reason(reason));
        Ok(())
    }

    async fn run<W: io::Write>(&self, conn: &Conn, w: &mut Counted<W>, start: Instant) -> &'static str {
        let cfg = &self.config;
        let mut ttl = cfg.request().saturating_sub(start.elapsed()).min(cfg.roll_time());
        if self.deck.has_pending() {
            ttl = ttl.min(cfg.roll_pending_time);
        }
        let deadline = Instant::now() + ttl;
        let mut zombie = false;
        let mut sentenced = false;
        loop {
            if conn.token.is_cancelled() {
                return self.closing(conn, w);
            }
            let stop = match self.deck.write_next(w) {
                WriteOutcome::Failed(e) => {
                    self.bus
                        .publish(self.event(EventKind::CallFailed).with_reason(e.to_string()));
                    Stop::Close("write_error")
                }
                WriteOutcome::Sync(e) => {
                    (self.on_sync_error)(e);
                    Stop::Close("sync_error")
                }
                WriteOutcome::Written => {
                    if zombie || (!sentenced && w.total <= cfg.roll_size) {
                        if io::Write::flush(w).is_err() {
                            return "write_error";
                        }
                        continue;
                    }
                    Stop::Roll("size")
                }
                WriteOutcome::Nothing if zombie => match conn.wait(None).await {
                    Wake::Cancelled => return self.closing(conn, w),
                    _ => continue,
                },
                WriteOutcome::Nothing if w.total == 0 => match conn.wait(Some(deadline)).await {
                    Wake::Cancelled => return self.closing(conn, w),
                    Wake::Notified => continue,
                    Wake::Deadline if self.deck.has_pending() && !sentenced => {
                        if let Err(e) = self.deck.insert(Arc::new(ActionCall::fire(Action::Touch))) {
                            (self.on_sync_error)(e);
                            return "sync_error";
                        }
                        sentenced = true;
                        continue;
                    }
                    Wake::Deadline => Stop::Roll("time"),
                },
                WriteOutcome::Nothing => Stop::Roll("drained"),
                WriteOutcome::PendingLimit => {
                    if w.total == 0 {
                        tokio::select! {
                            _ = conn.token.cancelled() => return self.closing(conn, w),
                            _ = sleep(cfg.roll_pending_time) => {}
                        }
                    }
                    Stop::RollAndClose
                }
            };
            let reason = match stop {
                Stop::Close(reason) => return reason,
                Stop::Roll(reason) => reason,
                Stop::RollAndClose => "pending",
            };
            zombie = true;
            self.bus
                .publish(self.event(EventKind::ConnectionRolled).with_reason(reason));
            if w.signal(Signal::Roll).is_err() {
                return "write_error";
            }
            if matches!(stop, Stop::RollAndClose) {
                return "pending";
            }
        }
    }

    /// Writes the end signal, if the connection was ended by its instance.
    fn closing<W: io::Write>(&self, conn: &Conn, w: &mut Counted<W>) -> &'static str {
        let signal = match conn.cause() {
            None => return "replaced",
            Some(EndCause::SyncError) => return EndCause::SyncError.as_str(),
            Some(EndCause::Killed) => Signal::Kill,
            Some(EndCause::Suspend) => Signal::Suspend,
        };
        let _ = w.signal(signal);
        signal.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::instance::CallResult;
    use crate::instance::wire::{Unit, parse};

    struct Fixture {
        sol: Arc<Solitaire>,
        faults: Arc<Mutex<Vec<DeckError>>>,
    }

    fn fixture(config: Config) -> Fixture {
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        let sol = Solitaire::new(&config, Bus::new(64), "test".into(), CancellationToken::new(), move |e| {
            sink.lock().unwrap().push(e)
        });
        Fixture {
            sol: Arc::new(sol),
            faults,
        }
    }

    fn config() -> Config {
        Config {
            request_timeout: Duration::from_secs(30),
            roll_pending_time: Duration::from_millis(100),
            ..Config::default()
        }
    }

    fn call(sol: &Solitaire, arg: u64) -> tokio::sync::oneshot::Receiver<CallResult> {
        let (call, rx) = ActionCall::reply(Action::Test { arg: json!(arg) }, Vec::new(), None);
        sol.call(Arc::new(call));
        rx
    }

    fn connect(
        sol: &Arc<Solitaire>,
        body: &'static str,
    ) -> (
        tokio::task::JoinHandle<Result<(), ConnectError>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (sink, rx) = ChannelSink::new();
        let sol = sol.clone();
        let handle = tokio::spawn(async move { sol.connect(body.as_bytes(), sink).await });
        (handle, rx)
    }

    /// Reads chunks until `n` units arrived.
    async fn units(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, n: usize) -> Vec<Unit> {
        let mut buf = Vec::new();
        loop {
            let units = parse(&buf);
            if units.len() >= n {
                return units;
            }
            let chunk = tokio::time::timeout(Duration::from_secs(60), rx.recv())
                .await
                .expect("timed out")
                .expect("sink closed");
            buf.extend(chunk);
        }
    }

    fn arg(unit: &Unit) -> Option<u64> {
        unit.summary().2.and_then(|v| v.as_u64())
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_queue_then_rolls() {
        let f = fixture(config());
        call(&f.sol, 1);
        call(&f.sol, 2);
        let (handle, mut rx) = connect(&f.sol, "{}");
        let got = units(&mut rx, 3).await;
        assert_eq!(arg(&got[0]), Some(1));
        assert_eq!(arg(&got[1]), Some(2));
        assert_eq!(got[2], Unit::Signal(0));

        call(&f.sol, 3);
        let got = units(&mut rx, 1).await;
        assert_eq!(arg(&got[0]), Some(3));

        f.sol.end(EndCause::Killed);
        assert_eq!(units(&mut rx, 1).await, vec![Unit::Signal(2)]);
        handle.await.unwrap().unwrap();
        assert!(f.faults.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_rolls_at_deadline() {
        let f = fixture(config());
        let (handle, mut rx) = connect(&f.sol, "{}");
        assert_eq!(units(&mut rx, 1).await, vec![Unit::Signal(0)]);
        f.sol.end(EndCause::Suspend);
        assert_eq!(units(&mut rx, 1).await, vec![Unit::Signal(1)]);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_calls_get_touched() {
        let f = fixture(config());
        let mut first = call(&f.sol, 1);
        let (old, mut rx) = connect(&f.sol, "{}");
        let got = units(&mut rx, 2).await;
        assert_eq!(arg(&got[0]), Some(1));
        assert_eq!(got[1], Unit::Signal(0));

        // The browser reconnects without having seen a result yet.
        let (new, mut rx) = connect(&f.sol, "{}");
        old.await.unwrap().unwrap();
        let got = units(&mut rx, 2).await;
        match &got[0] {
            Unit::Call { start, end, name, .. } => {
                assert_eq!((*start, *end, name.as_str()), (2, 2, "touch"));
            }
            other => panic!("expected touch, got {other:?}"),
        }
        assert_eq!(got[1], Unit::Signal(0));
        assert!(first.try_recv().is_err());

        let (_, _rx) = connect(&f.sol, r#"{"results":{"1":[7,null],"2":null}}"#);
        new.await.unwrap().unwrap();
        assert_eq!(first.await.unwrap(), Ok(Some(json!(7))));
        assert_eq!(f.sol.deck().pending_count(), 0);
        f.sol.end(EndCause::Killed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_limit_closes() {
        let f = fixture(Config {
            pending: 1,
            ..config()
        });
        call(&f.sol, 1);
        call(&f.sol, 2);
        let (handle, mut rx) = connect(&f.sol, "{}");
        let got = units(&mut rx, 2).await;
        assert_eq!(arg(&got[0]), Some(1));
        assert_eq!(got[1], Unit::Signal(0));
        handle.await.unwrap().unwrap();
        assert_eq!(f.sol.deck().queue_len(), 1);
    }

    #[tokio::test]
    async fn test_bad_reports() {
        let f = fixture(config());
        let (sink, _rx) = ChannelSink::new();
        let res = f.sol.connect(b"nope", sink).await;
        assert!(matches!(res, Err(ConnectError::BadRequest(_))));
        assert!(f.faults.lock().unwrap().is_empty());

        let (sink, _rx) = ChannelSink::new();
        let res = f.sol.connect(br#"{"results":{"9":null}}"#, sink).await;
        assert!(matches!(
            res,
            Err(ConnectError::Sync(DeckError::ResultOverflow { seq: 9, last: 0 }))
        ));
        assert_eq!(f.faults.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_queue_limit_reports_fault() {
        let f = fixture(Config {
            queue: 1,
            ..config()
        });
        call(&f.sol, 1);
        let mut second = call(&f.sol, 2);
        assert_eq!(
            f.faults.lock().unwrap().as_slice(),
            &[DeckError::QueueLimit { limit: 1 }]
        );
        f.sol.end(EndCause::SyncError);
        assert_eq!(second.try_recv().unwrap(), Err(CallError::InstanceEnded));

        let mut late = call(&f.sol, 3);
        assert_eq!(late.try_recv().unwrap(), Err(CallError::InstanceEnded));
        let (sink, _rx) = ChannelSink::new();
        assert!(matches!(f.sol.connect(b"{}", sink).await, Err(ConnectError::Gone)));
    }

    #[test]
    fn test_channel_sink() {
        let (mut sink, mut rx) = ChannelSink::new();
        io::Write::write_all(&mut sink, b"ab").unwrap();
        io::Write::write_all(&mut sink, b"c").unwrap();
        io::Write::flush(&mut sink).unwrap();
        io::Write::flush(&mut sink).unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"abc".to_vec());
        assert!(rx.try_recv().is_err());
        drop(rx);
        assert!(io::Write::write_all(&mut sink, b"d").is_err());
    }
}
