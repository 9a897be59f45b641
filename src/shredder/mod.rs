//! # Shredder: cooperative lane scheduler.
//!
//! Every logical lifetime (a tracker, a screen, a propagation pass) owns a
//! [`Thread`]: a lane on which work is admitted as reads, writes or starving
//! writes. A task may join several lanes at once and only runs once all of them
//! let it in.
//!
//! ```text
//!                 ┌────────── Spawner (bounded blocking pool) ──────────┐
//!                 │                                                     │
//!   lane A: [R {t1,t2}] [W {t3}]             lane B: [W {t3}] [R {t4}]   │
//!                          └──── t3 joined A.w + B.w ──┘                 │
//!                                     runs once both frames are active ──┘
//! ```
//!
//! ## Rules
//! - Writes on one lane run in admission order, each exclusively.
//! - Reads admitted back to back share a frame and run concurrently.
//! - A starving write waits for a moment with no readers; reads admitted while it
//!   waits go ahead of it, reads admitted once it runs run beside it.
//! - A body receives `Some(thread)` (its own task thread, usable for follow-up
//!   work that must finish before the joined lanes move on) or `None` when any
//!   joined lane was killed: `None` means "clean up, do not make progress".
//! - Killing a lane cascades to the tasks of its active frame; `after` runs once
//!   everything drained.
//! - Bodies are synchronous and run on the blocking pool; a panic ends the owning
//!   instance.

mod collector;
mod spawner;
mod task;
mod thread;

pub use collector::Collector;
pub use spawner::Spawner;
pub use task::Joined;
pub use thread::Thread;

use task::JoinTask;

/// Runs `body` once every join has admitted it.
///
/// With no joins the body runs immediately, inline, with `None`.
pub fn run(
    body: impl FnOnce(Option<Thread>) + Send + 'static,
    joins: impl IntoIterator<Item = Joined>,
) {
    JoinTask::start(Box::new(body), joins.into_iter().collect());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Bus;
    use proptest::prelude::*;
    use std::time::Duration;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
    use tokio_util::sync::CancellationToken;

    fn spawner(limit: usize) -> Spawner {
        Spawner::new(Some(limit), Bus::new(16), CancellationToken::new(), None)
    }

    fn wait(ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    async fn collect<T>(rx: &mut UnboundedReceiver<T>, n: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let v = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for task")
                .expect("channel closed");
            out.push(v);
        }
        out
    }

    fn send(tx: &UnboundedSender<i32>, v: i32) -> impl FnOnce(Option<Thread>) + Send + 'static {
        let tx = tx.clone();
        move |_| {
            let _ = tx.send(v);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_writes_in_order() {
        let th = spawner(10).new_thread();
        let (tx, mut rx) = unbounded_channel();
        let t = tx.clone();
        th.write(move |_| {
            wait(300);
            let _ = t.send(1);
        });
        let t = tx.clone();
        th.write(move |_| {
            wait(200);
            let _ = t.send(2);
        });
        th.write(send(&tx, 3));
        th.write(send(&tx, 4));
        assert_eq!(collect(&mut rx, 4).await, vec![1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reads_share_frame() {
        let th = spawner(3).new_thread();
        let (tx, mut rx) = unbounded_channel();
        let t = tx.clone();
        th.read(move |_| {
            wait(100);
            let _ = t.send(3);
        });
        let t = tx.clone();
        th.read(move |_| {
            wait(50);
            let _ = t.send(2);
        });
        th.read(send(&tx, 1));
        let t = tx.clone();
        th.write(move |_| {
            wait(50);
            let _ = t.send(4);
        });
        let t = tx.clone();
        th.read(move |_| {
            wait(50);
            let _ = t.send(6);
        });
        th.read(send(&tx, 5));
        th.write(send(&tx, 7));
        assert_eq!(collect(&mut rx, 7).await, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_internal_threads() {
        let th = spawner(10).new_thread();
        let (tx, mut rx) = unbounded_channel();
        let t = tx.clone();
        th.write(move |x| {
            wait(200);
            let x = x.unwrap();
            let inner = t.clone();
            x.write(move |y| {
                let y = y.unwrap();
                let slow = inner.clone();
                y.read(move |_| {
                    wait(50);
                    let _ = slow.send(2);
                });
                y.read(send(&inner, 1));
                y.write(send(&inner, 3));
            });
            x.write(send(&t, 4));
        });
        th.read(send(&tx, 5));
        th.write(send(&tx, 6));
        th.write(send(&tx, 7));
        assert_eq!(collect(&mut rx, 7).await, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_starving_write_waits_for_readers() {
        let th = spawner(10).new_thread();
        let (tx, mut rx) = unbounded_channel();
        let t = tx.clone();
        th.read(move |_| {
            let _ = t.send(1);
            wait(100);
        });
        th.write_starving(send(&tx, 3));
        let t = tx.clone();
        th.read(move |_| {
            wait(50);
            let _ = t.send(2);
        });
        th.write_starving(send(&tx, 4));
        th.write(send(&tx, 5));
        th.read(send(&tx, 6));
        th.write(send(&tx, 7));
        assert_eq!(collect(&mut rx, 7).await, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_joins_started_starving_write() {
        let th = spawner(10).new_thread();
        let (tx, mut rx) = unbounded_channel();
        let t = tx.clone();
        th.read(move |_| {
            wait(100);
            let _ = t.send(1);
        });
        let t = tx.clone();
        th.write_starving(move |_| {
            wait(200);
            let _ = t.send(2);
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        th.read(send(&tx, 3));
        th.write(send(&tx, 4));
        assert_eq!(collect(&mut rx, 4).await, vec![1, 3, 2, 4]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_starving_write_on_idle_lane_overlaps_reads() {
        let th = spawner(10).new_thread();
        let (tx, mut rx) = unbounded_channel();
        let t = tx.clone();
        th.write_starving(move |_| {
            wait(150);
            let _ = t.send(2);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let t = tx.clone();
        th.read(move |t2| {
            let _ = t.send(if t2.is_some() { 1 } else { -1 });
        });
        assert_eq!(collect(&mut rx, 2).await, vec![1, 2]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dropped_lane_runs_queued_work() {
        let s = spawner(10);
        let (tx, mut rx) = unbounded_channel();
        {
            let th = s.new_thread();
            let t = tx.clone();
            th.write(move |_| {
                wait(100);
                let _ = t.send(1);
            });
            let t = tx.clone();
            th.write(move |t2| {
                let _ = t.send(if t2.is_some() { 2 } else { -2 });
            });
        }
        assert_eq!(collect(&mut rx, 2).await, vec![1, 2]);
    }

    fn join_scenario(instant: bool) -> (Vec<Thread>, UnboundedReceiver<i32>) {
        let s = spawner(10);
        let (t1, t2, t3) = (s.new_thread(), s.new_thread(), s.new_thread());
        let (tx, rx) = unbounded_channel();
        let t = tx.clone();
        t3.write(move |_| {
            wait(50);
            let _ = t.send(2);
        });
        let t = tx.clone();
        t3.read(move |_| {
            wait(200);
            let _ = t.send(6);
        });
        let t = tx.clone();
        t1.write(move |_| {
            wait(100);
            let _ = t.send(3);
        });
        t2.read(send(&tx, 1));

        let t = tx.clone();
        let r3 = t3.clone();
        let second = |j: Joined| if instant { j.instant() } else { j };
        run(
            move |x| {
                let _ = t.send(4);
                let x = x.unwrap();
                let r3 = if instant { r3.r().instant() } else { r3.r() };
                run(send(&t, 5), [x.w(), r3]);
            },
            [t2.w(), second(t1.w())],
        );
        run(send(&tx, 7), [t2.w(), t3.w()]);
        (vec![t1, t2, t3], rx)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_join() {
        let (_threads, mut rx) = join_scenario(false);
        assert_eq!(collect(&mut rx, 7).await, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_join_instant() {
        let (_threads, mut rx) = join_scenario(true);
        assert_eq!(collect(&mut rx, 7).await, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_kill_cascades_to_nested_tasks() {
        let s = spawner(10);
        let (t1, t2) = (s.new_thread(), s.new_thread());
        let (ch, mut ch_rx) = unbounded_channel::<bool>();
        let (order, mut order_rx) = unbounded_channel::<i32>();

        t2.write(|_| wait(100));

        let killer = t1.clone();
        let o = order.clone();
        t1.read(move |_| {
            wait(50);
            let after = o.clone();
            killer.kill_then(move || {
                let _ = after.send(3);
            });
            wait(20);
            let _ = o.send(1);
        });

        let w2 = t2.clone();
        let o = order.clone();
        t1.read(move |b| {
            let b = b.unwrap();
            let c = ch.clone();
            run(
                move |t| {
                    let _ = c.send(t.is_none());
                },
                [b.r(), w2.w()],
            );
            b.read(move |d| {
                wait(150);
                let _ = o.send(2);
                let d = d.unwrap();
                d.write(move |t| {
                    let _ = ch.send(t.is_none());
                });
            });
        });

        assert_eq!(collect(&mut ch_rx, 2).await, vec![true, true]);
        assert_eq!(collect(&mut order_rx, 3).await, vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_join_with_killed_thread() {
        let s = spawner(10);
        let (t1, t2, t3) = (s.new_thread(), s.new_thread(), s.new_thread());
        assert!(t2.kill());
        assert!(!t2.kill());
        let (tx, mut rx) = unbounded_channel();
        run(
            move |t| {
                let _ = tx.send(t.is_none());
            },
            [t1.w(), t2.w(), t3.w()],
        );
        assert_eq!(collect(&mut rx, 1).await, vec![true]);
        let (tx, mut rx) = unbounded_channel();
        t1.write(move |t| {
            let _ = tx.send(t.is_some());
        });
        assert_eq!(collect(&mut rx, 1).await, vec![true]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_kill_while_queued() {
        let s = spawner(10);
        let (t1, t2) = (s.new_thread(), s.new_thread());
        let killer = t2.clone();
        t2.write(move |_| {
            wait(50);
            killer.kill();
        });
        let t3 = s.new_thread();
        let (tx, mut rx) = unbounded_channel();
        run(
            move |t| {
                let _ = tx.send(t.is_none());
            },
            [t1.w(), t2.w(), t3.w()],
        );
        assert_eq!(collect(&mut rx, 1).await, vec![true]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_kill_idle_runs_after_immediately() {
        let th = spawner(2).new_thread();
        let (tx, mut rx) = unbounded_channel();
        assert!(th.kill_then(move || {
            let _ = tx.send(());
        }));
        assert!(th.is_killed());
        collect(&mut rx, 1).await;

        let (tx, mut rx) = unbounded_channel();
        th.write(move |t| {
            let _ = tx.send(t.is_none());
        });
        assert_eq!(collect(&mut rx, 1).await, vec![true]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_queued_bodies_clean_up_after_kill() {
        let th = spawner(4).new_thread();
        let (tx, mut rx) = unbounded_channel();
        let t = tx.clone();
        th.write(move |_| {
            wait(50);
            let _ = t.send(Some(0));
        });
        for i in 1..4 {
            let t = tx.clone();
            th.write(move |x| {
                let _ = t.send(x.map(|_| i));
            });
        }
        let (done_tx, mut done_rx) = unbounded_channel();
        th.kill_then(move || {
            let _ = done_tx.send(());
        });
        assert_eq!(collect(&mut rx, 4).await, vec![Some(0), None, None, None]);
        collect(&mut done_rx, 1).await;
    }

    #[test]
    fn test_run_without_joins() {
        let (tx, mut rx) = unbounded_channel();
        run(
            move |t| {
                let _ = tx.send(t.is_none());
            },
            [],
        );
        assert_eq!(rx.try_recv().ok(), Some(true));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn prop_writes_run_in_admission_order(n in 1usize..40, limit in 1usize..6) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .unwrap();
            let got = rt.block_on(async move {
                let th = spawner(limit).new_thread();
                let (tx, mut rx) = unbounded_channel();
                for i in 0..n {
                    let tx = tx.clone();
                    th.write(move |_| {
                        let _ = tx.send(i);
                    });
                }
                collect(&mut rx, n).await
            });
            prop_assert_eq!(got, (0..n).collect::<Vec<_>>());
        }
    }
}
