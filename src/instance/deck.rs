//! # Deck: the ordered, gap-tolerant outbox.
//!
//! Every call gets the next sequence number and a card. Writing cuts cards from
//! the top; written calls move to the issued map until the browser reports a
//! result. Sequence numbers that will never carry a call (cancelled calls,
//! ranges the browser lost but that must not be resent) become filler, so the
//! peer can account for every number without one unit per number.
//!
//! ```text
//! insert ──► cards: [1][2..4 filler][5][7] ──write_next──► issued {…}
//!                ▲                                            │
//!                └─────── restore (gap, retry allowed) ◄──────┤
//!                                      results ──► on_result ◄┘
//! ```
//!
//! ## Rules
//! - Cards are sorted by range and never overlap; a filler adjacent to the next
//!   card is merged into it, the call then covers the skipped numbers.
//! - Only real cards count towards the queue size.
//! - At the pending limit nothing is written until a report frees a slot.
//! - Results are applied before gaps. Gaps must be increasing, disjoint, start
//!   after every reported result and end before the last assigned number.
//! - Dropped calls are resolved with [`CallError::Cancelled`], outside the lock.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{CallError, DeckError};

use super::report::Report;
use super::{Call, CallResult, wire};

/// Outcome of [`Deck::write_next`].
#[derive(Debug)]
pub(crate) enum WriteOutcome {
    /// The deck is empty.
    Nothing,
    /// Too many calls await a report.
    PendingLimit,
    /// One unit was written.
    Written,
    /// The writer failed; the card is back on the deck or dropped.
    Failed(io::Error),
    /// The deck contradicts itself; the instance must end.
    Sync(DeckError),
}

struct Card {
    start: u64,
    end: u64,
    call: Option<Arc<dyn Call>>,
    /// Issued once and put back by a report.
    restored: bool,
}

impl Card {
    fn new(seq: u64, call: Arc<dyn Call>, restored: bool) -> Self {
        Self {
            start: seq,
            end: seq,
            call: Some(call),
            restored,
        }
    }

    fn filler(seq: u64) -> Self {
        Self {
            start: seq,
            end: seq,
            call: None,
            restored: false,
        }
    }

    fn is_filler(&self) -> bool {
        self.call.is_none()
    }
}

type Resolved = Vec<(Arc<dyn Call>, CallResult)>;

#[derive(Default)]
struct DeckState {
    seq: u64,
    cards: VecDeque<Card>,
    issued: HashMap<u64, Arc<dyn Call>>,
    size: usize,
    latest_report: u64,
}

/// Ordered outbox of one instance.
pub struct Deck {
    queue: usize,
    pending: usize,
    state: Mutex<DeckState>,
}

impl Deck {
    /// Creates a deck holding at most `queue` queued calls and `pending` issued ones.
    pub fn new(queue: usize, pending: usize) -> Self {
        Self {
            queue,
            pending: pending.max(1),
            state: Mutex::new(DeckState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeckState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of queued real cards.
    pub fn queue_len(&self) -> usize {
        self.lock().size
    }

    /// Number of issued calls awaiting a result.
    pub fn pending_count(&self) -> usize {
        self.lock().issued.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.lock().issued.is_empty()
    }

    /// Queues `call` and returns its sequence number.
    ///
    /// Past the queue limit the call is still queued and
    /// [`DeckError::QueueLimit`] is returned; the owner is expected to end.
    pub fn insert(&self, call: Arc<dyn Call>) -> Result<u64, DeckError> {
        let mut st = self.lock();
        st.seq += 1;
        let seq = st.seq;
        st.cards.push_back(Card::new(seq, call, false));
        st.size += 1;
        if st.size > self.queue {
            return Err(DeckError::QueueLimit { limit: self.queue });
        }
        Ok(seq)
    }

    /// Writes the next unit to `w`.
    ///
    /// Calls whose `data()` is gone are skipped and the next card is tried.
    pub(crate) fn write_next(&self, w: &mut impl io::Write) -> WriteOutcome {
        loop {
            let card = {
                let mut st = self.lock();
                if st.issued.len() >= self.pending {
                    return WriteOutcome::PendingLimit;
                }
                match st.cut_top() {
                    Some(card) => card,
                    None => return WriteOutcome::Nothing,
                }
            };
            let Some(call) = card.call.clone() else {
                if let Err(e) = w.write_all(&wire::filler(card.start, card.end)) {
                    self.lock().skip_range(card.start, card.end);
                    return WriteOutcome::Failed(e);
                }
                return WriteOutcome::Written;
            };
            let Some(data) = call.data() else {
                self.lock().skip_range(card.start, card.end);
                call.on_result(Err(CallError::Cancelled));
                continue;
            };
            if let Err(e) = w.write_all(&wire::call(card.start, card.end, &data)) {
                let retry = call.on_write_err();
                let mut st = self.lock();
                if !retry {
                    st.skip_range(card.start, card.end);
                    drop(st);
                    call.on_result(Err(CallError::Cancelled));
                    return WriteOutcome::Failed(e);
                }
                return match st.put_back(card) {
                    Ok(()) => WriteOutcome::Failed(e),
                    Err(err) => WriteOutcome::Sync(err),
                };
            }
            self.lock().issued.insert(card.end, call);
            return WriteOutcome::Written;
        }
    }

    /// Applies a delivery report.
    ///
    /// Any error means the report contradicts the deck; the connection is corrupted.
    pub fn on_report(&self, report: &Report) -> Result<(), DeckError> {
        let mut resolved = Resolved::new();
        let res = self.lock().apply(report, self.queue, &mut resolved);
        for (call, result) in resolved {
            call.on_result(result);
        }
        res
    }

    /// Removes every queued and issued call.
    pub(crate) fn drain(&self) -> Vec<Arc<dyn Call>> {
        let mut st = self.lock();
        let mut calls: Vec<_> = st.cards.drain(..).filter_map(|c| c.call).collect();
        calls.extend(st.issued.drain().map(|(_, call)| call));
        st.size = 0;
        calls
    }
}

impl DeckState {
    fn cut_top(&mut self) -> Option<Card> {
        let card = self.cards.pop_front()?;
        if !card.is_filler() {
            self.size -= 1;
        }
        Some(card)
    }

    /// Inserts a real card at its sorted position.
    fn place(&mut self, card: Card) -> Result<(), DeckError> {
        let at = self.cards.partition_point(|c| c.start <= card.end);
        if at > 0 && self.cards[at - 1].end >= card.start {
            return Err(DeckError::CardOverlap { seq: card.end });
        }
        self.cards.insert(at, card);
        Ok(())
    }

    /// Returns a card whose write failed.
    fn put_back(&mut self, card: Card) -> Result<(), DeckError> {
        self.place(card)?;
        self.size += 1;
        Ok(())
    }

    fn restore(&mut self, seq: u64, call: Arc<dyn Call>, limit: usize) -> Result<(), DeckError> {
        self.place(Card::new(seq, call, true))?;
        self.size += 1;
        if self.size > limit {
            return Err(DeckError::QueueLimit { limit });
        }
        Ok(())
    }

    /// Takes the restored card ending at `seq`, if any.
    fn extract_restored(&mut self, seq: u64) -> Result<Option<Arc<dyn Call>>, DeckError> {
        let at = self.cards.partition_point(|c| c.end < seq);
        let Some(card) = self.cards.get(at) else {
            return Ok(None);
        };
        if card.end != seq || card.is_filler() {
            return Ok(None);
        }
        if !card.restored {
            return Err(DeckError::NotIssued { seq });
        }
        let card = self.cards.remove(at);
        self.size -= 1;
        Ok(card.and_then(|c| c.call))
    }

    /// Marks `seq` as carrying nothing, merging with neighbours.
    ///
    /// A number already covered by a card is left alone.
    fn skip_seq(&mut self, seq: u64) {
        let at = self.cards.partition_point(|c| c.end < seq);
        let joins_next = match self.cards.get(at) {
            Some(card) if card.start <= seq => return,
            Some(card) => card.start == seq + 1,
            None => false,
        };
        let joins_prev = at > 0 && self.cards[at - 1].is_filler() && self.cards[at - 1].end + 1 == seq;
        match (joins_prev, joins_next) {
            (true, true) => {
                let start = self.cards[at - 1].start;
                self.cards[at].start = start;
                self.cards.remove(at - 1);
            }
            (true, false) => self.cards[at - 1].end = seq,
            (false, true) => self.cards[at].start = seq,
            (false, false) => self.cards.insert(at, Card::filler(seq)),
        }
    }

    fn skip_range(&mut self, start: u64, end: u64) {
        for seq in start..=end {
            self.skip_seq(seq);
        }
    }

    fn apply(&mut self, report: &Report, limit: usize, resolved: &mut Resolved) -> Result<(), DeckError> {
        for (&seq, result) in &report.results {
            if seq > self.seq {
                return Err(DeckError::ResultOverflow { seq, last: self.seq });
            }
            self.latest_report = self.latest_report.max(seq);
            if let Some(call) = self.issued.remove(&seq) {
                resolved.push((call, result.clone()));
                continue;
            }
            if let Some(call) = self.extract_restored(seq)? {
                resolved.push((call, result.clone()));
            }
        }
        let (Some(first), Some(last)) = (report.gaps.first(), report.gaps.last()) else {
            return Ok(());
        };
        if last.end >= self.seq {
            return Err(DeckError::GapOverflow {
                end: last.end,
                last: self.seq,
            });
        }
        if first.start <= self.latest_report {
            return Err(DeckError::GapBehindResult {
                start: first.start,
                reported: self.latest_report,
            });
        }
        let mut prev_end = self.latest_report;
        for gap in &report.gaps {
            if gap.end < gap.start {
                return Err(DeckError::GapInverted {
                    start: gap.start,
                    end: gap.end,
                });
            }
            if prev_end >= gap.start {
                return Err(DeckError::GapOverlap {
                    start: gap.start,
                    prev_end,
                });
            }
            prev_end = gap.end;
        }
        // Restore first so skipped numbers merge into the restored cards.
        let mut skipped = Vec::new();
        for gap in &report.gaps {
            for seq in gap.start..=gap.end {
                match self.issued.remove(&seq) {
                    Some(call) if call.on_write_err() => self.restore(seq, call, limit)?,
                    Some(call) => {
                        skipped.push(seq);
                        resolved.push((call, Err(CallError::Cancelled)));
                    }
                    None => skipped.push(seq),
                }
            }
        }
        for seq in skipped {
            self.skip_seq(seq);
        }
        Ok(())
    }
}
