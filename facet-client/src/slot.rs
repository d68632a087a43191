//! Request slot table and sequence-number space.
//!
//! A connection owns a fixed ring of [`QUEUE_SIZE`] slots. A sequence
//! number maps to the slot at `seq % QUEUE_SIZE`; successive occupants of a
//! slot use stamps `QUEUE_SIZE` apart, wrapping below [`MAX_SEQ`], so a late
//! reply for a previous occupant can never match the current stamp. A stamp
//! of `MAX_SEQ` marks the slot idle.

use crate::buffer::ReplyBuffer;
use crate::error::Error;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::mpsc;

pub(crate) const QUEUE_SIZE: usize = 512;
pub(crate) const MAX_SEQ: u32 = QUEUE_SIZE as u32 * 1_000_000;

/// Callback invoked exactly once with the outcome of an asynchronous call.
pub type Completion = Box<dyn FnOnce(Result<ReplyBuffer, Error>) + Send + 'static>;

pub(crate) fn seq_is_valid(seq: u32) -> bool {
    seq < MAX_SEQ
}

/// Next stamp for the slot `seq` occupies.
pub(crate) fn next_seq(seq: u32) -> u32 {
    let next = seq + QUEUE_SIZE as u32;
    if next < MAX_SEQ {
        next
    } else {
        next - MAX_SEQ
    }
}

pub(crate) fn slot_index(seq: u32) -> usize {
    seq as usize % QUEUE_SIZE
}

/// A reply routed to a synchronous waiter.
pub(crate) struct ReplyEnvelope {
    pub seq: u32,
    pub buf: ReplyBuffer,
}

/// Per-slot request state.
///
/// The stamp, deadline and async flag are atomics; `completion` and every
/// transition that may race with its delivery are guarded by the slot-local
/// mutex. Claim methods take that lock, re-check the relevant condition and
/// clear the completion atomically with stamping the slot idle, which is
/// what guarantees exactly-once delivery between the read loop, the
/// deadline ticker and the error fan-out.
pub(crate) struct RequestSlot {
    /// Current stamp, `MAX_SEQ` when idle.
    pub seq: AtomicU32,
    /// Coarse-clock absolute deadline in seconds, 0 for none.
    pub deadline: AtomicU32,
    pub is_async: AtomicBool,
    completion: Mutex<Option<Completion>>,
    pub reply_tx: mpsc::UnboundedSender<ReplyEnvelope>,
    pub reply_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReplyEnvelope>>,
}

impl RequestSlot {
    pub fn new() -> Self {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        Self {
            seq: AtomicU32::new(MAX_SEQ),
            deadline: AtomicU32::new(0),
            is_async: AtomicBool::new(false),
            completion: Mutex::new(None),
            reply_tx,
            reply_rx: tokio::sync::Mutex::new(reply_rx),
        }
    }

    /// Occupies the slot for an asynchronous call.
    pub fn arm_async(&self, seq: u32, deadline: u32, completion: Completion) {
        let mut cmpl = self.completion.lock();
        *cmpl = Some(completion);
        self.deadline.store(deadline, Ordering::Release);
        self.is_async.store(true, Ordering::Release);
        self.seq.store(seq, Ordering::Release);
    }

    /// Claims the completion for an arriving reply, provided the slot is
    /// still stamped with `rseq`.
    pub fn claim_reply(&self, rseq: u32) -> Option<Completion> {
        let mut cmpl = self.completion.lock();
        if cmpl.is_none() || self.seq.load(Ordering::Acquire) != rseq {
            return None;
        }
        self.seq.store(MAX_SEQ, Ordering::Release);
        self.is_async.store(false, Ordering::Release);
        cmpl.take()
    }

    /// Claims the completion for an expired deadline. The compare-exchange
    /// on the deadline is the guard: it fails if the slot was re-armed for
    /// a new request since the ticker observed `observed_deadline`.
    pub fn claim_expired(&self, observed_deadline: u32) -> Option<(Completion, u32)> {
        let mut cmpl = self.completion.lock();
        if cmpl.is_none() {
            return None;
        }
        if self
            .deadline
            .compare_exchange(observed_deadline, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let completion = cmpl.take()?;
        let seq = self.seq.swap(MAX_SEQ, Ordering::AcqRel);
        self.is_async.store(false, Ordering::Release);
        Some((completion, seq))
    }

    /// Claims the completion unconditionally (error fan-out).
    pub fn claim_any(&self) -> Option<(Completion, u32)> {
        let mut cmpl = self.completion.lock();
        let completion = cmpl.take()?;
        let seq = self.seq.swap(MAX_SEQ, Ordering::AcqRel);
        self.is_async.store(false, Ordering::Release);
        Some((completion, seq))
    }
}
