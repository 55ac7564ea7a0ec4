//! Reliable-message delivery state, per direction.
//!
//! There are no dedicated retransmission packets and no retransmission
//! timer. A reliable message sits in the sender's window and is re-attached
//! to every outgoing packet that has room for it, until an ack for any
//! packet that carried it retires it. The receiver buffers out-of-order
//! arrivals and releases messages strictly in send order, each exactly once.

use bytes::Bytes;

use crate::{
    msg::{UserType, MAX_RELIABLE_PAYLOAD, NO_PAYLOAD},
    seq::Seq,
    seq_buf::SeqBuf,
};

/// Reliable sequence numbers that may be outstanding (sent but unacked, or
/// received but not yet drained) at once, per direction.
pub const WINDOW: usize = 256;

/// One reliable message held in a window slot.
///
/// Fixed-capacity storage: the payload lives inline so a slot never
/// allocates, and a record can be copied out wholesale when drained.
#[derive(Debug, Clone)]
pub(crate) struct ReliableRecord {
    user_type: UserType,
    len: u16,
    data: [u8; MAX_RELIABLE_PAYLOAD],
}

impl Default for ReliableRecord {
    fn default() -> Self {
        Self {
            user_type: NO_PAYLOAD,
            len: 0,
            data: [0; MAX_RELIABLE_PAYLOAD],
        }
    }
}

impl ReliableRecord {
    fn new(user_type: UserType, payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= MAX_RELIABLE_PAYLOAD);
        let mut record = Self {
            user_type,
            #[allow(clippy::cast_possible_truncation)]
            len: payload.len() as u16,
            data: [0; MAX_RELIABLE_PAYLOAD],
        };
        record.data[..payload.len()].copy_from_slice(payload);
        record
    }

    pub fn user_type(&self) -> UserType {
        self.user_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }
}

/// Sending half: the window of not-yet-acknowledged reliable messages.
#[derive(Debug, Default)]
pub(crate) struct SendWindow {
    buf: SeqBuf<ReliableRecord, WINDOW>,
    next_send: Seq,
    oldest_unacked: Seq,
}

impl SendWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a message, assigning it the next reliable sequence number.
    ///
    /// Returns [`None`] iff the window is full: the slot the next sequence
    /// maps to still holds a live message from [`WINDOW`] sequences ago.
    /// Non-fatal - the caller retries once acks have retired older messages.
    pub fn push(&mut self, user_type: UserType, payload: &[u8]) -> Option<Seq> {
        if self.buf.occupied(self.next_send) {
            return None;
        }
        let seq = self.next_send;
        self.buf.insert(seq, ReliableRecord::new(user_type, payload));
        self.next_send = seq + Seq(1);
        Some(seq)
    }

    /// Walks every live (unacked) message, oldest first.
    pub fn iter_unacked(&self) -> impl Iterator<Item = (Seq, &ReliableRecord)> + '_ {
        let start = self.oldest_unacked;
        let span = (self.next_send - start).0;
        (0..span).filter_map(move |k| {
            let seq = start + Seq(k);
            self.buf.get(seq).map(|record| (seq, record))
        })
    }

    pub fn get(&self, seq: Seq) -> Option<&ReliableRecord> {
        self.buf.get(seq)
    }

    /// Number of live (unacked) messages in the window.
    pub fn outstanding(&self) -> usize {
        self.iter_unacked().count()
    }

    /// Retires an acknowledged message and advances the oldest-unacked
    /// cursor past any now-empty slots, up to (never past) the send cursor.
    pub fn retire(&mut self, seq: Seq) {
        self.buf.remove(seq);
        while self.oldest_unacked < self.next_send && !self.buf.exists(self.oldest_unacked) {
            self.oldest_unacked += Seq(1);
        }
    }
}

/// Receiving half: buffers out-of-window-order arrivals, drains in order.
#[derive(Debug, Default)]
pub(crate) struct RecvQueue {
    buf: SeqBuf<ReliableRecord, WINDOW>,
    next_read: Seq,
}

impl RecvQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a message with this sequence should be stored.
    ///
    /// Rejects sequences outside `[next_read, next_read + WINDOW - 1]`
    /// (stale retransmits, or senders running ahead of our drain) and
    /// duplicates already buffered. Rejected entries are skipped, not
    /// errors: the wire bits were consumed either way.
    pub fn accepts(&self, seq: Seq) -> bool {
        let delta = usize::from((seq - self.next_read).0);
        delta < WINDOW && !self.buf.exists(seq)
    }

    pub fn store(&mut self, seq: Seq, user_type: UserType, payload: &[u8]) {
        debug_assert!(self.accepts(seq));
        self.buf.insert(seq, ReliableRecord::new(user_type, payload));
    }

    /// Pops the next message strictly in order.
    ///
    /// Returns [`None`] if the exact next sequence has not arrived yet - a
    /// gap means loss or reordering, and later messages wait behind it.
    pub fn pop(&mut self) -> Option<(UserType, Bytes)> {
        let record = self.buf.get(self.next_read)?;
        let out = (
            record.user_type(),
            Bytes::copy_from_slice(record.payload()),
        );
        self.buf.remove(self.next_read);
        self.next_read += Seq(1);
        Some(out)
    }
}
