//! Building blocks of a duplex byte-stream.
//!
//! - [`ReadBuffer`]: inbound chunks with a high-water mark. It reports the
//!   moment it becomes saturated (ask the peer to pause) and the moment a
//!   read drains it back below the mark (let the peer resume).
//! - [`WriteGate`]: the single-bit write credit granted by the peer, plus
//!   the write completions held back while the credit is revoked.
//! - [`WriteState`]: the write side's lifecycle.
//!
//! These types are plain state; the stream wraps them in its lock and does
//! the I/O.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::StreamError;

/// Completion slot of a write waiting for credit.
pub(crate) type WriteCompletion = oneshot::Sender<Result<(), StreamError>>;

/// Result of appending to a [`ReadBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pushed {
    /// Stored; the buffer still has room (or the peer is already paused).
    Buffered,
    /// Stored, and the buffer just reached the high-water mark.
    Saturated,
    /// Dropped: the peer already ended its side.
    AfterEnd,
}

/// Result of reading from a [`ReadBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Pulled {
    /// Next chunk. `resume` is set when this read drained a saturated
    /// buffer below the high-water mark.
    Chunk {
        /// Payload bytes.
        data: Bytes,
        /// Whether the peer should be told to resume.
        resume: bool,
    },
    /// End of data; every chunk has been read.
    Eof,
    /// Nothing buffered yet.
    Empty,
}

/// Inbound byte buffer with high-water-mark tracking.
#[derive(Debug)]
pub(crate) struct ReadBuffer {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    high_water_mark: usize,
    ended: bool,
    drained: bool,
    discarded: bool,
    peer_paused: bool,
}

impl ReadBuffer {
    pub(crate) fn new(high_water_mark: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            buffered: 0,
            high_water_mark: high_water_mark.max(1),
            ended: false,
            drained: false,
            discarded: false,
            peer_paused: false,
        }
    }

    /// Append a chunk received from the peer.
    pub(crate) fn push(&mut self, data: Bytes) -> Pushed {
        if self.ended {
            return Pushed::AfterEnd;
        }
        if !data.is_empty() {
            self.buffered += data.len();
            self.chunks.push_back(data);
        }
        if self.buffered >= self.high_water_mark && !self.peer_paused {
            self.peer_paused = true;
            return Pushed::Saturated;
        }
        Pushed::Buffered
    }

    /// Take the next chunk, or report end-of-data once everything is read.
    pub(crate) fn pull(&mut self) -> Pulled {
        if let Some(data) = self.chunks.pop_front() {
            self.buffered -= data.len();
            let resume = self.peer_paused && self.buffered < self.high_water_mark;
            if resume {
                self.peer_paused = false;
            }
            return Pulled::Chunk { data, resume };
        }
        if self.ended {
            self.drained = true;
            return Pulled::Eof;
        }
        Pulled::Empty
    }

    /// The peer will send no more data.
    pub(crate) fn end(&mut self) {
        self.ended = true;
    }

    /// True once the peer ended its side.
    pub(crate) fn is_ended(&self) -> bool {
        self.ended
    }

    /// True once the consumer has read past the end.
    pub(crate) fn is_drained(&self) -> bool {
        self.drained
    }

    /// Discard everything buffered. Unread data is lost for good, so the
    /// buffer no longer reports a clean end-of-data.
    pub(crate) fn clear(&mut self) {
        self.chunks.clear();
        self.buffered = 0;
        self.discarded = true;
    }

    /// True once [`ReadBuffer::clear`] threw data away.
    pub(crate) fn is_discarded(&self) -> bool {
        self.discarded
    }

    /// Bytes currently buffered.
    pub(crate) fn buffered(&self) -> usize {
        self.buffered
    }
}

/// Write credit granted by the peer, with the completions it holds back.
#[derive(Debug)]
pub(crate) struct WriteGate {
    allowed: bool,
    pending: VecDeque<WriteCompletion>,
}

impl Default for WriteGate {
    fn default() -> Self {
        Self {
            allowed: true,
            pending: VecDeque::new(),
        }
    }
}

impl WriteGate {
    /// Whether a finished send may complete its write right away.
    pub(crate) fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Apply a credit change. Granting returns the held completions in
    /// submission order; the caller fires them outside its lock.
    pub(crate) fn set_allowed(&mut self, allowed: bool) -> Vec<WriteCompletion> {
        self.allowed = allowed;
        if allowed {
            self.pending.drain(..).collect()
        } else {
            Vec::new()
        }
    }

    /// Hold a completion until credit is granted.
    pub(crate) fn hold(&mut self, completion: WriteCompletion) {
        self.pending.push_back(completion);
    }

    /// Take every held completion (used on destroy).
    pub(crate) fn take_pending(&mut self) -> Vec<WriteCompletion> {
        self.pending.drain(..).collect()
    }

    /// Number of writes waiting for credit.
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Lifecycle of the write side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum WriteState {
    /// Accepting writes.
    #[default]
    Open,
    /// `finish()` called; the End frame is in flight.
    Ending,
    /// End frame sent.
    Finished,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturation_reported_once() {
        let mut buf = ReadBuffer::new(4);
        assert_eq!(buf.push(Bytes::from_static(b"ab")), Pushed::Buffered);
        assert_eq!(buf.push(Bytes::from_static(b"cd")), Pushed::Saturated);
        assert_eq!(buf.push(Bytes::from_static(b"ef")), Pushed::Buffered);
        assert_eq!(buf.buffered(), 6);
    }

    #[test]
    fn test_resume_reported_when_drained_below_mark() {
        let mut buf = ReadBuffer::new(4);
        buf.push(Bytes::from_static(b"abc"));
        buf.push(Bytes::from_static(b"de"));

        // 5 -> 2 buffered: below the mark, peer may resume
        assert_eq!(
            buf.pull(),
            Pulled::Chunk { data: Bytes::from_static(b"abc"), resume: true }
        );
        assert_eq!(
            buf.pull(),
            Pulled::Chunk { data: Bytes::from_static(b"de"), resume: false }
        );
        assert_eq!(buf.pull(), Pulled::Empty);
    }

    #[test]
    fn test_resume_waits_until_below_mark() {
        let mut buf = ReadBuffer::new(4);
        for chunk in ["ab", "cd", "ef", "gh"] {
            buf.push(Bytes::copy_from_slice(chunk.as_bytes()));
        }
        // 8 -> 6 -> 4: still at the mark
        assert!(matches!(buf.pull(), Pulled::Chunk { resume: false, .. }));
        assert!(matches!(buf.pull(), Pulled::Chunk { resume: false, .. }));
        // 4 -> 2
        assert!(matches!(buf.pull(), Pulled::Chunk { resume: true, .. }));
    }

    #[test]
    fn test_eof_after_buffered_data() {
        let mut buf = ReadBuffer::new(16);
        buf.push(Bytes::from_static(b"hello"));
        buf.end();
        assert_eq!(buf.push(Bytes::from_static(b"late")), Pushed::AfterEnd);
        assert!(!buf.is_drained());

        assert!(matches!(buf.pull(), Pulled::Chunk { .. }));
        assert_eq!(buf.pull(), Pulled::Eof);
        assert!(buf.is_drained());
        assert_eq!(buf.pull(), Pulled::Eof);
    }

    #[test]
    fn test_empty_chunks_not_buffered() {
        let mut buf = ReadBuffer::new(16);
        assert_eq!(buf.push(Bytes::new()), Pushed::Buffered);
        assert_eq!(buf.pull(), Pulled::Empty);
    }

    #[test]
    fn test_clear() {
        let mut buf = ReadBuffer::new(2);
        buf.push(Bytes::from_static(b"abcd"));
        assert!(!buf.is_discarded());
        buf.clear();
        assert_eq!(buf.buffered(), 0);
        assert!(buf.is_discarded());
        assert_eq!(buf.pull(), Pulled::Empty);
    }

    #[tokio::test]
    async fn test_gate_releases_in_submission_order() {
        let mut gate = WriteGate::default();
        assert!(gate.is_allowed());
        assert!(gate.set_allowed(false).is_empty());
        assert!(!gate.is_allowed());

        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            gate.hold(tx);
            receivers.push(rx);
        }
        assert_eq!(gate.pending_len(), 3);

        let released = gate.set_allowed(true);
        assert_eq!(released.len(), 3);
        assert_eq!(gate.pending_len(), 0);
        for (i, tx) in released.into_iter().enumerate() {
            tx.send(if i == 1 { Err(StreamError::Destroyed) } else { Ok(()) }).unwrap();
        }
        assert_eq!(receivers.remove(0).await.unwrap(), Ok(()));
        assert_eq!(receivers.remove(0).await.unwrap(), Err(StreamError::Destroyed));
        assert_eq!(receivers.remove(0).await.unwrap(), Ok(()));
    }

    #[test]
    fn test_take_pending_empties_gate() {
        let mut gate = WriteGate::default();
        gate.set_allowed(false);
        let (tx, _rx) = oneshot::channel();
        gate.hold(tx);
        assert_eq!(gate.take_pending().len(), 1);
        assert_eq!(gate.pending_len(), 0);
        assert!(!gate.is_allowed());
    }
}
