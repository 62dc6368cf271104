use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::segment::{wrapping_lt, Flags};
use crate::config::{TCP_DEFAULT_RTO, TCP_RETRANSMIT_DEADLINE};

/// A queued, unacknowledged segment.
#[derive(Debug, Clone)]
pub struct Entry {
    pub first: Instant,
    pub last: Instant,
    pub rto: Duration,
    pub seq: u32,
    pub flags: Flags,
    pub data: Vec<u8>,
}

/// Outcome of walking one entry with [`RetransmitQueue::emit`]: whether the
/// connection should be abandoned (12s deadline) and whether a segment was
/// re-emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Deadline,
    Resent,
    Waiting,
}

/// Per-PCB FIFO of unacknowledged segments. Segments that consume no
/// sequence space (pure ACKs, RSTs) are never queued.
#[derive(Debug, Clone, Default)]
pub struct RetransmitQueue {
    entries: VecDeque<Entry>,
}

impl RetransmitQueue {
    pub fn new() -> Self {
        RetransmitQueue::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Append a copy of a segment that consumes sequence space. `seq` is
    /// the segment's starting sequence number.
    pub fn add(&mut self, now: Instant, seq: u32, flags: Flags, data: &[u8]) {
        self.entries.push_back(Entry {
            first: now,
            last: now,
            rto: TCP_DEFAULT_RTO,
            seq,
            flags,
            data: data.to_vec(),
        });
    }

    /// Pop consecutive head entries fully covered by `snd.una`'s advance:
    /// every entry whose `seq < snd.una` has been fully acknowledged.
    pub fn cleanup(&mut self, snd_una: u32) {
        while let Some(front) = self.entries.front() {
            if wrapping_lt(front.seq, snd_una) {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Apply the per-entry retransmit-timer logic to the entry at `index`,
    /// returning the outcome and, on `Resent`, the segment to re-emit (the
    /// caller fills in the *current* `rcv.nxt` and `rcv.wnd` before
    /// sending, so piggy-backed ACKs stay fresh).
    fn emit_one(&mut self, now: Instant, index: usize) -> (EmitOutcome, Option<Entry>) {
        let entry = &mut self.entries[index];

        if now.duration_since(entry.first) >= TCP_RETRANSMIT_DEADLINE {
            return (EmitOutcome::Deadline, None);
        }

        if now > entry.last + entry.rto {
            entry.last = now;
            entry.rto *= 2;
            return (EmitOutcome::Resent, Some(entry.clone()));
        }

        (EmitOutcome::Waiting, None)
    }

    /// Walk every queued entry, returning the due segments to re-emit and
    /// whether any entry hit the retransmit deadline. Called by the
    /// periodic retransmit timer and by error paths that must flush
    /// pending sends before tearing a connection down.
    pub fn emit_all(&mut self, now: Instant) -> (Vec<Entry>, bool) {
        let mut resend = Vec::new();
        let mut deadline_hit = false;

        for index in 0..self.entries.len() {
            match self.emit_one(now, index) {
                (EmitOutcome::Deadline, _) => {
                    deadline_hit = true;
                    break;
                }
                (EmitOutcome::Resent, Some(entry)) => resend.push(entry),
                _ => {}
            }
        }

        (resend, deadline_hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_drops_fully_acked_entries() {
        let mut q = RetransmitQueue::new();
        let now = Instant::now();
        q.add(now, 10, Flags::ACK, b"abcd");
        q.add(now, 14, Flags::ACK, b"ef");

        q.cleanup(14);
        assert_eq!(q.iter().count(), 1);
        assert_eq!(q.iter().next().unwrap().seq, 14);

        q.cleanup(16);
        assert!(q.is_empty());
    }

    #[test]
    fn rto_doubles_on_each_resend() {
        let mut q = RetransmitQueue::new();
        let t0 = Instant::now();
        q.add(t0, 1, Flags::ACK, b"x");

        let (resent, deadline) = q.emit_all(t0 + Duration::from_millis(250));
        assert!(!deadline);
        assert_eq!(resent.len(), 1);
        assert_eq!(q.entries[0].rto, TCP_DEFAULT_RTO * 2);

        // Not due yet at 2x the original RTO window.
        let (resent, _) = q.emit_all(t0 + Duration::from_millis(300));
        assert!(resent.is_empty());

        let (resent, _) = q.emit_all(t0 + Duration::from_millis(700));
        assert_eq!(resent.len(), 1);
        assert_eq!(q.entries[0].rto, TCP_DEFAULT_RTO * 4);
    }

    #[test]
    fn retransmit_deadline_is_reported_once_hit() {
        let mut q = RetransmitQueue::new();
        let t0 = Instant::now();
        q.add(t0, 1, Flags::ACK, b"x");

        let (_, deadline) = q.emit_all(t0 + TCP_RETRANSMIT_DEADLINE);
        assert!(deadline);
    }
}
