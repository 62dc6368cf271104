use std::time::Instant;

use super::retransmit::RetransmitQueue;
use super::wait::WaitContext;
use super::Endpoint;

use crate::config::TCP_RECV_BUF_SIZE;

/// The twelve RFC 793 connection states, plus `Free` marking a reusable
/// slot: a PCB briefly exists in `Closed` after a connection tears down and
/// before its slot is reclaimed, so the two are kept distinct rather than
/// folded together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcbState {
    Free,
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

impl PcbState {
    pub fn is_synchronized(&self) -> bool {
        matches!(
            self,
            PcbState::SynReceived
                | PcbState::Established
                | PcbState::FinWait1
                | PcbState::FinWait2
                | PcbState::Closing
                | PcbState::TimeWait
                | PcbState::CloseWait
                | PcbState::LastAck
        )
    }
}

/// Why a PCB was torn down outside the ordinary four-way close, recorded so
/// a blocked `open` call can surface the precise error kind `spec.md` §7
/// names instead of a generic reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Reset,
    Refused,
    UserTimeout,
    RetransmitDeadline,
}

/// Send-side sequence variables (RFC 793 §3.3.1 fig 3).
#[derive(Debug, Clone, Copy)]
pub struct SendSequence {
    pub una: u32,
    pub nxt: u32,
    pub wnd: u16,
    pub up: u16,
    pub wl1: u32,
    pub wl2: u32,
    pub iss: u32,
}

impl Default for SendSequence {
    fn default() -> Self {
        SendSequence {
            una: 0,
            nxt: 0,
            wnd: 0,
            up: 0,
            wl1: 0,
            wl2: 0,
            iss: 0,
        }
    }
}

/// Receive-side sequence variables (RFC 793 §3.3.1 fig 4).
#[derive(Debug, Clone, Copy, Default)]
pub struct RecvSequence {
    pub nxt: u32,
    pub wnd: u16,
    pub up: u16,
    pub irs: u32,
}

/// The bounded receive buffer, implemented as a ring so the
/// `rcv.wnd == free_capacity` invariant holds without ever shifting data.
#[derive(Debug, Clone)]
pub struct RecvBuffer {
    data: Vec<u8>,
    start: usize,
    len: usize,
}

impl RecvBuffer {
    pub fn new(capacity: usize) -> Self {
        RecvBuffer {
            data: vec![0; capacity],
            start: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Append `bytes` at the tail. Caller is responsible for ensuring
    /// `bytes.len() <= self.free()`.
    pub fn push(&mut self, bytes: &[u8]) {
        let cap = self.capacity();
        let mut pos = (self.start + self.len) % cap;
        for &b in bytes {
            self.data[pos] = b;
            pos = (pos + 1) % cap;
        }
        self.len += bytes.len();
    }

    /// Copy up to `out.len()` bytes from the head into `out`, compacting
    /// the ring, and return how many bytes were copied.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        let cap = self.capacity();
        for slot in out.iter_mut().take(n) {
            *slot = self.data[self.start];
            self.start = (self.start + 1) % cap;
        }
        self.len -= n;
        n
    }

    pub fn reset(&mut self) {
        self.start = 0;
        self.len = 0;
    }
}

/// The Protocol Control Block: per-connection state.
#[derive(Debug, Clone)]
pub struct Pcb {
    pub state: PcbState,
    pub active: bool,
    pub local: Endpoint,
    pub foreign: Endpoint,

    pub snd: SendSequence,
    pub rcv: RecvSequence,

    pub mtu: u16,
    pub mss: u16,
    pub iface: usize,

    pub start_time: Instant,
    pub time_wait: Option<Instant>,

    /// Set immediately before a failure-driven teardown (RST, refusal,
    /// timeout, retransmit deadline) so a blocked `open` can report the
    /// precise cause; `None` for an ordinary four-way close.
    pub last_failure: Option<FailureKind>,

    pub buf: RecvBuffer,
    pub ctx: WaitContext,
    pub queue: RetransmitQueue,
}

impl Pcb {
    /// A zeroed, FREE slot. `now` seeds `start_time`/ctx timestamps so the
    /// table never holds an uninitialized `Instant`.
    pub fn free(now: Instant) -> Self {
        Pcb {
            state: PcbState::Free,
            active: false,
            local: Endpoint::ANY,
            foreign: Endpoint::ANY,
            snd: SendSequence::default(),
            rcv: RecvSequence::default(),
            mtu: 0,
            mss: 0,
            iface: 0,
            start_time: now,
            time_wait: None,
            last_failure: None,
            buf: RecvBuffer::new(TCP_RECV_BUF_SIZE),
            ctx: WaitContext::new(),
            queue: RetransmitQueue::new(),
        }
    }

    /// Reinitialize a FREE slot into a fresh CLOSED PCB ready for `open`.
    pub fn reinit(&mut self, now: Instant) {
        self.state = PcbState::Closed;
        self.active = false;
        self.local = Endpoint::ANY;
        self.foreign = Endpoint::ANY;
        self.snd = SendSequence::default();
        self.rcv = RecvSequence {
            wnd: self.buf.capacity() as u16,
            ..RecvSequence::default()
        };
        self.mtu = 0;
        self.mss = 0;
        self.iface = 0;
        self.start_time = now;
        self.time_wait = None;
        self.last_failure = None;
        self.buf.reset();
        self.queue.clear();
        // ctx is left as-is: it may still have a waiter mid-unwind from the
        // connection that just freed this slot.
    }

    /// Bytes available for a synchronized-state `receive()` call.
    pub fn bytes_available(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_wraps_and_tracks_free_space() {
        let mut buf = RecvBuffer::new(4);
        assert_eq!(buf.free(), 4);

        buf.push(&[1, 2, 3]);
        assert_eq!(buf.free(), 1);

        let mut out = [0u8; 2];
        assert_eq!(buf.read(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(buf.free(), 3);

        buf.push(&[4, 5, 6]);
        assert_eq!(buf.free(), 0);

        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out), 4);
        assert_eq!(out, [3, 4, 5, 6]);
    }
}
