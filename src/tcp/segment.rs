use etherparse::{TcpHeader, TcpHeaderSlice};

use super::Endpoint;

/// The low six flag bits of the TCP header; the top two bits (ECE/CWR) are
/// masked out on comparison and never set on send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl Flags {
    pub const FIN: Flags = Flags {
        fin: true,
        syn: false,
        rst: false,
        psh: false,
        ack: false,
        urg: false,
    };
    pub const SYN: Flags = Flags {
        fin: false,
        syn: true,
        rst: false,
        psh: false,
        ack: false,
        urg: false,
    };
    pub const RST: Flags = Flags {
        fin: false,
        syn: false,
        rst: true,
        psh: false,
        ack: false,
        urg: false,
    };
    pub const ACK: Flags = Flags {
        fin: false,
        syn: false,
        rst: false,
        psh: false,
        ack: true,
        urg: false,
    };

    pub fn or(self, other: Flags) -> Flags {
        Flags {
            fin: self.fin || other.fin,
            syn: self.syn || other.syn,
            rst: self.rst || other.rst,
            psh: self.psh || other.psh,
            ack: self.ack || other.ack,
            urg: self.urg || other.urg,
        }
    }

    fn from_header(tcph: &TcpHeaderSlice) -> Flags {
        Flags {
            fin: tcph.fin(),
            syn: tcph.syn(),
            rst: tcph.rst(),
            psh: tcph.psh(),
            ack: tcph.ack(),
            urg: tcph.urg(),
        }
    }

    /// Whether this segment consumes sequence space on its own (SYN or
    /// FIN); combined with a nonzero payload length by [`SegmentInfo::len`].
    pub fn consumes_seq(&self) -> u32 {
        (self.syn as u32) + (self.fin as u32)
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        self.or(rhs)
    }
}

/// A received segment, decoded from the wire into the fields the state
/// machine reasons about.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub local: Endpoint,
    pub foreign: Endpoint,
    pub seq: u32,
    pub ack: u32,
    pub wnd: u16,
    pub up: u16,
    pub flags: Flags,
    pub payload: Vec<u8>,
}

impl SegmentInfo {
    /// `seg.len`: the sequence-number-consuming length.
    pub fn len(&self) -> u32 {
        self.payload.len() as u32 + self.flags.consumes_seq()
    }

    /// Parse a segment out of a TCP header slice plus its payload bytes.
    /// Honors `data_offset` (`off`) to locate the payload even when the
    /// header carries options this stack never emits.
    pub fn parse(local: Endpoint, foreign: Endpoint, tcph: &TcpHeaderSlice, payload: &[u8]) -> Self {
        SegmentInfo {
            local,
            foreign,
            seq: tcph.sequence_number(),
            ack: tcph.acknowledgment_number(),
            wnd: tcph.window_size(),
            up: tcph.urgent_pointer(),
            flags: Flags::from_header(tcph),
            payload: payload.to_vec(),
        }
    }
}

/// Build a 20-byte, options-less outgoing TCP header. The checksum is
/// filled in by `ip_output`, which has the addresses.
pub fn build_header(
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: Flags,
    wnd: u16,
) -> TcpHeader {
    let mut tcph = TcpHeader::new(src_port, dst_port, seq, wnd);
    tcph.acknowledgment_number = ack;
    tcph.fin = flags.fin;
    tcph.syn = flags.syn;
    tcph.rst = flags.rst;
    tcph.psh = flags.psh;
    tcph.ack = flags.ack;
    tcph.urg = flags.urg;
    tcph
}

/// `lhs < rhs` in 32-bit sequence-space arithmetic (RFC 1323): true when
/// the gap from `lhs` to `rhs` is less than half the sequence space. Used
/// throughout instead of naked `<`, which breaks across a sequence-number
/// wraparound.
pub fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    lhs.wrapping_sub(rhs) > (1u32 << 31)
}

pub fn wrapping_le(lhs: u32, rhs: u32) -> bool {
    lhs == rhs || wrapping_lt(lhs, rhs)
}

/// True iff `x` lies strictly between `start` and `end` in sequence space
/// (i.e. `start < x < end`, modulo wraparound).
pub fn is_between_wrapped(start: u32, x: u32, end: u32) -> bool {
    wrapping_lt(start, x) && wrapping_lt(x, end)
}

/// True iff `x` lies in `[start, end)` in sequence space.
pub fn in_window(start: u32, x: u32, len: u32) -> bool {
    is_between_wrapped(start.wrapping_sub(1), x, start.wrapping_add(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_comparisons_handle_wraparound() {
        assert!(wrapping_lt(0xFFFF_FFFF, 0));
        assert!(!wrapping_lt(0, 0xFFFF_FFFF));
        assert!(wrapping_lt(10, 20));
        assert!(!wrapping_lt(20, 10));
    }

    #[test]
    fn in_window_matches_rfc793_acceptability_examples() {
        // RCV.NXT = 100, RCV.WND = 50 -> acceptable range [100, 150)
        assert!(in_window(100, 100, 50));
        assert!(in_window(100, 149, 50));
        assert!(!in_window(100, 150, 50));
        assert!(!in_window(100, 99, 50));
    }

    #[test]
    fn in_window_wraps_past_u32_max() {
        let start = u32::MAX - 5;
        assert!(in_window(start, u32::MAX, 20));
        assert!(in_window(start, 5, 20));
        assert!(!in_window(start, 20, 20));
    }
}
