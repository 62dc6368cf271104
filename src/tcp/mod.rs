//! The TCP endpoint state machine: RFC 793 `SEGMENT ARRIVES` processing,
//! the retransmission engine, and the scheduler rendezvous that lets
//! blocking user calls coexist with asynchronous segment arrival.
//!
//! Module boundaries mirror the components of that machine: segment codec,
//! PCB table, retransmit queue, state machine, user command surface,
//! timers, and wait context.

mod pcb;
mod retransmit;
mod segment;
mod statemachine;
mod table;
mod timers;
mod user;
mod wait;

pub use pcb::{FailureKind, Pcb, PcbState, RecvSequence, SendSequence};
pub use segment::{Flags, SegmentInfo};
pub use statemachine::segment_arrives;
pub use table::PcbTable;
pub use timers::{retransmit_tick, time_wait_tick, user_timeout_tick};
pub use user::{close, open, receive, send};
pub use wait::WaitContext;

use std::net::Ipv4Addr;

/// A local-or-foreign socket address: an IPv4 address plus a port, in host
/// byte order internally (wire order is handled at the codec boundary).
/// `addr = Ipv4Addr::UNSPECIFIED` is the wildcard `ANY` used on the local
/// side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub const ANY: Endpoint = Endpoint {
        addr: Ipv4Addr::UNSPECIFIED,
        port: 0,
    };

    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Endpoint { addr, port }
    }

    pub fn is_wildcard_addr(&self) -> bool {
        self.addr.is_unspecified()
    }
}

/// Index into the PCB table. Stable for the lifetime of the connection.
pub type PcbId = usize;
