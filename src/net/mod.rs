//! The essential IP plumbing the TCP core needs to move bytes: route
//! selection, an ARP resolution contract, and a pluggable IP-demultiplex
//! interface. None of this reassembles fragments, speaks ARP wire protocol,
//! or frames link-layer headers — that is the out-of-scope link driver's job.

mod arp;
mod iface;
mod ip;

pub use arp::{ArpTable, Resolution};
pub use iface::{Interface, RouteTable};
pub use ip::{ip_input, ip_output, Demux, ProtocolHandler};
