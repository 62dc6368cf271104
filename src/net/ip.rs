use std::collections::HashMap;
use std::io::{Cursor, Write as _};
use std::net::Ipv4Addr;
use std::sync::Arc;

use etherparse::{Ipv4Header, Ipv4HeaderSlice, TcpHeader};

use crate::stack::Core;
use crate::Error;

use super::arp::Resolution;
use super::iface::Interface;

/// A handler registered against an IP protocol number. Only protocol 6
/// (TCP) is registered by this crate; the registry itself is the
/// pluggable IP-demultiplex interface other protocols would hang off.
pub trait ProtocolHandler: Send + Sync {
    fn handle(&self, core: &mut Core, iface: usize, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]);
}

impl<F> ProtocolHandler for F
where
    F: Fn(&mut Core, usize, Ipv4Addr, Ipv4Addr, &[u8]) + Send + Sync,
{
    fn handle(&self, core: &mut Core, iface: usize, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) {
        (self)(core, iface, src, dst, payload)
    }
}

#[derive(Default)]
pub struct Demux {
    handlers: HashMap<u8, Arc<dyn ProtocolHandler>>,
}

impl Demux {
    pub fn new() -> Self {
        Demux::default()
    }

    pub fn register(&mut self, proto: u8, handler: impl ProtocolHandler + 'static) {
        self.handlers.insert(proto, Arc::new(handler));
    }
}

/// Handle one datagram read off `iface`. Rejects anything the core has no
/// business reassembling or routing around: too short to hold a full IPv4
/// header, a fragment, or addressed to/from a broadcast address. Anything
/// that survives is handed to the registered protocol handler.
pub fn ip_input(core: &mut Core, iface: usize, datagram: &[u8]) {
    let Ok(ip4h) = Ipv4HeaderSlice::from_slice(datagram) else {
        log::debug!("dropping datagram: malformed ipv4 header");
        return;
    };

    if ip4h.more_fragments() || ip4h.fragments_offset() != 0 {
        log::debug!("dropping fragmented datagram from {}", ip4h.source_addr());
        return;
    }

    let src = ip4h.source_addr();
    let dst = ip4h.destination_addr();

    if src.is_broadcast() || dst.is_broadcast() {
        log::debug!("dropping datagram with broadcast endpoint {src} -> {dst}");
        return;
    }

    let header_len = (ip4h.ihl() as usize) * 4;
    let total_len = ip4h.total_len() as usize;
    if datagram.len() < header_len || datagram.len() < total_len {
        log::debug!("dropping truncated datagram from {src}");
        return;
    }

    let payload = &datagram[header_len..total_len];
    let proto = ip4h.protocol();

    let Some(handler) = core.demux.handlers.get(&proto).cloned() else {
        log::debug!("no handler registered for ip protocol {proto}");
        return;
    };

    handler.handle(core, iface, src, dst, payload);
}

/// Frame `payload` behind `tcph` inside an IPv4 datagram from `src` to
/// `dst` and write it out the routed interface. ARP-pending is not
/// surfaced as a failure: the frame is treated as queued and retransmission
/// covers any loss. Only a hard device write failure propagates as a
/// connection failure.
pub fn ip_output(
    core: &mut Core,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: u8,
    mut tcph: TcpHeader,
    payload: &[u8],
) -> Result<(), Error> {
    let iface_idx = core
        .routes
        .route(dst, &core.ifaces)
        .ok_or(Error::NoRoute(dst))?;

    let ip_payload_len = tcph.header_len() + payload.len() as u16;
    let ip4h = Ipv4Header::new(ip_payload_len, 64, proto, src.octets(), dst.octets());
    tcph.checksum = tcph
        .calc_checksum_ipv4(&ip4h, payload)
        .expect("tcp segment length always fits in a u16 (bounded by interface MSS)");

    let mut buf = Cursor::new([0u8; 1500]);
    ip4h.write(&mut buf)?;
    tcph.write(&mut buf)?;
    buf.write_all(payload)?;
    let len = buf.position() as usize;

    let iface: &mut Interface = &mut core.ifaces[iface_idx];

    if iface.is_tap {
        match iface.arp.resolve(dst) {
            Resolution::Incomplete => {
                log::debug!("arp resolution pending for {dst}, relying on retransmission");
                return Ok(());
            }
            Resolution::Resolved(_mac) => {
                // Link-layer framing with the resolved address is the
                // driver's job; this core only needed to know the answer
                // was ready before handing the datagram down.
            }
        }
    }

    match &mut iface.tun {
        Some(tun) => tun.write_all(&buf.get_ref()[..len]).map_err(Error::from),
        None => Ok(()),
    }
}
