use std::net::Ipv4Addr;

use tidy_tuntap::Tun;

use crate::Error;

use super::arp::ArpTable;

/// A virtual network interface: a TUN device plus the addressing
/// information `ip_output` needs to frame and route datagrams.
pub struct Interface {
    pub name: String,
    pub addr: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub mtu: u16,
    /// Whether this interface carries link-layer (Ethernet) framing. TUN
    /// devices hand TCP/IP raw packets straight through, so they have no
    /// use for ARP; TAP devices do.
    pub(crate) is_tap: bool,
    /// `None` only for the test fixtures built by [`Interface::for_tests`],
    /// which carry no real TUN device; `ip_output` treats a missing device
    /// as a successful (discarded) write so state-machine tests can run
    /// without one.
    pub(crate) tun: Option<Tun>,
    pub(crate) arp: ArpTable,
}

impl Interface {
    /// Bring up a TUN (point-to-point IP) interface: no link-layer framing,
    /// so ARP is unused.
    pub fn new(name: &str, addr: Ipv4Addr, mask: Ipv4Addr, mtu: u16) -> Result<Self, Error> {
        Interface::new_inner(name, addr, mask, mtu, false)
    }

    /// Bring up a TAP (Ethernet-framed) interface, where `ip_output` must
    /// resolve a link-layer address via ARP before the link driver can
    /// frame the datagram.
    pub fn new_tap(name: &str, addr: Ipv4Addr, mask: Ipv4Addr, mtu: u16) -> Result<Self, Error> {
        Interface::new_inner(name, addr, mask, mtu, true)
    }

    fn new_inner(
        name: &str,
        addr: Ipv4Addr,
        mask: Ipv4Addr,
        mtu: u16,
        is_tap: bool,
    ) -> Result<Self, Error> {
        let tun = Tun::new(name, is_tap)?;
        tun.set_addr(addr)?;
        tun.set_netmask(mask)?;
        tun.bring_up()?;

        Ok(Interface {
            name: name.to_owned(),
            addr,
            mask,
            mtu,
            is_tap,
            tun: Some(tun),
            arp: ArpTable::new(),
        })
    }

    /// A device-less fixture for state-machine unit tests: carries real
    /// addressing/MTU but has no backing TUN device, so `ip_output`'s
    /// final write is a no-op.
    #[cfg(test)]
    pub fn for_tests(addr: Ipv4Addr, mask: Ipv4Addr, mtu: u16) -> Self {
        Interface {
            name: "test0".to_owned(),
            addr,
            mask,
            mtu,
            is_tap: false,
            tun: None,
            arp: ArpTable::new(),
        }
    }

    /// Maximum TCP segment size this interface can carry without
    /// fragmenting: MTU minus the minimum IP and TCP header sizes.
    pub fn mss(&self) -> u16 {
        self.mtu
            .saturating_sub(crate::config::IP_HEADER_LEN)
            .saturating_sub(crate::config::TCP_HEADER_LEN)
    }

    fn prefix_len(&self) -> u8 {
        u32::from(self.mask).count_ones() as u8
    }

    fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & u32::from(self.mask))
    }
}

/// Longest-prefix-match route selection over the set of interfaces known to
/// the stack. Multi-homing beyond longest-prefix match is out of scope, so
/// this is deliberately a flat scan rather than a trie.
#[derive(Default)]
pub struct RouteTable {
    statics: Vec<(Ipv4Addr, Ipv4Addr, usize)>,
}

impl RouteTable {
    pub fn new() -> Self {
        RouteTable::default()
    }

    /// Add a static route: datagrams to `network/mask` go out `iface`.
    pub fn add_route(&mut self, network: Ipv4Addr, mask: Ipv4Addr, iface: usize) {
        self.statics.push((network, mask, iface));
    }

    /// Select the egress interface index for `dst`, preferring the
    /// longest matching prefix. Directly-connected interface subnets are
    /// always considered, in addition to any static routes added.
    pub fn route(&self, dst: Ipv4Addr, ifaces: &[Interface]) -> Option<usize> {
        let mut best: Option<(u8, usize)> = None;

        for (idx, iface) in ifaces.iter().enumerate() {
            if matches(dst, iface.network(), iface.mask) {
                consider(&mut best, iface.prefix_len(), idx);
            }
        }

        for &(network, mask, idx) in &self.statics {
            if matches(dst, network, mask) {
                let prefix_len = u32::from(mask).count_ones() as u8;
                consider(&mut best, prefix_len, idx);
            }
        }

        best.map(|(_, idx)| idx)
    }
}

fn matches(dst: Ipv4Addr, network: Ipv4Addr, mask: Ipv4Addr) -> bool {
    u32::from(dst) & u32::from(mask) == u32::from(network)
}

fn consider(best: &mut Option<(u8, usize)>, prefix_len: u8, idx: usize) {
    match best {
        Some((len, _)) if *len >= prefix_len => {}
        _ => *best = Some((prefix_len, idx)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_longest_prefix() {
        let mut table = RouteTable::new();
        table.add_route(
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::new(255, 0, 0, 0),
            0,
        );
        table.add_route(
            Ipv4Addr::new(10, 10, 10, 0),
            Ipv4Addr::new(255, 255, 255, 0),
            1,
        );

        assert_eq!(
            table.route(Ipv4Addr::new(10, 10, 10, 5), &[]),
            Some(1),
            "longest matching prefix wins"
        );
        assert_eq!(table.route(Ipv4Addr::new(10, 20, 0, 5), &[]), Some(0));
        assert_eq!(table.route(Ipv4Addr::new(192, 168, 0, 1), &[]), None);
    }
}
