//! The assembled stack: the locked [`Core`] plus the driver and timer
//! threads that drive it (one thread polling the interfaces' raw file
//! descriptors, generalized to several interfaces) plus the three periodic
//! timers the state machine needs: retransmit, user-timeout, and
//! time-wait.

use std::io::Read;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use etherparse::TcpHeaderSlice;
use nix::poll::{poll, PollFd, PollFlags};

use crate::config::{DRIVER_POLL_MILLIS, RETRANSMIT_TICK, TIME_WAIT_TICK, USER_TIMEOUT_TICK};
use crate::net::{self, Demux, Interface, RouteTable};
use crate::tcp::{self, Endpoint, PcbId, PcbTable, SegmentInfo};
use crate::Error;

/// Everything the global mutex guards: the PCB table and the network
/// plumbing a PCB's output path reaches into. One lock covers both so
/// `tcp_output` can run from input, user, or timer threads.
pub struct Core {
    pub(crate) pcbs: PcbTable,
    pub(crate) ifaces: Vec<Interface>,
    pub(crate) routes: RouteTable,
    pub(crate) demux: Demux,
}

impl Core {
    fn new(ifaces: Vec<Interface>) -> Self {
        let mut demux = Demux::new();
        demux.register(6, tcp_handler);

        Core {
            pcbs: PcbTable::new(),
            ifaces,
            routes: RouteTable::new(),
            demux,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let iface = Interface::for_tests(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(255, 255, 255, 0), 1500);
        Core::new(vec![iface])
    }
}

fn tcp_handler(core: &mut Core, iface: usize, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) {
    let Ok(tcph) = TcpHeaderSlice::from_slice(payload) else {
        log::debug!("dropping tcp segment: malformed header");
        return;
    };

    let header_len = (tcph.data_offset() as usize) * 4;
    if payload.len() < header_len {
        log::debug!("dropping tcp segment: truncated header");
        return;
    }
    let data = &payload[header_len..];

    let ip4h = etherparse::Ipv4Header::new(payload.len() as u16, 64, 6, src.octets(), dst.octets());
    match tcph.to_header().calc_checksum_ipv4(&ip4h, data) {
        Ok(expected) if expected == tcph.checksum() => {}
        _ => {
            log::debug!("dropping tcp segment {src} -> {dst}: bad checksum");
            return;
        }
    }

    let local = Endpoint::new(dst, tcph.destination_port());
    let foreign = Endpoint::new(src, tcph.source_port());
    let seg = SegmentInfo::parse(local, foreign, &tcph, data);

    tcp::segment_arrives(core, iface, seg);
}

/// The assembled stack: a locked [`Core`] plus its background threads.
/// Dropping the last clone leaves the threads running (they hold their own
/// `Arc`); there is no graceful shutdown primitive beyond process exit.
pub struct Stack {
    core: Arc<Mutex<Core>>,
}

impl Stack {
    /// Bring up a single TUN interface.
    pub fn new(name: &str, addr: Ipv4Addr, mask: Ipv4Addr) -> Result<Self, Error> {
        Stack::with_interfaces(vec![Interface::new(name, addr, mask, 1500)?])
    }

    /// Bring up several interfaces sharing one routing/PCB core, enabling
    /// longest-prefix routing between them.
    pub fn with_interfaces(ifaces: Vec<Interface>) -> Result<Self, Error> {
        let core = Arc::new(Mutex::new(Core::new(ifaces)));

        spawn_driver(core.clone());
        spawn_tick(core.clone(), RETRANSMIT_TICK, tcp::retransmit_tick);
        spawn_tick(core.clone(), USER_TIMEOUT_TICK, tcp::user_timeout_tick);
        spawn_tick(core.clone(), TIME_WAIT_TICK, tcp::time_wait_tick);

        Ok(Stack { core })
    }

    /// Register a static route in addition to each interface's own subnet.
    pub fn add_route(&self, network: Ipv4Addr, mask: Ipv4Addr, iface: usize) {
        self.core.lock().unwrap().routes.add_route(network, mask, iface);
    }

    pub fn open(&self, local: Endpoint, foreign: Option<Endpoint>, active: bool) -> Result<PcbId, Error> {
        let core = self.core.lock().unwrap();
        let (_core, id) = tcp::open(core, local, foreign, active)?;
        Ok(id)
    }

    pub fn close(&self, id: PcbId) -> Result<(), Error> {
        tcp::close(&mut self.core.lock().unwrap(), id)
    }

    pub fn send(&self, id: PcbId, data: &[u8]) -> Result<usize, Error> {
        let core = self.core.lock().unwrap();
        let (_core, n) = tcp::send(core, id, data)?;
        Ok(n)
    }

    pub fn receive(&self, id: PcbId, out: &mut [u8]) -> Result<usize, Error> {
        let core = self.core.lock().unwrap();
        let (_core, n) = tcp::receive(core, id, out)?;
        Ok(n)
    }

    /// Accept a connection on `local`: arms a fresh LISTEN PCB and blocks
    /// until it synchronizes. Call this from as many threads as connections
    /// should be accepted concurrently.
    pub fn accept(&self, local: Endpoint) -> Result<PcbId, Error> {
        self.open(local, None, false)
    }

    pub fn connect(&self, local: Endpoint, foreign: Endpoint) -> Result<PcbId, Error> {
        self.open(local, Some(foreign), true)
    }
}

fn spawn_tick(core: Arc<Mutex<Core>>, period: Duration, tick: fn(&mut Core)) {
    thread::spawn(move || loop {
        thread::sleep(period);
        tick(&mut core.lock().unwrap());
    });
}

fn spawn_driver(core: Arc<Mutex<Core>>) {
    thread::spawn(move || driver_loop(core));
}

/// Poll every interface's raw file descriptor without holding the lock,
/// then acquire it only once one is confirmed readable.
fn driver_loop(core: Arc<Mutex<Core>>) -> ! {
    let fds: Vec<i32> = {
        let core = core.lock().unwrap();
        core.ifaces.iter().filter_map(|i| i.tun.as_ref().map(|t| t.as_raw_fd())).collect()
    };

    let mut buf = [0u8; 1500];

    loop {
        let mut pollfds: Vec<PollFd> = fds.iter().map(|&fd| PollFd::new(fd, PollFlags::POLLIN)).collect();

        let ready = match poll(&mut pollfds, DRIVER_POLL_MILLIS) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("poll failed: {e}");
                continue;
            }
        };
        if ready == 0 {
            continue;
        }

        for (idx, pfd) in pollfds.iter().enumerate() {
            let Some(revents) = pfd.revents() else { continue };
            if !revents.contains(PollFlags::POLLIN) {
                continue;
            }

            let mut core = core.lock().unwrap();
            let Some(tun) = core.ifaces[idx].tun.as_mut() else { continue };
            let n = match tun.read(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    log::warn!("read from interface {idx} failed: {e}");
                    continue;
                }
            };

            net::ip_input(&mut core, idx, &buf[..n]);
        }
    }
}
