use std::sync::MutexGuard;
use std::time::Instant;

use super::pcb::{FailureKind, PcbState};
use super::segment::Flags;
use super::statemachine::tcp_output;
use super::wait;
use super::{Endpoint, PcbId};

use crate::stack::Core;
use crate::Error;

fn random_iss() -> u32 {
    rand::random()
}

/// `open(local, foreign?, active)`. Allocates a PCB, drives the handshake
/// (active) or arms a listener (passive), then blocks until the connection
/// synchronizes or fails.
pub fn open(
    mut core: MutexGuard<'_, Core>,
    local: Endpoint,
    foreign: Option<Endpoint>,
    active: bool,
) -> Result<(MutexGuard<'_, Core>, PcbId), Error> {
    // A second LISTEN on an already-bound local endpoint is a conflict; an
    // established connection sharing the listener's port (its own accepted
    // child) is not.
    if !active {
        if let Some(existing) = core.pcbs.select(local, None) {
            if core.pcbs[existing].state == PcbState::Listen {
                return Err(Error::PortInUse(local.port));
            }
        }
    }

    let now = Instant::now();
    let id = core.pcbs.alloc(now)?;

    // An active open's MSS is derived from the egress interface *before*
    // the handshake starts, since `send()` needs it and no inbound segment
    // will bind one the way a LISTEN PCB's SYN does.
    let egress = match (active, foreign) {
        (true, Some(foreign)) => core.routes.route(foreign.addr, &core.ifaces),
        _ => None,
    };
    let egress_mtu_mss = egress.map(|iface| (core.ifaces[iface].mtu, core.ifaces[iface].mss()));

    let state0;
    {
        let p = &mut core.pcbs[id];
        p.active = active;
        p.local = local;
        p.start_time = now;

        if active {
            let Some(foreign) = foreign else {
                wait::try_release(&mut core, id);
                return Err(Error::InvalidState);
            };
            let (Some(iface), Some((mtu, mss))) = (egress, egress_mtu_mss) else {
                wait::try_release(&mut core, id);
                return Err(Error::NoRoute(foreign.addr));
            };
            p.foreign = foreign;
            p.iface = iface;
            p.mtu = mtu;
            p.mss = mss;
            p.snd.iss = random_iss();
            p.snd.una = p.snd.iss;
            p.snd.nxt = p.snd.iss.wrapping_add(1);
            p.state = PcbState::SynSent;
            state0 = PcbState::SynSent;
        } else {
            p.foreign = foreign.unwrap_or(Endpoint::ANY);
            p.state = PcbState::Listen;
            state0 = PcbState::Listen;
        }
    }

    if active {
        tcp_output(&mut core, id, Flags::SYN, &[]);
    }

    loop {
        let current = core.pcbs[id].state;
        if current != state0 {
            match current {
                PcbState::Established => return Ok((core, id)),
                PcbState::SynReceived => {
                    // Passive half of a fresh connection, or the
                    // simultaneous-open path out of SYN-SENT: keep waiting
                    // for the final ACK.
                }
                _ => {
                    let failure = core.pcbs[id].last_failure;
                    wait::try_release(&mut core, id);
                    return Err(match failure {
                        Some(FailureKind::Refused) => Error::ConnectionRefused,
                        Some(FailureKind::UserTimeout) => Error::UserTimeout,
                        Some(FailureKind::RetransmitDeadline) => Error::RetransmitDeadline,
                        Some(FailureKind::Reset) | None => Error::ConnectionReset,
                    });
                }
            }
        }

        let (next_core, interrupted) = wait::sleep(core, id);
        core = next_core;
        if interrupted {
            core.pcbs[id].state = PcbState::Closed;
            wait::try_release(&mut core, id);
            return Err(Error::Interrupted);
        }
    }
}

/// `close(id)`: half-closes the local side, emitting a FIN.
pub fn close(core: &mut Core, id: PcbId) -> Result<(), Error> {
    core.pcbs.check(id)?;

    match core.pcbs[id].state {
        PcbState::Established => {
            tcp_output(core, id, Flags::ACK | Flags::FIN, &[]);
            core.pcbs[id].snd.nxt = core.pcbs[id].snd.nxt.wrapping_add(1);
            core.pcbs[id].state = PcbState::FinWait1;
            wait::wake(core, id);
            Ok(())
        }
        PcbState::CloseWait => {
            tcp_output(core, id, Flags::ACK | Flags::FIN, &[]);
            core.pcbs[id].snd.nxt = core.pcbs[id].snd.nxt.wrapping_add(1);
            core.pcbs[id].state = PcbState::LastAck;
            wait::wake(core, id);
            Ok(())
        }
        _ => Err(Error::InvalidState),
    }
}

/// `send(id, data)`. Blocks while the peer's advertised window leaves no
/// room, transmitting as segments no larger than the egress interface's
/// MSS become available.
pub fn send(mut core: MutexGuard<'_, Core>, id: PcbId, data: &[u8]) -> Result<(MutexGuard<'_, Core>, usize), Error> {
    core.pcbs.check(id)?;

    if !matches!(core.pcbs[id].state, PcbState::Established | PcbState::CloseWait) {
        return Err(Error::InvalidState);
    }

    let mut sent = 0;
    while sent < data.len() {
        match core.pcbs[id].state {
            PcbState::Established | PcbState::CloseWait => {}
            _ => return Ok((core, sent)),
        }

        let (una, nxt, wnd, mss) = {
            let p = &core.pcbs[id];
            (p.snd.una, p.snd.nxt, p.snd.wnd as u32, p.mss as usize)
        };
        let in_flight = nxt.wrapping_sub(una) as usize;
        let cap = (wnd as usize).saturating_sub(in_flight);

        if cap == 0 {
            let (next_core, interrupted) = wait::sleep(core, id);
            core = next_core;
            if interrupted {
                return Err(Error::Interrupted);
            }
            continue;
        }

        let mss = if mss == 0 { cap } else { mss };
        let chunk = (data.len() - sent).min(cap).min(mss);
        tcp_output(&mut core, id, Flags::ACK | Flags::PSH, &data[sent..sent + chunk]);
        core.pcbs[id].snd.nxt = core.pcbs[id].snd.nxt.wrapping_add(chunk as u32);
        sent += chunk;
    }

    Ok((core, sent))
}

/// `receive(id, out)`. In ESTABLISHED, blocks until data is available; in
/// CLOSE-WAIT, drains residual data then reports EOF with `Ok(0)` once
/// empty.
pub fn receive(mut core: MutexGuard<'_, Core>, id: PcbId, out: &mut [u8]) -> Result<(MutexGuard<'_, Core>, usize), Error> {
    core.pcbs.check(id)?;

    loop {
        match core.pcbs[id].state {
            PcbState::Established => {
                if core.pcbs[id].bytes_available() > 0 {
                    let p = &mut core.pcbs[id];
                    let n = p.buf.read(out);
                    p.rcv.wnd += n as u16;
                    return Ok((core, n));
                }
                let (next_core, interrupted) = wait::sleep(core, id);
                core = next_core;
                if interrupted {
                    return Err(Error::Interrupted);
                }
            }
            PcbState::CloseWait => {
                if core.pcbs[id].bytes_available() == 0 {
                    return Ok((core, 0));
                }
                let p = &mut core.pcbs[id];
                let n = p.buf.read(out);
                p.rcv.wnd += n as u16;
                return Ok((core, n));
            }
            _ => return Err(Error::InvalidState),
        }
    }
}
