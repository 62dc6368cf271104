use std::time::Instant;

use super::pcb::{FailureKind, PcbState};
use super::retransmit::Entry;
use super::segment::{build_header, in_window, wrapping_le, wrapping_lt, Flags, SegmentInfo};
use super::wait;
use super::{Endpoint, PcbId};

use crate::net;
use crate::stack::Core;

/// Send a bare reply that is not tied to any PCB (the no-matching-PCB and
/// unacceptable-SYN-SENT-ACK cases): never queued, since pure ACKs and
/// RSTs never consume sequence space.
fn reply(core: &mut Core, local: Endpoint, foreign: Endpoint, seq: u32, ack: u32, flags: Flags, wnd: u16) {
    let tcph = build_header(local.port, foreign.port, seq, ack, flags, wnd);
    if let Err(e) = net::ip_output(core, local.addr, foreign.addr, 6, tcph, &[]) {
        log::warn!("tcp reply {local:?} -> {foreign:?} failed: {e}");
    }
}

/// The output path: choose `seq` (ISS for a SYN, `snd.nxt` otherwise), queue
/// the segment if it consumes sequence space, then transmit with the PCB's
/// *current* `rcv.nxt`/`rcv.wnd`.
pub fn tcp_output(core: &mut Core, id: PcbId, flags: Flags, payload: &[u8]) {
    let (local, foreign, seq, rcv_nxt, rcv_wnd) = {
        let p = &core.pcbs[id];
        let seq = if flags.syn { p.snd.iss } else { p.snd.nxt };
        (p.local, p.foreign, seq, p.rcv.nxt, p.rcv.wnd)
    };

    if flags.syn || flags.fin || !payload.is_empty() {
        core.pcbs[id].queue.add(Instant::now(), seq, flags, payload);
    }

    let tcph = build_header(local.port, foreign.port, seq, rcv_nxt, flags, rcv_wnd);
    if let Err(e) = net::ip_output(core, local.addr, foreign.addr, 6, tcph, payload) {
        log::warn!("tcp_output failed for pcb {id}: {e}");
    }
}

/// Re-emit a previously queued entry verbatim except for `ack`/`wnd`, which
/// are refreshed to the PCB's current receive state so a piggy-backed ACK
/// still advances.
pub fn retransmit_entry(core: &mut Core, id: PcbId, entry: &Entry) {
    let (local, foreign, rcv_nxt, rcv_wnd) = {
        let p = &core.pcbs[id];
        (p.local, p.foreign, p.rcv.nxt, p.rcv.wnd)
    };
    let tcph = build_header(local.port, foreign.port, entry.seq, rcv_nxt, entry.flags, rcv_wnd);
    if let Err(e) = net::ip_output(core, local.addr, foreign.addr, 6, tcph, &entry.data) {
        log::warn!("retransmit failed for pcb {id}: {e}");
    }
}

fn random_iss() -> u32 {
    rand::random()
}

/// Discard the retransmit queue outright rather than flushing it by
/// resending: a connection reset or protocol violation means none of it
/// is still worth retransmitting.
fn discard_queue(core: &mut Core, id: PcbId) {
    core.pcbs[id].queue.clear();
}

/// Ordinary close: the four-way handshake (or its LAST-ACK tail) completed
/// normally, so `last_failure` stays `None`.
fn teardown(core: &mut Core, id: PcbId) {
    core.pcbs[id].state = PcbState::Closed;
    wait::wake(core, id);
    wait::try_release(core, id);
}

/// Failure-driven close: records `kind` so a blocked `open` can surface the
/// precise error `spec.md` §7 names instead of a generic reset.
fn teardown_with_failure(core: &mut Core, id: PcbId, kind: FailureKind) {
    core.pcbs[id].last_failure = Some(kind);
    teardown(core, id);
}

/// Run the RFC 793 `SEGMENT ARRIVES` event over the PCB table. `iface` is
/// the interface the datagram arrived on, recorded on a LISTEN PCB's
/// transition so its MSS can be derived.
pub fn segment_arrives(core: &mut Core, iface: usize, seg: SegmentInfo) {
    let id = core.pcbs.select(seg.local, Some(seg.foreign));

    match id.map(|id| (id, core.pcbs[id].state)) {
        None => handle_no_pcb(core, &seg),
        Some((_, PcbState::Closed)) | Some((_, PcbState::Free)) => handle_no_pcb(core, &seg),
        Some((id, PcbState::Listen)) => handle_listen(core, iface, id, &seg),
        Some((id, PcbState::SynSent)) => handle_syn_sent(core, id, &seg),
        Some((id, _)) => handle_synchronized(core, id, &seg),
    }
}

fn handle_no_pcb(core: &mut Core, seg: &SegmentInfo) {
    if seg.flags.rst {
        return;
    }

    if seg.flags.ack {
        reply(core, seg.local, seg.foreign, seg.ack, 0, Flags::RST, 0);
    } else {
        let ack = seg.seq.wrapping_add(seg.len());
        reply(core, seg.local, seg.foreign, 0, ack, Flags::RST | Flags::ACK, 0);
    }
}

fn handle_listen(core: &mut Core, iface: usize, id: PcbId, seg: &SegmentInfo) {
    if seg.flags.rst {
        return;
    }

    if seg.flags.ack {
        reply(core, seg.local, seg.foreign, seg.ack, 0, Flags::RST, 0);
        return;
    }

    if !seg.flags.syn {
        return;
    }

    {
        let p = &mut core.pcbs[id];
        p.local = seg.local;
        p.foreign = seg.foreign;
        p.rcv.wnd = p.buf.capacity() as u16;
        p.rcv.nxt = seg.seq.wrapping_add(1);
        p.rcv.irs = seg.seq;
        p.iface = iface;
        p.mtu = core.ifaces[iface].mtu;
        p.mss = core.ifaces[iface].mss();
        p.snd.iss = random_iss();
        p.snd.una = p.snd.iss;
        p.snd.nxt = p.snd.iss.wrapping_add(1);
        p.state = PcbState::SynReceived;
    }

    tcp_output(core, id, Flags::SYN | Flags::ACK, &[]);
}

fn handle_syn_sent(core: &mut Core, id: PcbId, seg: &SegmentInfo) {
    let (iss, una, nxt) = {
        let p = &core.pcbs[id];
        (p.snd.iss, p.snd.una, p.snd.nxt)
    };

    let mut ack_acceptable = false;
    if seg.flags.ack {
        // seg.ack <= iss or seg.ack > snd.nxt is unacceptable.
        if wrapping_le(seg.ack, iss) || wrapping_lt(nxt, seg.ack) {
            reply(core, seg.local, seg.foreign, seg.ack, 0, Flags::RST, 0);
            return;
        }
        ack_acceptable = wrapping_le(una, seg.ack) && wrapping_le(seg.ack, nxt);
    }

    if seg.flags.rst {
        if ack_acceptable {
            log::info!("connection reset in SYN-SENT from {:?}", seg.foreign);
            teardown_with_failure(core, id, FailureKind::Reset);
        }
        return;
    }

    if !seg.flags.syn {
        return;
    }

    {
        let p = &mut core.pcbs[id];
        p.rcv.nxt = seg.seq.wrapping_add(1);
        p.rcv.irs = seg.seq;
    }

    if ack_acceptable {
        core.pcbs[id].snd.una = seg.ack;
        core.pcbs[id].queue.cleanup(seg.ack);
    }

    if wrapping_lt(iss, core.pcbs[id].snd.una) {
        let p = &mut core.pcbs[id];
        p.state = PcbState::Established;
        p.snd.wnd = seg.wnd;
        p.snd.wl1 = seg.seq;
        p.snd.wl2 = seg.ack;
        wait::wake(core, id);
        tcp_output(core, id, Flags::ACK, &[]);
    } else {
        // Simultaneous open: neither side's SYN has been acked yet.
        core.pcbs[id].state = PcbState::SynReceived;
        tcp_output(core, id, Flags::SYN | Flags::ACK, &[]);
    }
}

fn is_acceptable(core: &Core, id: PcbId, seg: &SegmentInfo) -> bool {
    let p = &core.pcbs[id];
    let seg_len = seg.len();
    let rcv_nxt = p.rcv.nxt;
    let rcv_wnd = p.rcv.wnd as u32;

    if seg_len == 0 {
        if rcv_wnd == 0 {
            seg.seq == rcv_nxt
        } else {
            in_window(rcv_nxt, seg.seq, rcv_wnd)
        }
    } else if rcv_wnd == 0 {
        false
    } else {
        in_window(rcv_nxt, seg.seq, rcv_wnd)
            || in_window(rcv_nxt, seg.seq.wrapping_add(seg_len).wrapping_sub(1), rcv_wnd)
    }
}

fn handle_synchronized(core: &mut Core, id: PcbId, seg: &SegmentInfo) {
    // 1. Acceptability check.
    if !is_acceptable(core, id, seg) {
        if !seg.flags.rst {
            tcp_output(core, id, Flags::ACK, &[]);
        }
        return;
    }

    let state = core.pcbs[id].state;

    // 2. RST handling.
    if seg.flags.rst {
        match state {
            PcbState::SynReceived => {
                if core.pcbs[id].active {
                    log::info!("connection refused for {:?}", core.pcbs[id].foreign);
                    teardown_with_failure(core, id, FailureKind::Refused);
                } else {
                    let p = &mut core.pcbs[id];
                    p.state = PcbState::Listen;
                    p.foreign = Endpoint::ANY;
                }
            }
            PcbState::Established | PcbState::FinWait1 | PcbState::FinWait2 | PcbState::CloseWait => {
                discard_queue(core, id);
                teardown_with_failure(core, id, FailureKind::Reset);
            }
            PcbState::Closing | PcbState::LastAck | PcbState::TimeWait => {
                teardown_with_failure(core, id, FailureKind::Reset);
            }
            _ => {}
        }
        return;
    }

    // 3. SYN in a synchronized state: protocol violation.
    if seg.flags.syn {
        discard_queue(core, id);
        teardown_with_failure(core, id, FailureKind::Reset);
        return;
    }

    // 4. ACK processing.
    if !seg.flags.ack {
        return;
    }

    if state == PcbState::SynReceived {
        let (una, nxt) = {
            let p = &core.pcbs[id];
            (p.snd.una, p.snd.nxt)
        };
        if wrapping_le(una, seg.ack) && wrapping_le(seg.ack, nxt) {
            core.pcbs[id].state = PcbState::Established;
            wait::wake(core, id);
        } else {
            reply(core, seg.local, seg.foreign, seg.ack, 0, Flags::RST, 0);
            return;
        }
    }

    let state = core.pcbs[id].state;

    if matches!(
        state,
        PcbState::Established | PcbState::FinWait1 | PcbState::FinWait2 | PcbState::CloseWait
    ) {
        let (una, nxt) = {
            let p = &core.pcbs[id];
            (p.snd.una, p.snd.nxt)
        };

        if wrapping_lt(una, seg.ack) && wrapping_le(seg.ack, nxt) {
            core.pcbs[id].snd.una = seg.ack;
            core.pcbs[id].queue.cleanup(seg.ack);
            wait::wake(core, id);
        } else if wrapping_lt(nxt, seg.ack) {
            tcp_output(core, id, Flags::ACK, &[]);
            return;
        }
        // seg.ack <= una (and not already handled above) is a duplicate
        // ACK: ignored.

        {
            let p = &mut core.pcbs[id];
            if wrapping_lt(p.snd.wl1, seg.seq) || (p.snd.wl1 == seg.seq && wrapping_le(p.snd.wl2, seg.ack)) {
                p.snd.wnd = seg.wnd;
                p.snd.wl1 = seg.seq;
                p.snd.wl2 = seg.ack;
                wait::wake(core, id);
            }
        }

        if state == PcbState::FinWait1 && seg.ack == core.pcbs[id].snd.nxt {
            core.pcbs[id].state = PcbState::FinWait2;
        }
    } else if state == PcbState::LastAck && seg.ack == core.pcbs[id].snd.nxt {
        teardown(core, id);
        return;
    }

    let state = core.pcbs[id].state;

    // 5. Data.
    if matches!(state, PcbState::Established | PcbState::FinWait1 | PcbState::FinWait2)
        && !seg.payload.is_empty()
    {
        let p = &mut core.pcbs[id];
        let skip = (p.rcv.nxt.wrapping_sub(seg.seq) as usize).min(seg.payload.len());
        let usable = &seg.payload[skip..];
        let n = usable.len().min(p.buf.free());
        p.buf.push(&usable[..n]);
        p.rcv.nxt = p.rcv.nxt.wrapping_add(n as u32);
        p.rcv.wnd -= n as u16;
        wait::wake(core, id);
        tcp_output(core, id, Flags::ACK, &[]);
    }

    // 6. FIN.
    if seg.flags.fin && state.is_synchronized() {
        let fin_acked = seg.ack == core.pcbs[id].snd.nxt;
        core.pcbs[id].rcv.nxt = core.pcbs[id].rcv.nxt.wrapping_add(1);
        tcp_output(core, id, Flags::ACK, &[]);

        match state {
            PcbState::SynReceived | PcbState::Established => {
                core.pcbs[id].state = PcbState::CloseWait;
                wait::wake(core, id);
            }
            PcbState::FinWait1 => {
                if fin_acked {
                    core.pcbs[id].state = PcbState::TimeWait;
                    core.pcbs[id].time_wait = Some(Instant::now());
                } else {
                    core.pcbs[id].state = PcbState::Closing;
                }
            }
            PcbState::FinWait2 => {
                core.pcbs[id].state = PcbState::TimeWait;
                core.pcbs[id].time_wait = Some(Instant::now());
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn local() -> Endpoint {
        Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 7)
    }
    fn foreign() -> Endpoint {
        Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 4000)
    }

    fn syn_segment(seq: u32) -> SegmentInfo {
        SegmentInfo {
            local: local(),
            foreign: foreign(),
            seq,
            ack: 0,
            wnd: 4096,
            up: 0,
            flags: Flags::SYN,
            payload: vec![],
        }
    }

    #[test]
    fn listen_syn_moves_to_syn_received_and_binds_foreign() {
        let mut core = Core::for_tests();
        let id = core.pcbs.alloc(Instant::now()).unwrap();
        core.pcbs[id].state = PcbState::Listen;
        core.pcbs[id].local = Endpoint::new(Ipv4Addr::UNSPECIFIED, 7);

        handle_listen(&mut core, 0, id, &syn_segment(100));

        assert_eq!(core.pcbs[id].state, PcbState::SynReceived);
        assert_eq!(core.pcbs[id].rcv.nxt, 101);
        assert_eq!(core.pcbs[id].rcv.irs, 100);
        assert_eq!(core.pcbs[id].foreign, foreign());
    }

    #[test]
    fn rst_in_syn_received_refuses_active_open_and_resets_passive_one() {
        let mut core = Core::for_tests();

        let active_id = core.pcbs.alloc(Instant::now()).unwrap();
        core.pcbs[active_id].state = PcbState::SynReceived;
        core.pcbs[active_id].active = true;
        core.pcbs[active_id].local = local();
        core.pcbs[active_id].foreign = foreign();
        core.pcbs[active_id].rcv.nxt = 500;
        core.pcbs[active_id].rcv.wnd = 100;

        let rst_seg = SegmentInfo {
            local: local(),
            foreign: foreign(),
            seq: 500,
            ack: 0,
            wnd: 4096,
            up: 0,
            flags: Flags::RST,
            payload: vec![],
        };

        // No caller is sleeping on this PCB's wait context, so the
        // failure-driven teardown's `try_release` frees the slot in the
        // same call rather than leaving it CLOSED for a waiter to collect
        // (see `wait::try_release`'s release-with-waiters protocol).
        handle_synchronized(&mut core, active_id, &rst_seg);
        assert_eq!(core.pcbs[active_id].state, PcbState::Free);

        let passive_id = core.pcbs.alloc(Instant::now()).unwrap();
        core.pcbs[passive_id].state = PcbState::SynReceived;
        core.pcbs[passive_id].active = false;
        core.pcbs[passive_id].local = local();
        core.pcbs[passive_id].foreign = foreign();
        core.pcbs[passive_id].rcv.nxt = 500;
        core.pcbs[passive_id].rcv.wnd = 100;

        handle_synchronized(&mut core, passive_id, &rst_seg);
        assert_eq!(core.pcbs[passive_id].state, PcbState::Listen);
        assert_eq!(core.pcbs[passive_id].foreign, Endpoint::ANY);
    }

    #[test]
    fn handle_syn_sent_accepts_syn_ack_and_establishes() {
        let mut core = Core::for_tests();
        let id = core.pcbs.alloc(Instant::now()).unwrap();
        core.pcbs[id].state = PcbState::SynSent;
        core.pcbs[id].local = local();
        core.pcbs[id].foreign = foreign();
        core.pcbs[id].snd.iss = 1000;
        core.pcbs[id].snd.una = 1000;
        core.pcbs[id].snd.nxt = 1001;

        let syn_ack = SegmentInfo {
            local: local(),
            foreign: foreign(),
            seq: 5000,
            ack: 1001,
            wnd: 4096,
            up: 0,
            flags: Flags::SYN | Flags::ACK,
            payload: vec![],
        };

        handle_syn_sent(&mut core, id, &syn_ack);

        assert_eq!(core.pcbs[id].state, PcbState::Established);
        assert_eq!(core.pcbs[id].snd.una, 1001);
        assert_eq!(core.pcbs[id].rcv.nxt, 5001);
        assert_eq!(core.pcbs[id].rcv.irs, 5000);
    }

    #[test]
    fn handle_syn_sent_bare_syn_is_simultaneous_open() {
        let mut core = Core::for_tests();
        let id = core.pcbs.alloc(Instant::now()).unwrap();
        core.pcbs[id].state = PcbState::SynSent;
        core.pcbs[id].local = local();
        core.pcbs[id].foreign = foreign();
        core.pcbs[id].snd.iss = 1000;
        core.pcbs[id].snd.una = 1000;
        core.pcbs[id].snd.nxt = 1001;

        // The peer's own SYN arrived with no ACK of ours yet: neither side's
        // SYN has been acknowledged, so this is a simultaneous open.
        let bare_syn = SegmentInfo {
            local: local(),
            foreign: foreign(),
            seq: 5000,
            ack: 0,
            wnd: 4096,
            up: 0,
            flags: Flags::SYN,
            payload: vec![],
        };

        handle_syn_sent(&mut core, id, &bare_syn);

        assert_eq!(core.pcbs[id].state, PcbState::SynReceived);
        assert_eq!(core.pcbs[id].rcv.irs, 5000);
        assert_eq!(core.pcbs[id].snd.una, 1000, "nothing of ours was acked yet");
    }

    #[test]
    fn fin_in_established_moves_to_close_wait() {
        let mut core = Core::for_tests();
        let id = core.pcbs.alloc(Instant::now()).unwrap();
        core.pcbs[id].state = PcbState::Established;
        core.pcbs[id].local = local();
        core.pcbs[id].foreign = foreign();
        core.pcbs[id].rcv.nxt = 1000;
        core.pcbs[id].rcv.wnd = 4096;
        core.pcbs[id].snd.una = 2000;
        core.pcbs[id].snd.nxt = 2000;

        let fin = SegmentInfo {
            local: local(),
            foreign: foreign(),
            seq: 1000,
            ack: 2000,
            wnd: 4096,
            up: 0,
            flags: Flags::FIN | Flags::ACK,
            payload: vec![],
        };

        handle_synchronized(&mut core, id, &fin);

        assert_eq!(core.pcbs[id].state, PcbState::CloseWait);
        assert_eq!(core.pcbs[id].rcv.nxt, 1001);
    }

    #[test]
    fn fin_acked_in_fin_wait1_passes_through_fin_wait2_to_time_wait() {
        let mut core = Core::for_tests();
        let id = core.pcbs.alloc(Instant::now()).unwrap();
        core.pcbs[id].state = PcbState::FinWait1;
        core.pcbs[id].local = local();
        core.pcbs[id].foreign = foreign();
        core.pcbs[id].rcv.nxt = 1000;
        core.pcbs[id].rcv.wnd = 4096;
        core.pcbs[id].snd.una = 2000;
        core.pcbs[id].snd.nxt = 2001; // our own FIN consumed one sequence number

        // Peer's FIN arrives already acknowledging our FIN.
        let fin = SegmentInfo {
            local: local(),
            foreign: foreign(),
            seq: 1000,
            ack: 2001,
            wnd: 4096,
            up: 0,
            flags: Flags::FIN | Flags::ACK,
            payload: vec![],
        };

        handle_synchronized(&mut core, id, &fin);

        assert_eq!(core.pcbs[id].state, PcbState::TimeWait);
        assert!(core.pcbs[id].time_wait.is_some());
    }

    #[test]
    fn fin_not_yet_acked_in_fin_wait1_moves_to_closing() {
        let mut core = Core::for_tests();
        let id = core.pcbs.alloc(Instant::now()).unwrap();
        core.pcbs[id].state = PcbState::FinWait1;
        core.pcbs[id].local = local();
        core.pcbs[id].foreign = foreign();
        core.pcbs[id].rcv.nxt = 1000;
        core.pcbs[id].rcv.wnd = 4096;
        core.pcbs[id].snd.una = 2000;
        core.pcbs[id].snd.nxt = 2001;

        // Simultaneous close: the peer's FIN arrives without acking ours.
        let fin = SegmentInfo {
            local: local(),
            foreign: foreign(),
            seq: 1000,
            ack: 2000,
            wnd: 4096,
            up: 0,
            flags: Flags::FIN | Flags::ACK,
            payload: vec![],
        };

        handle_synchronized(&mut core, id, &fin);

        assert_eq!(core.pcbs[id].state, PcbState::Closing);
    }

    #[test]
    fn window_update_ignores_a_stale_duplicate_behind_the_last_update() {
        let mut core = Core::for_tests();
        let id = core.pcbs.alloc(Instant::now()).unwrap();
        core.pcbs[id].state = PcbState::Established;
        core.pcbs[id].local = local();
        core.pcbs[id].foreign = foreign();
        core.pcbs[id].rcv.nxt = 1000;
        core.pcbs[id].rcv.wnd = 4096;
        core.pcbs[id].snd.una = 2000;
        core.pcbs[id].snd.nxt = 2000;
        core.pcbs[id].snd.wnd = 500;
        core.pcbs[id].snd.wl1 = 900;
        core.pcbs[id].snd.wl2 = 1800;

        let fresh = SegmentInfo {
            local: local(),
            foreign: foreign(),
            seq: 1000,
            ack: 2000,
            wnd: 9000,
            up: 0,
            flags: Flags::ACK,
            payload: vec![],
        };
        handle_synchronized(&mut core, id, &fresh);
        assert_eq!(core.pcbs[id].snd.wnd, 9000);
        assert_eq!(core.pcbs[id].snd.wl1, 1000);
        assert_eq!(core.pcbs[id].snd.wl2, 2000);

        // Same SEG.SEQ but an older SEG.ACK: a reordered duplicate of an
        // earlier segment, which must not roll the window back.
        let stale = SegmentInfo {
            local: local(),
            foreign: foreign(),
            seq: 1000,
            ack: 1999,
            wnd: 123,
            up: 0,
            flags: Flags::ACK,
            payload: vec![],
        };
        handle_synchronized(&mut core, id, &stale);
        assert_eq!(core.pcbs[id].snd.wnd, 9000, "a stale duplicate must not update the window");
        assert_eq!(core.pcbs[id].snd.wl1, 1000);
        assert_eq!(core.pcbs[id].snd.wl2, 2000);
    }

    #[test]
    fn acceptability_rejects_out_of_window_segment() {
        let mut core = Core::for_tests();
        let id = core.pcbs.alloc(Instant::now()).unwrap();
        core.pcbs[id].state = PcbState::Established;
        core.pcbs[id].local = local();
        core.pcbs[id].foreign = foreign();
        core.pcbs[id].rcv.nxt = 1000;
        core.pcbs[id].rcv.wnd = 100;

        let far_seg = SegmentInfo {
            local: local(),
            foreign: foreign(),
            seq: 5000,
            ack: 1,
            wnd: 4096,
            up: 0,
            flags: Flags::ACK,
            payload: vec![],
        };

        assert!(!is_acceptable(&core, id, &far_seg));
    }
}
