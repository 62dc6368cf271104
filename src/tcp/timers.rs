use std::time::Instant;

use super::pcb::{FailureKind, PcbState};
use super::statemachine::retransmit_entry;
use super::wait;

use crate::config::{TCP_MSL, TCP_USER_TIMEOUT_TIME};
use crate::stack::Core;

/// Retransmit timer (100 ms): walk every non-FREE PCB and re-emit any queue
/// entry whose RTO has elapsed, abandoning the connection if the 12 s
/// deadline is hit.
pub fn retransmit_tick(core: &mut Core) {
    let now = Instant::now();

    for id in 0..core.pcbs.len() {
        if core.pcbs[id].state == PcbState::Free {
            continue;
        }

        let (due, deadline_hit) = core.pcbs[id].queue.emit_all(now);

        if deadline_hit {
            log::warn!("pcb {id} hit the retransmit deadline, abandoning connection");
            core.pcbs[id].last_failure = Some(FailureKind::RetransmitDeadline);
            core.pcbs[id].state = PcbState::Closed;
            wait::wake(core, id);
            wait::try_release(core, id);
            continue;
        }

        for entry in &due {
            retransmit_entry(core, id, entry);
        }
    }
}

/// User-timeout timer (1 s): abandon a non-TIME-WAIT PCB that has made no
/// progress in `TCP_USER_TIMEOUT_TIME`.
pub fn user_timeout_tick(core: &mut Core) {
    let now = Instant::now();

    for id in 0..core.pcbs.len() {
        let (state, start) = {
            let p = &core.pcbs[id];
            (p.state, p.start_time)
        };

        if matches!(state, PcbState::Free | PcbState::TimeWait) {
            continue;
        }

        if now.duration_since(start) >= TCP_USER_TIMEOUT_TIME {
            log::warn!("pcb {id} hit user timeout");
            let (due, _) = core.pcbs[id].queue.emit_all(now);
            for entry in &due {
                retransmit_entry(core, id, entry);
            }
            core.pcbs[id].last_failure = Some(FailureKind::UserTimeout);
            core.pcbs[id].state = PcbState::Closed;
            wait::wake(core, id);
            wait::try_release(core, id);
        }
    }
}

/// Time-wait timer (1 s): release a TIME-WAIT PCB once 2·MSL has elapsed
/// since entry.
pub fn time_wait_tick(core: &mut Core) {
    let now = Instant::now();

    for id in 0..core.pcbs.len() {
        if core.pcbs[id].state != PcbState::TimeWait {
            continue;
        }

        let Some(entered) = core.pcbs[id].time_wait else {
            continue;
        };

        if now.duration_since(entered) >= TCP_MSL * 2 {
            core.pcbs[id].state = PcbState::Closed;
            wait::try_release(core, id);
        }
    }
}
