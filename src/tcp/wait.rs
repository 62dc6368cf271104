use std::sync::{Arc, Condvar, MutexGuard};

use crate::stack::Core;

/// Per-PCB condition-variable + interrupted-flag + waiter-count bundle,
/// used to atomically release the global mutex while a user thread blocks
/// on `open`/`send`/`receive`.
///
/// The condvar is reference-counted so it can be cloned out of the PCB
/// table before blocking: [`Condvar::wait`] consumes the `MutexGuard` by
/// value, which would otherwise conflict with borrowing the PCB it lives
/// inside of.
#[derive(Debug, Clone)]
pub struct WaitContext {
    condvar: Arc<Condvar>,
    waiters: u32,
    interrupted: bool,
}

impl WaitContext {
    pub fn new() -> Self {
        WaitContext {
            condvar: Arc::new(Condvar::new()),
            waiters: 0,
            interrupted: false,
        }
    }

    pub fn has_waiters(&self) -> bool {
        self.waiters > 0
    }
}

impl Default for WaitContext {
    fn default() -> Self {
        WaitContext::new()
    }
}

/// Block the calling thread on PCB `id`'s wait context, releasing `core`
/// for the duration and re-acquiring it on wake. Returns the reacquired
/// guard and whether the wake was due to an interrupt.
pub fn sleep(core: MutexGuard<'_, Core>, id: usize) -> (MutexGuard<'_, Core>, bool) {
    let condvar = core.pcbs[id].ctx.condvar.clone();
    core.pcbs[id].ctx.waiters += 1;

    let mut core = condvar.wait(core).unwrap();

    let ctx = &mut core.pcbs[id].ctx;
    ctx.waiters -= 1;
    let interrupted = ctx.interrupted;
    if interrupted && ctx.waiters == 0 {
        ctx.interrupted = false;
    }

    (core, interrupted)
}

/// Wake every thread sleeping on PCB `id`.
pub fn wake(core: &mut Core, id: usize) {
    core.pcbs[id].ctx.condvar.notify_all();
}

/// Mark PCB `id`'s wait context interrupted and wake its waiters.
pub fn interrupt(core: &mut Core, id: usize) {
    core.pcbs[id].ctx.interrupted = true;
    core.pcbs[id].ctx.condvar.notify_all();
}

/// Interrupt every non-FREE PCB: the process-wide cancellation event used
/// to wake every blocked caller, e.g. on shutdown.
pub fn interrupt_all(core: &mut Core) {
    for id in 0..core.pcbs.len() {
        if !matches!(core.pcbs[id].state, crate::tcp::PcbState::Free) {
            interrupt(core, id);
        }
    }
}

/// Try to destroy the wait context and free the slot. Fails (and instead
/// broadcasts) if a waiter is still sleeping on it, leaving that waiter to
/// complete the release on its own unwind path.
pub fn try_release(core: &mut Core, id: usize) -> bool {
    if core.pcbs[id].ctx.has_waiters() {
        core.pcbs[id].ctx.condvar.notify_all();
        return false;
    }

    let now = std::time::Instant::now();
    core.pcbs[id].reinit(now);
    core.pcbs[id].state = crate::tcp::PcbState::Free;
    true
}
