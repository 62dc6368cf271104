use std::ops::{Index, IndexMut};
use std::time::Instant;

use super::pcb::{Pcb, PcbState};
use super::{Endpoint, PcbId};
use crate::config::TCP_PCB_SIZE;
use crate::Error;

/// Fixed-capacity table of Protocol Control Blocks.
#[derive(Debug)]
pub struct PcbTable {
    slots: Vec<Pcb>,
}

impl PcbTable {
    pub fn new() -> Self {
        let now = Instant::now();
        PcbTable {
            slots: (0..TCP_PCB_SIZE).map(|_| Pcb::free(now)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|p| p.state != PcbState::Free)
            .count()
    }

    /// Return the first FREE slot, reinitialized to CLOSED, or
    /// `ResourceExhausted` if the table is full.
    pub fn alloc(&mut self, now: Instant) -> Result<PcbId, Error> {
        match self.slots.iter().position(|p| p.state == PcbState::Free) {
            Some(id) => {
                self.slots[id].reinit(now);
                Ok(id)
            }
            None => Err(Error::ResourceExhausted(self.slots.len())),
        }
    }

    /// Socket lookup precedence:
    /// 1. A PCB whose local and foreign endpoints both match exactly wins.
    /// 2. Otherwise a LISTEN PCB with a wildcard foreign and matching local
    ///    endpoint matches any peer.
    /// If `foreign` is absent (a bind check), any PCB with a matching
    /// local address wins.
    pub fn select(&self, local: Endpoint, foreign: Option<Endpoint>) -> Option<PcbId> {
        match foreign {
            Some(foreign) => self
                .find(|p| local_matches(p.local, local) && p.foreign == foreign)
                .or_else(|| {
                    self.find(|p| {
                        p.state == PcbState::Listen
                            && local_matches(p.local, local)
                            && p.foreign == Endpoint::ANY
                    })
                }),
            None => self.find(|p| local_matches(p.local, local)),
        }
    }

    /// Validate a caller-held `PcbId`: it may be out of range (never
    /// allocated) or may name a slot a prior close already reclaimed.
    /// `spec.md` §7's `NoPCB` covers both.
    pub fn check(&self, id: PcbId) -> Result<(), Error> {
        match self.slots.get(id) {
            Some(p) if p.state != PcbState::Free => Ok(()),
            _ => Err(Error::NoPcb(id)),
        }
    }

    fn find(&self, pred: impl Fn(&Pcb) -> bool) -> Option<PcbId> {
        self.slots
            .iter()
            .enumerate()
            .find(|(_, p)| p.state != PcbState::Free && pred(p))
            .map(|(id, _)| id)
    }
}

impl Default for PcbTable {
    fn default() -> Self {
        PcbTable::new()
    }
}

impl Index<PcbId> for PcbTable {
    type Output = Pcb;
    fn index(&self, id: PcbId) -> &Pcb {
        &self.slots[id]
    }
}

impl IndexMut<PcbId> for PcbTable {
    fn index_mut(&mut self, id: PcbId) -> &mut Pcb {
        &mut self.slots[id]
    }
}

fn local_matches(pcb_local: Endpoint, query: Endpoint) -> bool {
    pcb_local.port == query.port && (pcb_local.addr == query.addr || pcb_local.is_wildcard_addr())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(a: u8, b: u8, c: u8, d: u8, port: u16) -> Endpoint {
        Endpoint::new(std::net::Ipv4Addr::new(a, b, c, d), port)
    }

    #[test]
    fn alloc_returns_resource_exhausted_when_full() {
        let mut table = PcbTable::new();
        let now = Instant::now();
        for _ in 0..table.len() {
            table.alloc(now).unwrap();
        }
        assert!(matches!(
            table.alloc(now),
            Err(Error::ResourceExhausted(_))
        ));
    }

    #[test]
    fn select_prefers_exact_match_over_listen() {
        let mut table = PcbTable::new();
        let now = Instant::now();

        let listener = table.alloc(now).unwrap();
        table[listener].state = PcbState::Listen;
        table[listener].local = ep(0, 0, 0, 0, 80);
        table[listener].foreign = Endpoint::ANY;

        let established = table.alloc(now).unwrap();
        table[established].state = PcbState::Established;
        table[established].local = ep(10, 0, 0, 1, 80);
        table[established].foreign = ep(10, 0, 0, 2, 4000);

        let found = table
            .select(ep(10, 0, 0, 1, 80), Some(ep(10, 0, 0, 2, 4000)))
            .unwrap();
        assert_eq!(found, established);

        let found = table
            .select(ep(10, 0, 0, 1, 80), Some(ep(10, 0, 0, 3, 4001)))
            .unwrap();
        assert_eq!(found, listener, "unmatched peer falls back to the listener");
    }

    #[test]
    fn select_without_foreign_matches_any_local_binding() {
        let mut table = PcbTable::new();
        let now = Instant::now();
        let id = table.alloc(now).unwrap();
        table[id].state = PcbState::Closed;
        table[id].local = ep(10, 0, 0, 1, 9090);

        assert_eq!(table.select(ep(10, 0, 0, 1, 9090), None), Some(id));
        assert_eq!(table.select(ep(10, 0, 0, 2, 9090), None), None);
    }

    #[test]
    fn check_rejects_out_of_range_and_free_ids() {
        let mut table = PcbTable::new();
        let now = Instant::now();

        assert!(matches!(table.check(table.len()), Err(Error::NoPcb(_))));

        let id = table.alloc(now).unwrap();
        assert!(table.check(id).is_ok());

        table[id].state = PcbState::Free;
        assert!(matches!(table.check(id), Err(Error::NoPcb(_))));
    }
}
