//! Page-replacement policies.
//!
//! Exactly one policy is active per kernel, chosen at configuration time.
//! A policy operates purely on a process's resident set (and the
//! hardware-maintained accessed bits): it admits pages and selects
//! victims. It never locks, never touches swap slots, and never performs
//! I/O; that is the swap subsystem's job.
//!
//! The resident set is a flat array of `(va, seq)` entries. The admission
//! stamp `seq` makes one representation serve both orderings: LIFO evicts
//! the largest stamp, second-chance FIFO scans from the smallest and
//! re-stamps demoted pages to the tail.

use alloc::boxed::Box;

use crate::hal::{PageTableOps, PteFlags, SpaceId};
use crate::process::table::ResidentPage;

/// Which replacement policy a kernel runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// No swapping; growth beyond the resident cap fails outright.
    Disabled,
    /// Evict the most recently admitted page, unconditionally.
    Lifo,
    /// FIFO with one second chance for pages with the accessed bit set.
    ScFifo,
}

impl PolicyKind {
    pub fn name(self) -> &'static str {
        match self {
            PolicyKind::Disabled => "NONE",
            PolicyKind::Lifo => "LIFO",
            PolicyKind::ScFifo => "SCFIFO",
        }
    }

    pub(crate) fn build(self) -> Box<dyn ReplacementPolicy> {
        match self {
            PolicyKind::Disabled => Box::new(Disabled),
            PolicyKind::Lifo => Box::new(Lifo),
            PolicyKind::ScFifo => Box::new(ScFifo),
        }
    }
}

/// Victim selection and admission over one process's resident set.
pub(crate) trait ReplacementPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Is the resident set tracked at all?
    fn active(&self) -> bool {
        true
    }

    /// Record `va` as resident, stamping it with the next admission
    /// sequence number.
    fn admit(&self, set: &mut alloc::vec::Vec<ResidentPage>, va: u64, next_seq: &mut u64);

    /// Remove and return the victim's virtual page, or `None` when the
    /// policy cannot evict.
    fn select_victim(
        &self,
        set: &mut alloc::vec::Vec<ResidentPage>,
        next_seq: &mut u64,
        space: SpaceId,
        ptes: &dyn PageTableOps,
    ) -> Option<u64>;
}

/// Swapping disabled: nothing is tracked, nothing can be evicted.
struct Disabled;

impl ReplacementPolicy for Disabled {
    fn name(&self) -> &'static str {
        PolicyKind::Disabled.name()
    }

    fn active(&self) -> bool {
        false
    }

    fn admit(&self, _set: &mut alloc::vec::Vec<ResidentPage>, _va: u64, _next_seq: &mut u64) {}

    fn select_victim(
        &self,
        _set: &mut alloc::vec::Vec<ResidentPage>,
        _next_seq: &mut u64,
        _space: SpaceId,
        _ptes: &dyn PageTableOps,
    ) -> Option<u64> {
        None
    }
}

/// Bounded stack: admission pushes, eviction pops the newest admission.
/// O(1) in spirit; no accessed-bit consultation.
struct Lifo;

impl ReplacementPolicy for Lifo {
    fn name(&self) -> &'static str {
        PolicyKind::Lifo.name()
    }

    fn admit(&self, set: &mut alloc::vec::Vec<ResidentPage>, va: u64, next_seq: &mut u64) {
        let seq = *next_seq;
        *next_seq += 1;
        set.push(ResidentPage { va, seq });
    }

    fn select_victim(
        &self,
        set: &mut alloc::vec::Vec<ResidentPage>,
        _next_seq: &mut u64,
        _space: SpaceId,
        _ptes: &dyn PageTableOps,
    ) -> Option<u64> {
        let newest = set
            .iter()
            .enumerate()
            .max_by_key(|(_, page)| page.seq)
            .map(|(i, _)| i)?;
        Some(set.swap_remove(newest).va)
    }
}

/// Second-chance FIFO. Eviction scans from the oldest admission; a page
/// whose accessed bit is set gets the bit cleared and moves to the tail
/// instead of being evicted. The number of chances per eviction is
/// bounded by the set length, so a continuously accessed working set
/// still terminates: once every page has used its chance, the head goes.
struct ScFifo;

impl ReplacementPolicy for ScFifo {
    fn name(&self) -> &'static str {
        PolicyKind::ScFifo.name()
    }

    fn admit(&self, set: &mut alloc::vec::Vec<ResidentPage>, va: u64, next_seq: &mut u64) {
        let seq = *next_seq;
        *next_seq += 1;
        set.push(ResidentPage { va, seq });
    }

    fn select_victim(
        &self,
        set: &mut alloc::vec::Vec<ResidentPage>,
        next_seq: &mut u64,
        space: SpaceId,
        ptes: &dyn PageTableOps,
    ) -> Option<u64> {
        if set.is_empty() {
            return None;
        }
        let chances = set.len();
        for _ in 0..chances {
            let head = set
                .iter()
                .enumerate()
                .min_by_key(|(_, page)| page.seq)
                .map(|(i, _)| i)?;
            let va = set[head].va;
            let accessed = ptes
                .flags(space, va)
                .map(|f| f.contains(PteFlags::ACCESSED))
                .unwrap_or(false);
            if !accessed {
                return Some(set.swap_remove(head).va);
            }
            // One second chance: clear the bit, move to the tail.
            let _ = ptes.clear_flags(space, va, PteFlags::ACCESSED);
            set[head].seq = *next_seq;
            *next_seq += 1;
        }
        // Every page used its chance; evict the current head regardless.
        let head = set
            .iter()
            .enumerate()
            .min_by_key(|(_, page)| page.seq)
            .map(|(i, _)| i)?;
        Some(set.swap_remove(head).va)
    }
}
