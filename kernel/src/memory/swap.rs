//! Swap subsystem and page-fault handling.
//!
//! Keeps the illusion of unbounded virtual size over a bounded resident
//! cap. Whenever admission would push a process past the cap, victims
//! chosen by the active policy are written to the process's private swap
//! file, their entries flipped to paged-out, and the backing frames
//! released. A later fault on such a page copies the bytes back and
//! re-admits it.
//!
//! All swap I/O touches only the faulting process's own file and
//! accounting arrays, so the I/O itself runs without the table lock; the
//! numbers may never drift: a paged-out page without a live swap slot
//! is accounting corruption and aborts.

use crate::config::{KernelConfig, PAGE_SIZE};
use crate::error::KernelError;
use crate::hal::PteFlags;
use crate::process::table::SwapSlot;
use crate::Kernel;

/// What the trap layer should do with a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page was restored from swap; retry the access.
    Handled,
    /// Not a swap fault; the trap layer decides (deliver the pending
    /// fault, kill, or panic as it sees fit).
    Unhandled,
}

impl Kernel {
    /// Does paging apply to this process? Bootstrap processes own no
    /// swap file and are exempt, as is everything when the policy is
    /// disabled.
    fn paged(&self, idx: usize) -> bool {
        self.policy.active() && unsafe { self.table.slot(idx) }.swap_file.is_some()
    }

    /// Record `va` in the resident set (no-op for exempt processes).
    pub(crate) fn admit_resident(&self, idx: usize, va: u64) {
        if !self.paged(idx) {
            return;
        }
        let rec = unsafe { self.table.slot(idx) };
        self.policy.admit(&mut rec.resident, va, &mut rec.next_seq);
    }

    /// Evict until the resident set is below the cap.
    fn make_room(&self, idx: usize) -> Result<(), KernelError> {
        while unsafe { self.table.slot(idx) }.resident.len() >= self.config.max_resident_pages {
            self.evict_one(idx)?;
        }
        Ok(())
    }

    /// Pick one victim and page it out: write the page to a free swap
    /// slot, flip the entry to paged-out, release the frame.
    fn evict_one(&self, idx: usize) -> Result<(), KernelError> {
        let space = unsafe { self.table.slot(idx) }
            .space
            .expect("evict: no address space");

        let victim = {
            let rec = unsafe { self.table.slot(idx) };
            self.policy
                .select_victim(&mut rec.resident, &mut rec.next_seq, space, &*self.platform.ptes)
        };
        let Some(va) = victim else {
            return Err(KernelError::OutOfMemory);
        };

        let (file, slot_i) = {
            let rec = unsafe { self.table.slot(idx) };
            let file = rec.swap_file.expect("evict: no swap file");
            let slot_i = rec.free_swap_slot().expect("evict: swap slots exhausted");
            (file, slot_i)
        };
        let offset = (slot_i * PAGE_SIZE) as u64;

        let mut buf = [0u8; PAGE_SIZE];
        self.platform.ptes.read_page(space, va, &mut buf)?;
        self.platform.store.write_at(file, offset, &buf)?;
        self.platform.ptes.set_flags(space, va, PteFlags::PAGED_OUT)?;
        self.platform.ptes.clear_flags(space, va, PteFlags::PRESENT)?;
        self.platform.ptes.release_frame(space, va)?;

        {
            let rec = unsafe { self.table.slot(idx) };
            rec.swap_slots[slot_i] = Some(SwapSlot { va, offset });
            rec.paged_out_total += 1;
        }
        log::debug!("paged out va {:#x} to slot {}", va, slot_i);
        Ok(())
    }

    /// Page-fault entry point, invoked by the trap layer with the
    /// faulting virtual address.
    pub fn handle_page_fault(&self, addr: u64) -> FaultOutcome {
        let Some(idx) = self.current_slot() else {
            return FaultOutcome::Unhandled;
        };
        let va = addr & !(PAGE_SIZE as u64 - 1);
        let Some(space) = unsafe { self.table.slot(idx) }.space else {
            return FaultOutcome::Unhandled;
        };
        let Ok(flags) = self.platform.ptes.flags(space, va) else {
            return FaultOutcome::Unhandled;
        };

        // A write to a page that is read-only and *not* paged out is a
        // genuine protection violation: park it for the trap layer.
        if !flags.contains(PteFlags::WRITABLE) && !flags.contains(PteFlags::PAGED_OUT) {
            unsafe { self.table.slot(idx) }.pending_fault = Some(addr);
            log::warn!("protection violation at {:#x}", addr);
            return FaultOutcome::Unhandled;
        }
        if !self.policy.active() {
            return FaultOutcome::Unhandled;
        }
        if !flags.contains(PteFlags::PAGED_OUT) {
            // Present and writable, or simply unknown. Not ours.
            return FaultOutcome::Unhandled;
        }

        match self.restore_page(idx, space, va, flags) {
            Ok(()) => FaultOutcome::Handled,
            Err(e) => {
                log::warn!("page restore failed at {:#x}: {}", va, e);
                FaultOutcome::Unhandled
            }
        }
    }

    /// Copy a paged-out page back in and re-admit it.
    fn restore_page(
        &self,
        idx: usize,
        space: crate::hal::SpaceId,
        va: u64,
        flags: PteFlags,
    ) -> Result<(), KernelError> {
        let file = unsafe { self.table.slot(idx) }
            .swap_file
            .expect("restore: paged-out page without swap file");

        unsafe { self.table.slot(idx) }.faults += 1;

        self.platform.ptes.attach_frame(space, va)?;
        self.platform.ptes.clear_flags(space, va, PteFlags::PAGED_OUT)?;
        self.platform.ptes.set_flags(space, va, PteFlags::PRESENT)?;
        self.platform.spaces.activate(space);

        // A read-only page must be forced writable for the copy; the
        // transient marker keeps the original permission from being lost.
        let was_protected = !flags.contains(PteFlags::WRITABLE);
        if was_protected {
            self.platform
                .ptes
                .set_flags(space, va, PteFlags::WRITABLE | PteFlags::WAS_PROTECTED)?;
        }

        let slot_i = match unsafe { self.table.slot(idx) }.swap_slot_of(va) {
            Some(slot_i) => slot_i,
            None => panic!("restore: no swap slot for va {:#x}", va),
        };
        let offset = (slot_i * PAGE_SIZE) as u64;
        let mut buf = [0u8; PAGE_SIZE];
        self.platform.store.read_at(file, offset, &mut buf)?;
        self.platform.ptes.write_page(space, va, &buf)?;
        unsafe { self.table.slot(idx) }.swap_slots[slot_i] = None;

        if was_protected {
            self.platform
                .ptes
                .clear_flags(space, va, PteFlags::WRITABLE | PteFlags::WAS_PROTECTED)?;
        }

        // Concurrent growth may have filled the set back up while the
        // page was off-line; make room, then admit the restored page.
        self.make_room(idx)?;
        self.admit_resident(idx, va);
        log::debug!("restored va {:#x} from slot {}", va, slot_i);
        Ok(())
    }

    /// Grow or shrink the current process by `n` bytes.
    pub fn grow_current(&self, n: isize) -> Result<usize, KernelError> {
        let idx = self.current_slot().expect("growproc: no process");
        let new_sz = self.grow_proc(idx, n)?;
        if let Some(space) = unsafe { self.table.slot(idx) }.space {
            self.platform.spaces.activate(space);
        }
        Ok(new_sz)
    }

    pub(crate) fn grow_proc(&self, idx: usize, n: isize) -> Result<usize, KernelError> {
        let (sz, space) = {
            let rec = unsafe { self.table.slot(idx) };
            (rec.sz, rec.space.expect("growproc: no address space"))
        };

        if n == 0 {
            return Ok(sz);
        }

        if n < 0 {
            let target = sz.saturating_sub(n.unsigned_abs());
            let new_sz = self.platform.spaces.shrink(space, sz, target);
            let rec = unsafe { self.table.slot(idx) };
            rec.sz = new_sz;
            rec.resident.retain(|p| (p.va as usize) < new_sz);
            for slot in rec.swap_slots.iter_mut() {
                if matches!(slot, Some(e) if (e.va as usize) >= new_sz) {
                    *slot = None;
                }
            }
            return Ok(new_sz);
        }

        let target = sz + n as usize;
        if KernelConfig::pages(target) > self.config.max_total_pages {
            return Err(KernelError::SizeLimitExceeded);
        }

        if !self.paged(idx) {
            // No swapping available: with the policy disabled, anything
            // past the resident cap fails outright.
            if !self.policy.active()
                && KernelConfig::pages(target) > self.config.max_resident_pages
            {
                return Err(KernelError::OutOfMemory);
            }
            self.platform.spaces.grow(space, sz, target)?;
            unsafe { self.table.slot(idx) }.sz = target;
            return Ok(target);
        }

        // Page-granularity steps: make room under the cap, grow one
        // page, admit it, repeat.
        let first_new_page = KernelConfig::pages(sz);
        let mut cur = sz;
        for page_no in first_new_page..KernelConfig::pages(target) {
            let step = core::cmp::min(target, (page_no + 1) * PAGE_SIZE);
            let grown = self
                .make_room(idx)
                .and_then(|()| self.platform.spaces.grow(space, cur, step));
            if let Err(e) = grown {
                // Unwind this growth; pages already evicted stay evicted.
                self.platform.spaces.shrink(space, cur, sz);
                let rec = unsafe { self.table.slot(idx) };
                rec.resident
                    .retain(|p| (p.va as usize) < first_new_page * PAGE_SIZE);
                return Err(e);
            }
            self.admit_resident(idx, (page_no * PAGE_SIZE) as u64);
            cur = step;
        }
        unsafe { self.table.slot(idx) }.sz = target;
        Ok(target)
    }

    /// Fork-time replication: copy both accounting sets by value and the
    /// parent's swap file byte for byte, in page-sized chunks.
    pub(crate) fn replicate_swap(&self, parent: usize, child: usize) -> Result<(), KernelError> {
        let (pfile, resident, slots, next_seq) = {
            let rec = unsafe { self.table.slot(parent) };
            (
                rec.swap_file.expect("fork: parent without swap file"),
                rec.resident.clone(),
                rec.swap_slots.clone(),
                rec.next_seq,
            )
        };
        let cfile = {
            let rec = unsafe { self.table.slot(child) };
            rec.resident = resident;
            rec.swap_slots = slots;
            rec.next_seq = next_seq;
            rec.swap_file.expect("fork: child without swap file")
        };

        let size = self.platform.store.size(pfile);
        let mut buf = [0u8; PAGE_SIZE];
        let mut offset = 0u64;
        while offset < size {
            let chunk = core::cmp::min(PAGE_SIZE as u64, size - offset) as usize;
            self.platform.store.read_at(pfile, offset, &mut buf[..chunk])?;
            self.platform.store.write_at(cfile, offset, &buf[..chunk])?;
            offset += chunk as u64;
        }
        Ok(())
    }
}
