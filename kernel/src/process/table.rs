//! Process table.
//!
//! A fixed-capacity arena of [`ProcessRecord`]s guarded by one coarse
//! [`Spinlock`]. Every state or linkage mutation and every table scan
//! happens under that lock; the lock is also what sleep/wakeup hang off,
//! which is what makes the no-missed-wakeup argument go through.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::AtomicUsize;

use crate::config::{KernelConfig, NOFILE, NPROC};
use crate::hal::{ContextId, FileHandle, InodeHandle, PhysPage, SpaceId, SwapHandle};
use crate::sync::{IntrTable, Spinlock};

/// "No process" marker for per-core current pointers.
pub(crate) const NO_PROC: usize = usize::MAX;

/// Process lifecycle state.
///
/// Transitions: `Unused → Embryo → Runnable ⇄ Running/Sleeping`,
/// `Running → Zombie → Unused`. No record skips `Embryo` or `Zombie`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Free slot.
    Unused,
    /// Allocated, still being set up.
    Embryo,
    /// Ready for dispatch.
    Runnable,
    /// Executing on some core.
    Running,
    /// Blocked on a channel.
    Sleeping,
    /// Exited, awaiting reclamation by the parent.
    Zombie,
}

impl ProcState {
    /// Fixed-width name for the diagnostic dump.
    pub fn name(self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Runnable => "runble",
            ProcState::Running => "run   ",
            ProcState::Sleeping => "sleep ",
            ProcState::Zombie => "zombie",
        }
    }
}

/// Opaque rendezvous value pairing a sleeper with its waker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel(pub u64);

impl Channel {
    /// The channel a process sleeps on while waiting for its children.
    pub(crate) fn proc(slot: usize) -> Channel {
        Channel(slot as u64)
    }
}

/// Minimal saved user-register snapshot. The full frame belongs to the
/// trap layer; the core only carries the pieces fork and the trampoline
/// touch.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    /// User program counter.
    pub pc: u64,
    /// User stack pointer.
    pub sp: u64,
    /// Return-value slot; forced to zero in a fork child.
    pub ret: u64,
}

/// One page of the resident set.
#[derive(Debug, Clone, Copy)]
pub struct ResidentPage {
    pub va: u64,
    /// Admission stamp; orders the set for the replacement policies.
    pub seq: u64,
}

/// One live swap-slot entry: `va`'s contents live at `offset` in the
/// process's swap file.
#[derive(Debug, Clone, Copy)]
pub struct SwapSlot {
    pub va: u64,
    pub offset: u64,
}

/// Per-process control block. One arena slot.
pub struct ProcessRecord {
    pub pid: u32,
    pub state: ProcState,
    /// Parent slot index; `None` for init and free slots.
    pub parent: Option<usize>,
    /// Non-`None` while sleeping.
    pub chan: Option<Channel>,
    pub killed: bool,
    /// Exclusively-owned kernel stack page.
    pub kstack: Option<PhysPage>,
    /// Exclusively-owned saved context.
    pub context: Option<ContextId>,
    /// Exclusively-owned trap-frame snapshot.
    pub tf: TrapFrame,
    pub space: Option<SpaceId>,
    pub files: [Option<FileHandle>; NOFILE],
    pub cwd: Option<InodeHandle>,
    /// Total virtual size in bytes.
    pub sz: usize,
    /// Live resident-set entries; bounded by the resident cap while a
    /// replacement policy is active.
    pub resident: Vec<ResidentPage>,
    /// Fixed-size swap-slot set; an entry's index fixes its file offset.
    pub swap_slots: Vec<Option<SwapSlot>>,
    pub swap_file: Option<SwapHandle>,
    /// Next admission stamp.
    pub next_seq: u64,
    pub faults: u64,
    pub paged_out_total: u64,
    pub wp_pages: u64,
    /// Faulting address of a synthesized protection violation, held for
    /// the trap layer to deliver.
    pub pending_fault: Option<u64>,
    pub name: String,
}

impl ProcessRecord {
    fn unused(max_total_pages: usize) -> Self {
        ProcessRecord {
            pid: 0,
            state: ProcState::Unused,
            parent: None,
            chan: None,
            killed: false,
            kstack: None,
            context: None,
            tf: TrapFrame::default(),
            space: None,
            files: [None; NOFILE],
            cwd: None,
            sz: 0,
            resident: Vec::new(),
            swap_slots: vec![None; max_total_pages],
            swap_file: None,
            next_seq: 0,
            faults: 0,
            paged_out_total: 0,
            wp_pages: 0,
            pending_fault: None,
            name: String::new(),
        }
    }

    /// Zero the record back to a reusable free slot. Owned resources must
    /// already have been returned to their collaborators.
    pub(crate) fn reset(&mut self) {
        let cap = self.swap_slots.len();
        *self = ProcessRecord::unused(cap);
    }

    /// Number of live swap-slot entries.
    pub(crate) fn swapped_pages(&self) -> usize {
        self.swap_slots.iter().filter(|s| s.is_some()).count()
    }

    /// Index of the live swap slot recording `va`, if any.
    pub(crate) fn swap_slot_of(&self, va: u64) -> Option<usize> {
        self.swap_slots
            .iter()
            .position(|s| matches!(s, Some(slot) if slot.va == va))
    }

    /// Index of a free swap slot.
    pub(crate) fn free_swap_slot(&self) -> Option<usize> {
        self.swap_slots.iter().position(|s| s.is_none())
    }
}

/// Per-core scheduling state. The interrupt-disable depth lives in
/// [`IntrTable`]; this record carries what the dispatch loop itself
/// needs.
pub(crate) struct CpuRecord {
    /// Slot index of the process running on this core, or [`NO_PROC`].
    pub current: AtomicUsize,
    /// The core's scheduler context; hand-off swaps against it.
    pub sched_ctx: ContextId,
}

/// The arena and its lock.
///
/// Records live in `UnsafeCell`s: the hand-off protocol passes lock
/// ownership between kernel flows of control, which rules out guard-based
/// access. The contract is the classic one: hold [`ProcessTable::lock`]
/// (or own the slot outright, as the allocator does for an `Embryo`)
/// before touching a record, and never keep a borrow across a hand-off or
/// a lock release.
pub(crate) struct ProcessTable {
    pub lock: Spinlock,
    slots: Vec<UnsafeCell<ProcessRecord>>,
}

// Access is serialized by `lock` per the contract above.
unsafe impl Sync for ProcessTable {}

impl ProcessTable {
    pub(crate) fn new(config: &KernelConfig, intr: Arc<IntrTable>) -> Self {
        ProcessTable {
            lock: Spinlock::new("ptable", intr),
            slots: (0..NPROC)
                .map(|_| UnsafeCell::new(ProcessRecord::unused(config.max_total_pages)))
                .collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Borrow a record mutably.
    ///
    /// # Safety
    ///
    /// The caller must hold [`ProcessTable::lock`] or otherwise own the
    /// slot, and must drop the borrow before any hand-off, lock release,
    /// or further `slot` call that could alias it.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slot(&self, idx: usize) -> &mut ProcessRecord {
        unsafe { &mut *self.slots[idx].get() }
    }
}

/// Point-in-time copy of one record, taken under the table lock.
#[derive(Debug, Clone)]
pub struct ProcSnapshot {
    pub pid: u32,
    pub state: ProcState,
    pub parent_pid: Option<u32>,
    pub name: String,
    pub total_pages: usize,
    pub resident_pages: usize,
    pub swapped_pages: usize,
    pub faults: u64,
    pub paged_out_total: u64,
    pub wp_pages: u64,
    pub killed: bool,
    pub space: Option<SpaceId>,
    pub swap_file: Option<SwapHandle>,
}

impl ProcSnapshot {
    pub(crate) fn of(rec: &ProcessRecord, parent_pid: Option<u32>) -> Self {
        ProcSnapshot {
            pid: rec.pid,
            state: rec.state,
            parent_pid,
            name: rec.name.clone(),
            total_pages: KernelConfig::pages(rec.sz),
            resident_pages: rec.resident.len(),
            swapped_pages: rec.swapped_pages(),
            faults: rec.faults,
            paged_out_total: rec.paged_out_total,
            wp_pages: rec.wp_pages,
            killed: rec.killed,
            space: rec.space,
            swap_file: rec.swap_file,
        }
    }
}
