//! KIVO kernel core.
//!
//! The process-management and demand-paging core of a small SMP teaching
//! kernel: the process table and its lifecycle state machine, the
//! per-core cooperative scheduler with an explicit context hand-off
//! protocol, channel-keyed sleep/wakeup, and a pluggable page-replacement
//! engine backing a per-process swap file.
//!
//! Hardware, page tables, the filesystem and raw context switching are
//! consumed through the collaborator traits in [`hal`]; the core itself
//! is freestanding. [`hal::mem::MemHal`] implements the collaborators in
//! memory so the whole core runs hosted.
//!
//! ```no_run
//! use std::sync::Arc;
//! use kivo_kernel::{hal::mem::MemHal, hal::Platform, Kernel, KernelConfig};
//!
//! let hal = Arc::new(MemHal::new(256));
//! let kernel = Kernel::new(KernelConfig::default(), Platform::from_host(hal));
//! kernel.bootstrap_init("init").unwrap();
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod hal;
pub mod memory;
pub mod process;
pub mod scheduler;
pub mod sync;

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::hal::Platform;
use crate::memory::policy::ReplacementPolicy;
use crate::process::table::{CpuRecord, ProcessTable, NO_PROC};
use crate::sync::IntrTable;

pub use crate::config::KernelConfig;
pub use crate::error::KernelError;
pub use crate::memory::policy::PolicyKind;
pub use crate::memory::swap::FaultOutcome;
pub use crate::process::{Channel, ProcSnapshot, ProcState};

/// The kernel core: table, cores, policy, and the collaborator bundle.
///
/// Constructed once per machine (or per test) and shared as an `Arc`;
/// every exposed operation takes `&self` and applies its own locking.
pub struct Kernel {
    config: KernelConfig,
    platform: Platform,
    intr: Arc<IntrTable>,
    table: ProcessTable,
    cores: Vec<CpuRecord>,
    policy: Box<dyn ReplacementPolicy>,
    next_pid: AtomicU32,
    /// Slot of the designated init process, once bootstrapped.
    init_slot: AtomicUsize,
    /// One-shot hook run by the first trampoline entry (late filesystem
    /// init in a full system).
    boot_hook: spin::Mutex<Option<Box<dyn FnOnce() + Send>>>,
    booted: AtomicBool,
    self_ref: Weak<Kernel>,
}

impl Kernel {
    /// Build a kernel over `platform`, with the replacement policy and
    /// paging caps fixed by `config`.
    pub fn new(config: KernelConfig, platform: Platform) -> Arc<Kernel> {
        let intr = Arc::new(IntrTable::new(platform.cpus.clone()));
        let cores = (0..platform.cpus.cpu_count())
            .map(|_| CpuRecord {
                current: AtomicUsize::new(NO_PROC),
                sched_ctx: platform.ctx.alloc(),
            })
            .collect();
        let table = ProcessTable::new(&config, intr.clone());
        let policy = config.policy.build();
        Arc::new_cyclic(|weak| Kernel {
            config,
            platform,
            intr,
            table,
            cores,
            policy,
            next_pid: AtomicU32::new(1),
            init_slot: AtomicUsize::new(NO_PROC),
            boot_hook: spin::Mutex::new(None),
            booted: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Install the one-shot hook the first trampoline entry runs.
    pub fn set_boot_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.boot_hook.lock() = Some(hook);
    }

    /// Slot index of the process running on the executing core.
    ///
    /// Interrupts are disabled around the per-core read so the core
    /// identity cannot change mid-lookup.
    pub(crate) fn current_slot(&self) -> Option<usize> {
        self.intr.push_off();
        let cpu = self.platform.cpus.cpu_id();
        let cur = self.cores[cpu].current.load(Ordering::Relaxed);
        self.intr.pop_off();
        (cur != NO_PROC).then_some(cur)
    }

    /// Pid of the process running on the executing core.
    pub fn current_pid(&self) -> Option<u32> {
        // A process's own pid is stable while it runs; no lock needed.
        self.current_slot().map(|i| unsafe { self.table.slot(i) }.pid)
    }

    /// Has the current process been marked killed?
    pub fn current_killed(&self) -> bool {
        let Some(idx) = self.current_slot() else {
            return false;
        };
        self.table.lock.acquire();
        let killed = unsafe { self.table.slot(idx) }.killed;
        self.table.lock.release();
        killed
    }

    /// Take the synthesized protection fault pending against the current
    /// process, if any. Consumed by the trap layer on its way back to
    /// user mode.
    pub fn take_pending_fault(&self) -> Option<u64> {
        let idx = self.current_slot()?;
        unsafe { self.table.slot(idx) }.pending_fault.take()
    }

    /// Point-in-time copy of every live record, taken under the table
    /// lock.
    pub fn snapshot(&self) -> Vec<ProcSnapshot> {
        self.table.lock.acquire();
        let mut out = Vec::new();
        for idx in 0..self.table.len() {
            let (state, parent) = {
                let rec = unsafe { self.table.slot(idx) };
                (rec.state, rec.parent)
            };
            if state == ProcState::Unused {
                continue;
            }
            let parent_pid = parent.map(|p| unsafe { self.table.slot(p) }.pid);
            let rec = unsafe { self.table.slot(idx) };
            out.push(ProcSnapshot::of(rec, parent_pid));
        }
        self.table.lock.release();
        out
    }

    /// Snapshot of one live process by pid.
    pub fn proc_snapshot(&self, pid: u32) -> Option<ProcSnapshot> {
        self.snapshot().into_iter().find(|s| s.pid == pid)
    }

    /// Pretend `idx` is running on core 0. Test scaffolding for paths
    /// that act on the current process.
    #[cfg(test)]
    pub(crate) fn test_set_current(&self, idx: Option<usize>) {
        self.cores[0]
            .current
            .store(idx.unwrap_or(NO_PROC), Ordering::Relaxed);
    }
}
