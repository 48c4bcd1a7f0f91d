//! Raw spinlock with per-core interrupt-depth accounting.
//!
//! The process table is guarded by one [`Spinlock`]. Unlike a guard-based
//! mutex, ownership here is a per-*core* property: the context hand-off
//! transfers the held lock from one kernel flow of control to another on
//! the same core, which is exactly what the scheduler protocol requires
//! and what `Mutex` guards cannot express.
//!
//! `push_off`/`pop_off` are matched interrupt-disable operations that
//! nest; the depth and the saved "were interrupts on?" bit live in
//! [`IntrTable`], one record per core.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use crate::hal::CpuOps;

/// No owning core.
const NO_CPU: usize = usize::MAX;

struct CpuLocal {
    /// Depth of push_off nesting.
    noff: AtomicI32,
    /// Were interrupts enabled before the outermost push_off?
    intena: AtomicBool,
}

/// Per-core interrupt-disable bookkeeping, shared by every [`Spinlock`]
/// and by the scheduler's hand-off checks.
pub struct IntrTable {
    cpus: Arc<dyn CpuOps>,
    locals: Vec<CpuLocal>,
}

impl IntrTable {
    pub fn new(cpus: Arc<dyn CpuOps>) -> Self {
        let locals = (0..cpus.cpu_count())
            .map(|_| CpuLocal {
                noff: AtomicI32::new(0),
                intena: AtomicBool::new(false),
            })
            .collect();
        IntrTable { cpus, locals }
    }

    /// Disable interrupts on the executing core and bump the nesting
    /// depth. Returns the core id, which is stable until the matching
    /// [`IntrTable::pop_off`].
    pub fn push_off(&self) -> usize {
        let was_on = self.cpus.intr_enabled();
        self.cpus.intr_disable();
        let cpu = self.cpus.cpu_id();
        let local = &self.locals[cpu];
        if local.noff.load(Ordering::Relaxed) == 0 {
            local.intena.store(was_on, Ordering::Relaxed);
        }
        local.noff.fetch_add(1, Ordering::Relaxed);
        cpu
    }

    /// Undo one [`IntrTable::push_off`], re-enabling interrupts when the
    /// outermost level is popped and they were enabled before it.
    pub fn pop_off(&self) {
        if self.cpus.intr_enabled() {
            panic!("pop_off: interruptible");
        }
        let cpu = self.cpus.cpu_id();
        let local = &self.locals[cpu];
        let depth = local.noff.fetch_sub(1, Ordering::Relaxed) - 1;
        if depth < 0 {
            panic!("pop_off: unbalanced");
        }
        if depth == 0 && local.intena.load(Ordering::Relaxed) {
            self.cpus.intr_enable();
        }
    }

    /// Current push_off depth on `cpu`.
    pub fn depth(&self, cpu: usize) -> i32 {
        self.locals[cpu].noff.load(Ordering::Relaxed)
    }

    /// The saved interrupt-enable bit for `cpu`.
    pub fn intena(&self, cpu: usize) -> bool {
        self.locals[cpu].intena.load(Ordering::Relaxed)
    }

    /// Overwrite the saved interrupt-enable bit for `cpu`. Used by the
    /// hand-off to carry the bit with the kernel flow of control rather
    /// than the core.
    pub fn set_intena(&self, cpu: usize, on: bool) {
        self.locals[cpu].intena.store(on, Ordering::Relaxed);
    }
}

/// A non-reentrant spinlock owned by a core, not a thread.
pub struct Spinlock {
    name: &'static str,
    locked: AtomicBool,
    /// Core currently holding the lock, or [`NO_CPU`].
    owner: AtomicUsize,
    intr: Arc<IntrTable>,
}

impl Spinlock {
    pub fn new(name: &'static str, intr: Arc<IntrTable>) -> Self {
        Spinlock {
            name,
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_CPU),
            intr,
        }
    }

    /// Acquire the lock, spinning until it is free. Interrupts stay
    /// disabled until the matching [`Spinlock::release`].
    pub fn acquire(&self) {
        let cpu = self.intr.push_off();
        if self.owner.load(Ordering::Relaxed) == cpu {
            panic!("acquire: {}", self.name);
        }
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.owner.store(cpu, Ordering::Relaxed);
    }

    /// Release the lock. Panics when the executing core does not hold it.
    pub fn release(&self) {
        if !self.holding() {
            panic!("release: {}", self.name);
        }
        self.owner.store(NO_CPU, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        self.intr.pop_off();
    }

    /// Does the executing core hold this lock?
    pub fn holding(&self) -> bool {
        self.intr.push_off();
        let held = self.locked.load(Ordering::Relaxed)
            && self.owner.load(Ordering::Relaxed) == self.intr.cpus.cpu_id();
        self.intr.pop_off();
        held
    }
}
