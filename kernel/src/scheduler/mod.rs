//! Per-core cooperative scheduler.
//!
//! Each core runs [`Kernel::run_core`], an endless sequence of dispatch
//! rounds. A round scans the table in slot order for a `Runnable` record,
//! installs its address space, marks it `Running` and hands the core over
//! with one context swap. The process eventually changes its own state
//! and swaps back; the round then clears the core's current pointer and
//! keeps scanning. Fairness is strict table order and nothing more; ties
//! between cores are settled by who wins the table lock.
//!
//! The hand-off itself ([`Kernel::sched`]) is the only suspension point a
//! kernel flow of control has. It is entered with the table lock held,
//! interrupts disabled, push_off depth exactly 1, and the record's state
//! already moved away from `Running`; each of these is checked and a
//! violation aborts, because a broken hand-off means corrupted lock or
//! state accounting.

pub mod wait;

use core::sync::atomic::Ordering;

use crate::process::table::NO_PROC;
use crate::process::ProcState;
use crate::Kernel;

impl Kernel {
    /// Endless dispatch loop for the executing core.
    pub fn run_core(&self) -> ! {
        loop {
            self.dispatch_round();
        }
    }

    /// One full table scan, dispatching every `Runnable` record found.
    ///
    /// Exposed separately from [`Kernel::run_core`] so hosted drivers can
    /// step the scheduler.
    pub fn dispatch_round(&self) {
        // Let devices interrupt between rounds; the acquire below
        // disables again.
        self.platform.cpus.intr_enable();

        self.table.lock.acquire();
        for idx in 0..self.table.len() {
            let (state, space, ctx) = {
                let rec = unsafe { self.table.slot(idx) };
                (rec.state, rec.space, rec.context)
            };
            if state != ProcState::Runnable {
                continue;
            }

            // Interrupts are off while the lock is held, so the core id
            // is stable here.
            let cpu = self.platform.cpus.cpu_id();
            let space = space.expect("runnable process without address space");
            let ctx = ctx.expect("runnable process without context");

            self.platform.spaces.activate(space);
            unsafe { self.table.slot(idx) }.state = ProcState::Running;
            self.cores[cpu].current.store(idx, Ordering::Relaxed);

            // The process releases the table lock and reacquires it
            // before swapping back.
            self.platform.ctx.swap(self.cores[cpu].sched_ctx, ctx);

            self.platform.spaces.activate_kernel();
            if unsafe { self.table.slot(idx) }.state == ProcState::Running {
                panic!("scheduler: resumed a running process");
            }
            let cpu = self.platform.cpus.cpu_id();
            self.cores[cpu].current.store(NO_PROC, Ordering::Relaxed);
        }
        self.table.lock.release();
    }

    /// Hand the core back to its scheduler context.
    ///
    /// Must be called with the table lock held (and nothing else),
    /// interrupts disabled, and the current record's state already
    /// changed away from `Running`. The saved interrupt-enable bit
    /// travels with this flow of control, not with the core.
    pub(crate) fn sched(&self) {
        if !self.table.lock.holding() {
            panic!("sched: table lock not held");
        }
        let cpu = self.platform.cpus.cpu_id();
        if self.intr.depth(cpu) != 1 {
            panic!("sched: locks held");
        }
        let idx = self.cores[cpu].current.load(Ordering::Relaxed);
        if idx == NO_PROC {
            panic!("sched: no process");
        }
        let (state, ctx) = {
            let rec = unsafe { self.table.slot(idx) };
            (rec.state, rec.context.expect("process without context"))
        };
        if state == ProcState::Running {
            panic!("sched: running");
        }
        if self.platform.cpus.intr_enabled() {
            panic!("sched: interruptible");
        }

        let intena = self.intr.intena(cpu);
        self.platform.ctx.swap(ctx, self.cores[cpu].sched_ctx);
        // Possibly resumed on a different core.
        let cpu = self.platform.cpus.cpu_id();
        self.intr.set_intena(cpu, intena);
    }

    /// Give up the core for one scheduling round.
    pub fn yield_now(&self) {
        self.table.lock.acquire();
        let idx = self.current_slot().expect("yield: no process");
        unsafe { self.table.slot(idx) }.state = ProcState::Runnable;
        self.sched();
        self.table.lock.release();
    }
}
