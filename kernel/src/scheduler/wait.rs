//! Sleep and wakeup.
//!
//! The blocking primitive behind `wait` and every other in-kernel wait: a
//! sleeper parks on an opaque [`Channel`] and a waker broadcasts to every
//! record parked on the matching value. There is no single-target wake
//! and no timeout; sleepers must loop and recheck their condition, and
//! only a matching wakeup or a kill gets them out.
//!
//! Holding the table lock continuously from condition check to the moment
//! the record is marked `Sleeping` is what closes the missed-wakeup
//! window: wakeup needs the same lock, so it cannot slip in between.

use crate::process::table::NO_PROC;
use crate::process::{Channel, ProcState};
use crate::sync::Spinlock;
use crate::Kernel;

impl Kernel {
    /// Atomically release `guard` and sleep on `chan`; reacquires `guard`
    /// before returning. Wakeups can be spurious; always recheck.
    pub fn sleep(&self, chan: Channel, guard: &Spinlock) {
        let idx = match self.current_slot() {
            Some(idx) => idx,
            None => panic!("sleep: no process"),
        };

        // Move protection from the guard to the table lock. Once the
        // table lock is held no wakeup can be missed, so the guard can
        // be dropped. Skip when the guard *is* the table lock.
        let guard_is_table = core::ptr::eq(guard, &self.table.lock);
        if !guard_is_table {
            self.table.lock.acquire();
            guard.release();
        }

        {
            let rec = unsafe { self.table.slot(idx) };
            rec.chan = Some(chan);
            rec.state = ProcState::Sleeping;
        }
        self.sched();

        // Awake again; tidy up.
        unsafe { self.table.slot(idx) }.chan = None;

        if !guard_is_table {
            self.table.lock.release();
            guard.acquire();
        }
    }

    /// Wake every process sleeping on `chan`.
    pub fn wakeup(&self, chan: Channel) {
        self.table.lock.acquire();
        self.wakeup_locked(chan);
        self.table.lock.release();
    }

    /// Broadcast variant for callers already holding the table lock.
    pub(crate) fn wakeup_locked(&self, chan: Channel) {
        debug_assert!(self.table.lock.holding());
        for idx in 0..self.table.len() {
            let rec = unsafe { self.table.slot(idx) };
            if rec.state == ProcState::Sleeping && rec.chan == Some(chan) {
                rec.state = ProcState::Runnable;
            }
        }
    }

    /// Mark `pid` killed. A sleeping target is forced `Runnable` so it
    /// observes the flag promptly; the actual termination is applied
    /// cooperatively by the trap-return collaborator.
    pub fn kill(&self, pid: u32) -> Result<(), crate::KernelError> {
        self.table.lock.acquire();
        for idx in 0..self.table.len() {
            let rec = unsafe { self.table.slot(idx) };
            if rec.state != ProcState::Unused && rec.pid == pid {
                rec.killed = true;
                if rec.state == ProcState::Sleeping {
                    rec.state = ProcState::Runnable;
                }
                self.table.lock.release();
                return Ok(());
            }
        }
        self.table.lock.release();
        Err(crate::KernelError::NoSuchProcess)
    }

    /// Slot of the designated init process, if bootstrapped.
    pub(crate) fn init_slot_idx(&self) -> Option<usize> {
        let idx = self.init_slot.load(core::sync::atomic::Ordering::Relaxed);
        (idx != NO_PROC).then_some(idx)
    }
}
