//! Process lifecycle.
//!
//! Allocation, first-process bootstrap, fork, exit, wait and the
//! diagnostic dump. The state machine is the classic one: a slot leaves
//! `Unused` for `Embryo` under the table lock, is fleshed out outside it
//! (the allocator owns an `Embryo` outright), and becomes `Runnable` only
//! when fully formed. Exit leaves a `Zombie` for the parent's wait to
//! reclaim back to `Unused`.

use alloc::boxed::Box;
use alloc::string::String;
use core::fmt::Write as _;
use core::sync::atomic::Ordering;

use crate::config::{KernelConfig, BOOTSTRAP_PIDS, NOFILE, PAGE_SIZE};
use crate::error::KernelError;
use crate::hal::FileHandle;
use crate::process::{Channel, ProcState, TrapFrame};
use crate::Kernel;

impl Kernel {
    /// Find an `Unused` slot, move it to `Embryo`, and equip it with a
    /// pid, swap file (non-bootstrap pids only), kernel stack and a
    /// context primed to enter the trampoline on first dispatch.
    pub(crate) fn alloc_slot(&self) -> Result<usize, KernelError> {
        self.table.lock.acquire();
        let mut found = None;
        for idx in 0..self.table.len() {
            if unsafe { self.table.slot(idx) }.state == ProcState::Unused {
                found = Some(idx);
                break;
            }
        }
        let Some(idx) = found else {
            self.table.lock.release();
            return Err(KernelError::ProcessLimitReached);
        };
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        {
            let rec = unsafe { self.table.slot(idx) };
            rec.state = ProcState::Embryo;
            rec.pid = pid;
        }
        self.table.lock.release();

        // The slot is ours now; the rest happens outside the lock.
        if pid > BOOTSTRAP_PIDS {
            match self.platform.store.create(pid) {
                Ok(file) => unsafe { self.table.slot(idx) }.swap_file = Some(file),
                Err(e) => {
                    self.teardown_embryo(idx);
                    return Err(e);
                }
            }
        }

        let Some(kstack) = self.platform.frames.alloc() else {
            self.teardown_embryo(idx);
            return Err(KernelError::OutOfMemory);
        };
        unsafe { self.table.slot(idx) }.kstack = Some(kstack);

        let ctx = self.platform.ctx.alloc();
        let weak = self.self_ref.clone();
        self.platform.ctx.prime(
            ctx,
            Box::new(move || {
                if let Some(kernel) = weak.upgrade() {
                    kernel.fork_return(pid);
                }
            }),
        );
        unsafe { self.table.slot(idx) }.context = Some(ctx);
        Ok(idx)
    }

    /// Return an `Embryo`'s resources and put the slot back to `Unused`.
    fn teardown_embryo(&self, idx: usize) {
        {
            let rec = unsafe { self.table.slot(idx) };
            if let Some(file) = rec.swap_file.take() {
                self.platform.store.remove(file);
            }
            if let Some(kstack) = rec.kstack.take() {
                self.platform.frames.free(kstack);
            }
            if let Some(ctx) = rec.context.take() {
                self.platform.ctx.free(ctx);
            }
            if let Some(space) = rec.space.take() {
                self.platform.spaces.destroy(space, rec.sz);
            }
        }
        self.table.lock.acquire();
        unsafe { self.table.slot(idx) }.reset();
        self.table.lock.release();
    }

    /// First-dispatch trampoline. Every new context is primed to start
    /// here: release the table lock the scheduler handed over, run the
    /// one-shot boot hook, and transfer to user-mode re-entry. If the
    /// re-entry collaborator ever returns, the process is done.
    fn fork_return(&self, pid: u32) {
        // Still holding the table lock from the scheduler.
        self.table.lock.release();

        if !self.booted.swap(true, Ordering::AcqRel) {
            // Late init that must run in process context, not at boot.
            if let Some(hook) = self.boot_hook.lock().take() {
                hook();
            }
        }

        self.platform.trap.user_enter(pid);
        self.exit();
    }

    /// Set up the first user process and remember it as init.
    pub fn bootstrap_init(&self, name: &str) -> Result<u32, KernelError> {
        let idx = self.alloc_slot()?;

        let space = match self.platform.spaces.create() {
            Ok(space) => space,
            Err(e) => {
                self.teardown_embryo(idx);
                return Err(e);
            }
        };
        if let Err(e) = self.platform.spaces.grow(space, 0, PAGE_SIZE) {
            self.platform.spaces.destroy(space, 0);
            self.teardown_embryo(idx);
            return Err(e);
        }

        let pid = {
            let rec = unsafe { self.table.slot(idx) };
            rec.space = Some(space);
            rec.sz = PAGE_SIZE;
            rec.tf = TrapFrame { pc: 0, sp: PAGE_SIZE as u64, ret: 0 };
            rec.name = String::from(name);
            rec.cwd = Some(self.platform.fs.root());
            rec.pid
        };
        self.admit_resident(idx, 0);

        self.table.lock.acquire();
        unsafe { self.table.slot(idx) }.state = ProcState::Runnable;
        self.init_slot.store(idx, Ordering::Relaxed);
        self.table.lock.release();

        log::info!("bootstrapped {} as pid {}", name, pid);
        Ok(pid)
    }

    /// Create a child of the current process. Returns the child pid to
    /// the caller; the child observes 0 in its return-value slot.
    pub fn fork(&self) -> Result<u32, KernelError> {
        let idx = self.current_slot().expect("fork: no process");
        self.fork_from(idx)
    }

    pub(crate) fn fork_from(&self, parent: usize) -> Result<u32, KernelError> {
        let child = self.alloc_slot()?;

        let (psz, pspace, ppid) = {
            let rec = unsafe { self.table.slot(parent) };
            (rec.sz, rec.space.expect("fork: parent without space"), rec.pid)
        };

        let cspace = match self.platform.spaces.duplicate(pspace, psz) {
            Ok(space) => space,
            Err(e) => {
                self.teardown_embryo(child);
                return Err(e);
            }
        };
        {
            let rec = unsafe { self.table.slot(child) };
            rec.space = Some(cspace);
            rec.sz = psz;
        }

        // Replicate the paging state: both accounting sets by value, the
        // swap file byte for byte. Bootstrap processes have no swap file
        // to replicate.
        if ppid > BOOTSTRAP_PIDS {
            if let Err(e) = self.replicate_swap(parent, child) {
                self.teardown_embryo(child);
                return Err(e);
            }
        }

        let (ptf, pfiles, pcwd, pname, pwp) = {
            let rec = unsafe { self.table.slot(parent) };
            (rec.tf, rec.files, rec.cwd, rec.name.clone(), rec.wp_pages)
        };
        let pid = {
            let rec = unsafe { self.table.slot(child) };
            rec.tf = ptf;
            rec.tf.ret = 0;
            rec.parent = Some(parent);
            rec.wp_pages = pwp;
            for (i, f) in pfiles.iter().enumerate() {
                rec.files[i] = f.map(|file| self.platform.files.dup(file));
            }
            rec.cwd = pcwd.map(|ino| self.platform.fs.dup(ino));
            rec.name = pname;
            rec.pid
        };

        self.table.lock.acquire();
        unsafe { self.table.slot(child) }.state = ProcState::Runnable;
        self.table.lock.release();

        log::debug!("fork: pid {} -> child pid {}", ppid, pid);
        Ok(pid)
    }

    /// Terminate the current process. Never returns; the record stays a
    /// `Zombie` until the parent's wait reclaims it.
    pub fn exit(&self) -> ! {
        let idx = self.current_slot().expect("exit: no process");
        if self.init_slot_idx() == Some(idx) {
            panic!("exit: init exiting");
        }

        // Release the outward-facing resources first; none of this needs
        // the table lock, the record still belongs to us.
        {
            let rec = unsafe { self.table.slot(idx) };
            for i in 0..NOFILE {
                if let Some(file) = rec.files[i].take() {
                    self.platform.files.close(file);
                }
            }
        }
        // The swap file goes away before the guarded cwd release, so a
        // crash inside the guard can never leak it.
        if let Some(file) = unsafe { self.table.slot(idx) }.swap_file.take() {
            self.platform.store.remove(file);
        }
        if let Some(cwd) = unsafe { self.table.slot(idx) }.cwd.take() {
            self.platform.fs.put_guarded(cwd);
        }

        self.table.lock.acquire();

        // Parent might be sleeping in wait.
        if let Some(parent) = unsafe { self.table.slot(idx) }.parent {
            self.wakeup_locked(Channel::proc(parent));
        }

        // Pass abandoned children to init; a child that is already a
        // zombie needs init's wait woken as well.
        let init = self.init_slot_idx().expect("exit: no init process");
        let mut wake_init = false;
        for j in 0..self.table.len() {
            if j == idx {
                continue;
            }
            let rec = unsafe { self.table.slot(j) };
            if rec.parent == Some(idx) {
                rec.parent = Some(init);
                if rec.state == ProcState::Zombie {
                    wake_init = true;
                }
            }
        }
        if wake_init {
            self.wakeup_locked(Channel::proc(init));
        }

        unsafe { self.table.slot(idx) }.state = ProcState::Zombie;
        self.sched();
        panic!("zombie exit");
    }

    /// Wait for a child to exit and reclaim it. Returns the child's pid,
    /// or [`KernelError::NoChildren`] immediately when the caller has no
    /// children or has been killed.
    pub fn wait(&self) -> Result<u32, KernelError> {
        let idx = self.current_slot().expect("wait: no process");

        self.table.lock.acquire();
        loop {
            let mut have_kids = false;
            let mut zombie = None;
            for j in 0..self.table.len() {
                let (parent, state, pid) = {
                    let rec = unsafe { self.table.slot(j) };
                    (rec.parent, rec.state, rec.pid)
                };
                if parent != Some(idx) {
                    continue;
                }
                have_kids = true;
                if state == ProcState::Zombie {
                    zombie = Some((j, pid));
                    break;
                }
            }

            if let Some((j, pid)) = zombie {
                {
                    let rec = unsafe { self.table.slot(j) };
                    if let Some(kstack) = rec.kstack.take() {
                        self.platform.frames.free(kstack);
                    }
                    if let Some(ctx) = rec.context.take() {
                        self.platform.ctx.free(ctx);
                    }
                    if let Some(space) = rec.space.take() {
                        self.platform.spaces.destroy(space, rec.sz);
                    }
                    rec.reset();
                }
                self.table.lock.release();
                return Ok(pid);
            }

            let killed = unsafe { self.table.slot(idx) }.killed;
            if !have_kids || killed {
                self.table.lock.release();
                return Err(KernelError::NoChildren);
            }

            // Block until some child's exit wakes us; wakeups are
            // broadcast, so loop and rescan.
            self.sleep(Channel::proc(idx), &self.table.lock);
        }
    }

    /// Host shim for the descriptor layer (which is outside the core):
    /// install an open file handle into `pid`'s descriptor table.
    pub fn attach_file(&self, pid: u32, file: FileHandle) -> Result<(), KernelError> {
        self.table.lock.acquire();
        for idx in 0..self.table.len() {
            let rec = unsafe { self.table.slot(idx) };
            if rec.state == ProcState::Unused || rec.pid != pid {
                continue;
            }
            let Some(free) = rec.files.iter().position(|f| f.is_none()) else {
                self.table.lock.release();
                return Err(KernelError::TooManyFiles);
            };
            rec.files[free] = Some(file);
            self.table.lock.release();
            return Ok(());
        }
        self.table.lock.release();
        Err(KernelError::NoSuchProcess)
    }

    /// Diagnostic process listing, written through the `log` facade.
    ///
    /// Takes no lock so it stays usable on a wedged machine; the output
    /// may therefore tear.
    pub fn dump(&self) {
        log::info!("replacement policy: {}", self.policy.name());
        for idx in 0..self.table.len() {
            let rec = unsafe { self.table.slot(idx) };
            if rec.state == ProcState::Unused {
                continue;
            }
            let mut line = String::new();
            let _ = write!(
                line,
                "{} {} {} {} {} {} {} {}",
                rec.pid,
                rec.state.name(),
                KernelConfig::pages(rec.sz),
                rec.swapped_pages(),
                rec.wp_pages,
                rec.faults,
                rec.paged_out_total,
                rec.name,
            );
            if rec.state == ProcState::Sleeping {
                if let Some(ctx) = rec.context {
                    for pc in self.platform.ctx.backtrace(ctx).iter().take(10) {
                        let _ = write!(line, " {:#x}", pc);
                    }
                }
            }
            log::info!("{}", line);
        }
        log::info!(
            "{} / {} free pages in the system",
            self.platform.frames.free_frames(),
            self.platform.frames.total_frames()
        );
    }
}
