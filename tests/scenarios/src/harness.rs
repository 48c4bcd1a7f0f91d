//! Thread-backed simulation host.
//!
//! [`SimHost`] implements the context-switch, CPU and trap-return
//! collaborators over OS threads: every saved-context slot is a parking
//! spot, and `swap` moves the simulated CPU from the calling thread to
//! the thread parked on the resume slot. The driving test thread binds
//! itself as core 0 and steps the scheduler with
//! [`Kernel::dispatch_round`]; process bodies are closures registered per
//! pid and entered through the trampoline exactly like user code.
//!
//! Processes that exit stay parked forever (their slot is never resumed);
//! the threads evaporate with the test process.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use kivo_kernel::hal::mem::MemHal;
use kivo_kernel::hal::{ContextId, ContextOps, CpuOps, Platform, TrapReturn};
use kivo_kernel::{Kernel, KernelConfig};

type Body = Box<dyn FnOnce() + Send>;

struct SlotState {
    /// Set when this slot owns the simulated CPU.
    active: bool,
    /// Which core the activation carries.
    cpu: usize,
    /// First-resumption entry (the trampoline), if not yet started.
    entry: Option<Body>,
    spawned: bool,
    /// The kernel freed this context; its thread parks forever.
    dead: bool,
}

struct Slot {
    state: Mutex<SlotState>,
    cv: Condvar,
}

impl Slot {
    fn new() -> Arc<Slot> {
        Arc::new(Slot {
            state: Mutex::new(SlotState {
                active: false,
                cpu: 0,
                entry: None,
                spawned: false,
                dead: false,
            }),
            cv: Condvar::new(),
        })
    }
}

/// Context, CPU and trap-return collaborators backed by threads.
pub struct SimHost {
    slots: Mutex<HashMap<u64, Arc<Slot>>>,
    next_ctx: AtomicU64,
    intr: Vec<AtomicBool>,
    thread_cpu: Mutex<HashMap<thread::ThreadId, usize>>,
    /// Driver threads get a starvation watchdog in `wait_active`.
    drivers: Mutex<HashSet<thread::ThreadId>>,
    programs: Mutex<HashMap<u32, Body>>,
    kernel: Mutex<Weak<Kernel>>,
    self_ref: Weak<SimHost>,
}

impl SimHost {
    pub fn new(cpu_count: usize) -> Arc<SimHost> {
        Arc::new_cyclic(|weak| SimHost {
            slots: Mutex::new(HashMap::new()),
            next_ctx: AtomicU64::new(1),
            intr: (0..cpu_count).map(|_| AtomicBool::new(true)).collect(),
            thread_cpu: Mutex::new(HashMap::new()),
            drivers: Mutex::new(HashSet::new()),
            programs: Mutex::new(HashMap::new()),
            kernel: Mutex::new(Weak::new()),
            self_ref: weak.clone(),
        })
    }

    pub fn set_kernel(&self, kernel: &Arc<Kernel>) {
        *self.kernel.lock().unwrap() = Arc::downgrade(kernel);
    }

    /// Bind the calling thread as the driver of `cpu`.
    pub fn bind_driver(&self, cpu: usize) {
        let id = thread::current().id();
        self.thread_cpu.lock().unwrap().insert(id, cpu);
        self.drivers.lock().unwrap().insert(id);
    }

    /// Register the user program a process runs when it first reaches
    /// user-mode re-entry. Must be installed before the pid is
    /// dispatched.
    pub fn install_program(&self, pid: u32, body: impl FnOnce() + Send + 'static) {
        self.programs.lock().unwrap().insert(pid, Box::new(body));
    }

    fn kernel(&self) -> Arc<Kernel> {
        self.kernel
            .lock()
            .unwrap()
            .upgrade()
            .expect("harness: kernel not attached")
    }

    fn slot(&self, ctx: ContextId) -> Arc<Slot> {
        self.slots
            .lock()
            .unwrap()
            .get(&ctx.0)
            .expect("harness: unknown context")
            .clone()
    }

    fn bind_current_thread(&self, cpu: usize) {
        self.thread_cpu
            .lock()
            .unwrap()
            .insert(thread::current().id(), cpu);
    }

    /// Park until `ctx` is activated, then take over its core.
    ///
    /// Driver threads run under a watchdog: if a dispatched kernel flow
    /// never swaps back (a bug or a panicked process body), the driver
    /// panics instead of wedging the whole test run.
    fn wait_active(&self, ctx: ContextId) {
        let watchdog = self
            .drivers
            .lock()
            .unwrap()
            .contains(&thread::current().id());
        let slot = self.slot(ctx);
        let mut st = slot.state.lock().unwrap();
        loop {
            if st.dead {
                drop(st);
                // Freed while parked (zombie reclaim); never runs again.
                loop {
                    thread::park();
                }
            }
            if st.active {
                break;
            }
            if watchdog {
                let (guard, timeout) = slot
                    .cv
                    .wait_timeout(st, Duration::from_secs(10))
                    .unwrap();
                st = guard;
                if timeout.timed_out() && !st.active && !st.dead {
                    panic!("harness: dispatched flow never returned the core");
                }
            } else {
                st = slot.cv.wait(st).unwrap();
            }
        }
        st.active = false;
        let cpu = st.cpu;
        drop(st);
        self.bind_current_thread(cpu);
    }

    fn first_run(self: Arc<Self>, slot: Arc<Slot>) {
        let entry = {
            let mut st = slot.state.lock().unwrap();
            while !st.active {
                st = slot.cv.wait(st).unwrap();
            }
            st.active = false;
            let cpu = st.cpu;
            self.bind_current_thread(cpu);
            st.entry.take().expect("harness: context without entry")
        };
        entry();
    }
}

impl ContextOps for SimHost {
    fn alloc(&self) -> ContextId {
        let id = self.next_ctx.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().unwrap().insert(id, Slot::new());
        ContextId(id)
    }

    fn prime(&self, ctx: ContextId, entry: Box<dyn FnOnce() + Send>) {
        self.slot(ctx).state.lock().unwrap().entry = Some(entry);
    }

    fn swap(&self, save: ContextId, resume: ContextId) {
        let cpu = self.cpu_id();
        let resume_slot = self.slot(resume);
        {
            let mut st = resume_slot.state.lock().unwrap();
            st.cpu = cpu;
            st.active = true;
            if st.entry.is_some() && !st.spawned {
                st.spawned = true;
                let host = self.self_ref.upgrade().expect("harness: host gone");
                let slot = resume_slot.clone();
                thread::Builder::new()
                    .name(format!("ctx-{}", resume.0))
                    .spawn(move || host.first_run(slot))
                    .expect("harness: spawn");
            }
            resume_slot.cv.notify_all();
        }
        self.wait_active(save);
    }

    fn free(&self, ctx: ContextId) {
        if let Some(slot) = self.slots.lock().unwrap().remove(&ctx.0) {
            let mut st = slot.state.lock().unwrap();
            st.dead = true;
            slot.cv.notify_all();
        }
    }

    fn backtrace(&self, _ctx: ContextId) -> Vec<u64> {
        Vec::new()
    }
}

impl CpuOps for SimHost {
    fn cpu_id(&self) -> usize {
        *self
            .thread_cpu
            .lock()
            .unwrap()
            .get(&thread::current().id())
            .expect("harness: thread not bound to a core")
    }

    fn cpu_count(&self) -> usize {
        self.intr.len()
    }

    fn intr_enable(&self) {
        self.intr[self.cpu_id()].store(true, Ordering::SeqCst);
    }

    fn intr_disable(&self) {
        self.intr[self.cpu_id()].store(false, Ordering::SeqCst);
    }

    fn intr_enabled(&self) -> bool {
        self.intr[self.cpu_id()].load(Ordering::SeqCst)
    }
}

impl TrapReturn for SimHost {
    fn user_enter(&self, pid: u32) {
        let kernel = self.kernel();
        // Cooperative kill: a killed process dies on the way to user
        // mode, before running anything.
        if kernel.current_killed() {
            return;
        }
        let body = self.programs.lock().unwrap().remove(&pid);
        if let Some(body) = body {
            body();
        }
        // Returning hands control back to the trampoline, which exits.
    }
}

/// One booted simulation: in-memory HAL, thread host, kernel.
pub struct Sim {
    pub hal: Arc<MemHal>,
    pub host: Arc<SimHost>,
    pub kernel: Arc<Kernel>,
}

/// Boot a single-core simulation and bind the calling thread as its
/// driver.
pub fn boot(config: KernelConfig) -> Sim {
    let hal = Arc::new(MemHal::new(512));
    let host = SimHost::new(1);
    let platform = Platform {
        frames: hal.clone(),
        spaces: hal.clone(),
        ptes: hal.clone(),
        store: hal.clone(),
        files: hal.clone(),
        fs: hal.clone(),
        ctx: host.clone(),
        cpus: host.clone(),
        trap: host.clone(),
    };
    let kernel = Kernel::new(config, platform);
    host.set_kernel(&kernel);
    host.bind_driver(0);
    Sim { hal, host, kernel }
}

impl Sim {
    /// Step the scheduler until `done` holds, panicking after `max`
    /// rounds so a wedged scenario fails instead of hanging.
    pub fn run_until(&self, max: usize, mut done: impl FnMut() -> bool) {
        for _ in 0..max {
            if done() {
                return;
            }
            self.kernel.dispatch_round();
        }
        if done() {
            return;
        }
        panic!("scenario did not settle within {} rounds", max);
    }
}

/// Idle loop for init-style processes: reap whatever shows up, yield
/// between attempts, never return (init may not exit).
pub fn idle_forever(kernel: &Kernel) -> ! {
    loop {
        let _ = kernel.wait();
        kernel.yield_now();
    }
}
