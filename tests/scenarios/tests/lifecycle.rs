//! End-to-end lifecycle scenarios: fork, exit, wait, reparenting and
//! kill, running through the real dispatch loop and hand-off protocol.

use std::sync::{Arc, Mutex};

use kivo_kernel::{KernelConfig, KernelError, ProcState};
use kivo_scenarios::harness::{boot, idle_forever};

type Log = Arc<Mutex<Vec<String>>>;

fn log_of() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn push(log: &Log, entry: String) {
    log.lock().unwrap().push(entry);
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[test]
fn fork_exit_wait_reaps_the_child() {
    let sim = boot(KernelConfig::default());
    let k = sim.kernel.clone();
    let host = sim.host.clone();
    let hal = sim.hal.clone();
    let log = log_of();

    let init_pid = k.bootstrap_init("init").unwrap();
    {
        let (k, host, log) = (k.clone(), host.clone(), log.clone());
        host.clone().install_program(init_pid, move || {
            let child = k.fork().unwrap();
            {
                let log = log.clone();
                host.install_program(child, move || {
                    push(&log, "child-ran".into());
                });
            }
            let reaped = k.wait().unwrap();
            push(&log, format!("reaped-{}", reaped));
            idle_forever(&k);
        });
    }

    sim.run_until(20, || {
        entries(&log).iter().any(|e| e.starts_with("reaped"))
    });

    assert_eq!(entries(&log), vec!["child-ran", "reaped-2"]);
    // The child is fully reclaimed: one live record, nothing leaked.
    let snaps = k.snapshot();
    assert_eq!(snaps.len(), 1);
    assert_eq!(snaps[0].pid, 1);
    assert_eq!(hal.swap_file_count(), 0);
    assert_eq!(hal.inode_refs(kivo_kernel::hal::InodeHandle(1)), 1);
}

#[test]
fn wait_blocks_until_the_child_exits() {
    let sim = boot(KernelConfig::default());
    let k = sim.kernel.clone();
    let host = sim.host.clone();
    let log = log_of();

    let init_pid = k.bootstrap_init("init").unwrap();
    {
        let (k, host, log) = (k.clone(), host.clone(), log.clone());
        host.clone().install_program(init_pid, move || {
            let child = k.fork().unwrap();
            {
                let (k2, log) = (k.clone(), log.clone());
                host.install_program(child, move || {
                    push(&log, "child-step-1".into());
                    k2.yield_now();
                    push(&log, "child-step-2".into());
                });
            }
            let reaped = k.wait().unwrap();
            push(&log, format!("reaped-{}", reaped));
            idle_forever(&k);
        });
    }

    // Round 1: init forks and blocks; the child runs its first step and
    // yields.
    sim.kernel.dispatch_round();
    assert_eq!(k.proc_snapshot(1).unwrap().state, ProcState::Sleeping);
    assert_eq!(k.proc_snapshot(2).unwrap().state, ProcState::Runnable);
    assert_eq!(entries(&log), vec!["child-step-1"]);

    // Round 2: the child finishes and exits, waking the parent.
    sim.kernel.dispatch_round();
    assert_eq!(k.proc_snapshot(1).unwrap().state, ProcState::Runnable);
    assert_eq!(k.proc_snapshot(2).unwrap().state, ProcState::Zombie);

    // Round 3: the parent's wait rescans and reaps.
    sim.kernel.dispatch_round();
    assert_eq!(
        entries(&log),
        vec!["child-step-1", "child-step-2", "reaped-2"]
    );
    assert!(k.proc_snapshot(2).is_none());
}

#[test]
fn exit_reparents_children_to_init_and_zombies_wake_its_wait() {
    let sim = boot(KernelConfig::default());
    let k = sim.kernel.clone();
    let host = sim.host.clone();
    let log = log_of();

    let init_pid = k.bootstrap_init("init").unwrap();
    {
        let (k, host, log) = (k.clone(), host.clone(), log.clone());
        host.clone().install_program(init_pid, move || {
            let middle = k.fork().unwrap();
            {
                let (k2, host2) = (k.clone(), host.clone());
                host.install_program(middle, move || {
                    let leaf = k2.fork().unwrap();
                    // The leaf exits immediately; it will be a zombie
                    // by the time its parent exits.
                    host2.install_program(leaf, || {});
                    k2.yield_now();
                });
            }
            loop {
                match k.wait() {
                    Ok(pid) => push(&log, format!("reaped-{}", pid)),
                    Err(_) => k.yield_now(),
                }
            }
        });
    }

    // Round 1: init forks middle and blocks; middle forks leaf and
    // yields; leaf exits (its parent is not yet waiting).
    sim.kernel.dispatch_round();
    assert_eq!(k.proc_snapshot(3).unwrap().state, ProcState::Zombie);
    assert_eq!(k.proc_snapshot(3).unwrap().parent_pid, Some(2));

    // Round 2: middle exits; the zombie leaf is handed to init and
    // init's blocked wait is woken for it.
    sim.kernel.dispatch_round();
    assert_eq!(k.proc_snapshot(3).unwrap().parent_pid, Some(1));

    sim.run_until(10, || entries(&log).len() == 2);
    assert_eq!(entries(&log), vec!["reaped-2", "reaped-3"]);
    assert_eq!(k.snapshot().len(), 1);
}

#[test]
fn kill_wakes_a_sleeping_waiter_and_terminates_cooperatively() {
    let sim = boot(KernelConfig::default());
    let k = sim.kernel.clone();
    let host = sim.host.clone();
    let log = log_of();

    let init_pid = k.bootstrap_init("init").unwrap();
    {
        let (k, host, log) = (k.clone(), host.clone(), log.clone());
        host.clone().install_program(init_pid, move || {
            let worker = k.fork().unwrap();
            {
                let (k2, host2, log) = (k.clone(), host.clone(), log.clone());
                host.install_program(worker, move || {
                    let grand = k2.fork().unwrap();
                    {
                        let k3 = k2.clone();
                        host2.install_program(grand, move || loop {
                            if k3.current_killed() {
                                k3.exit();
                            }
                            k3.yield_now();
                        });
                    }
                    // Blocks: the grandchild never exits on its own.
                    let out = k2.wait();
                    push(&log, format!("worker-wait:{:?}", out));
                });
            }
            loop {
                match k.wait() {
                    Ok(pid) => push(&log, format!("reaped-{}", pid)),
                    Err(_) => k.yield_now(),
                }
            }
        });
    }

    // Let the worker block in wait with the grandchild spinning.
    sim.kernel.dispatch_round();
    assert_eq!(k.proc_snapshot(2).unwrap().state, ProcState::Sleeping);

    // Kill the sleeping worker: it must be forced runnable and its wait
    // must come back with the no-children sentinel.
    k.kill(2).unwrap();
    assert_eq!(k.proc_snapshot(2).unwrap().state, ProcState::Runnable);

    sim.run_until(10, || entries(&log).len() >= 2);
    assert_eq!(
        entries(&log)[0],
        format!("worker-wait:{:?}", Err::<u32, _>(KernelError::NoChildren))
    );
    assert_eq!(entries(&log)[1], "reaped-2");
    // The orphaned grandchild now belongs to init.
    assert_eq!(k.proc_snapshot(3).unwrap().parent_pid, Some(1));

    // Wind the grandchild down the same way.
    k.kill(3).unwrap();
    sim.run_until(10, || entries(&log).len() >= 3);
    assert_eq!(entries(&log)[2], "reaped-3");
    assert_eq!(k.snapshot().len(), 1);
}

#[test]
fn pids_stay_unique_across_fork_exit_churn() {
    let sim = boot(KernelConfig::default());
    let k = sim.kernel.clone();
    let host = sim.host.clone();
    let log = log_of();

    let init_pid = k.bootstrap_init("init").unwrap();
    {
        let (k, host, log) = (k.clone(), host.clone(), log.clone());
        host.clone().install_program(init_pid, move || {
            for _ in 0..5 {
                let child = k.fork().unwrap();
                host.install_program(child, || {});
                let reaped = k.wait().unwrap();
                push(&log, format!("{}", reaped));
            }
            push(&log, "done".into());
            idle_forever(&k);
        });
    }

    sim.run_until(60, || entries(&log).iter().any(|e| e == "done"));

    let reaped: Vec<u32> = entries(&log)
        .iter()
        .filter(|e| *e != "done")
        .map(|e| e.parse().unwrap())
        .collect();
    assert_eq!(reaped, vec![2, 3, 4, 5, 6]);
    // Slots were reused but no pid ever was.
    assert_eq!(k.snapshot().len(), 1);
    assert_eq!(sim.hal.swap_file_count(), 0);
    assert_eq!(sim.hal.inode_refs(kivo_kernel::hal::InodeHandle(1)), 1);
}
