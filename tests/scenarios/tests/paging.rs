//! Demand paging driven through the real dispatch path: a scheduled
//! process grows past its resident cap, pages out, faults the page back
//! in, and checks the round trip, all from inside its own program.

use std::sync::{Arc, Mutex};

use kivo_kernel::config::PAGE_SIZE;
use kivo_kernel::hal::{PageTableOps, PteFlags};
use kivo_kernel::{FaultOutcome, KernelConfig, PolicyKind};
use kivo_scenarios::harness::{boot, idle_forever};

#[test]
fn scheduled_process_pages_out_and_faults_back_in() {
    let sim = boot(KernelConfig {
        policy: PolicyKind::ScFifo,
        max_resident_pages: 2,
        max_total_pages: 8,
    });
    let k = sim.kernel.clone();
    let host = sim.host.clone();
    let hal = sim.hal.clone();
    let results: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let init_pid = k.bootstrap_init("init").unwrap();
    {
        let (k, host, hal, results) = (k.clone(), host.clone(), hal.clone(), results.clone());
        host.clone().install_program(init_pid, move || {
            // Burn pid 2 so the pager is the first swap-backed process.
            let filler = k.fork().unwrap();
            host.install_program(filler, || {});
            let pager = k.fork().unwrap();
            {
                let (k2, hal, results) = (k.clone(), hal.clone(), results.clone());
                host.install_program(pager, move || {
                    let me = k2.current_pid().unwrap();
                    let space = k2.proc_snapshot(me).unwrap().space.unwrap();
                    let report = |line: String| results.lock().unwrap().push(line);

                    k2.grow_current(2 * PAGE_SIZE as isize).unwrap();
                    hal.write_page(space, PAGE_SIZE as u64, &[0xc3u8; PAGE_SIZE])
                        .unwrap();
                    // Third tracked page: forces one eviction.
                    k2.grow_current(PAGE_SIZE as isize).unwrap();
                    let flags = hal.flags(space, PAGE_SIZE as u64).unwrap();
                    report(format!(
                        "evicted:{}",
                        flags.contains(PteFlags::PAGED_OUT) && !flags.contains(PteFlags::PRESENT)
                    ));

                    let outcome = k2.handle_page_fault(PAGE_SIZE as u64 + 0x40);
                    report(format!("fault:{}", outcome == FaultOutcome::Handled));

                    let mut buf = [0u8; PAGE_SIZE];
                    hal.read_page(space, PAGE_SIZE as u64, &mut buf).unwrap();
                    report(format!("intact:{}", buf == [0xc3u8; PAGE_SIZE]));

                    let snap = k2.proc_snapshot(me).unwrap();
                    report(format!(
                        "accounting:{}",
                        snap.faults == 1
                            && snap.paged_out_total == 2
                            && snap.resident_pages == 2
                            && snap.swapped_pages == 1
                    ));
                });
            }
            while k.wait().is_ok() {}
            results.lock().unwrap().push("reaped-all".into());
            idle_forever(&k);
        });
    }

    sim.run_until(30, || {
        results.lock().unwrap().iter().any(|e| e == "reaped-all")
    });

    let got = results.lock().unwrap().clone();
    assert_eq!(
        got,
        vec![
            "evicted:true",
            "fault:true",
            "intact:true",
            "accounting:true",
            "reaped-all"
        ]
    );
    // Both children are gone; their swap files went with them.
    assert_eq!(k.snapshot().len(), 1);
    assert_eq!(sim.hal.swap_file_count(), 0);
}
