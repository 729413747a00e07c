mod common;

use std::{collections::HashSet, thread};

use common::Machine;
use defines::config::PAGE_SIZE;
use vm::{Region, VirtAddr};

const BASE: usize = 0x1000_0000;

fn page(i: usize) -> usize {
    BASE + i * PAGE_SIZE
}

fn pattern(pid: usize, page: usize, round: usize) -> [u8; 32] {
    let tag = (pid * 64 + page * 8 + round) as u8;
    core::array::from_fn(|i| tag.wrapping_add(i as u8))
}

#[test]
fn processes_share_a_small_pool_across_threads() {
    const PROCS: usize = 3;
    const PAGES: usize = 4;
    const ROUNDS: usize = 16;
    let machine = Machine::new(3, 16);

    let procs = thread::scope(|s| {
        let handles: Vec<_> = (1..=PROCS)
            .map(|pid| {
                let proc = machine.spawn(pid);
                let len = PAGES * PAGE_SIZE;
                machine
                    .vm
                    .declare_region(&proc.space, VirtAddr(BASE), len, true, Region::Zeroed)
                    .unwrap();
                s.spawn(move || {
                    for round in 0..ROUNDS {
                        for i in 0..PAGES {
                            assert!(proc.write_bytes(page(i), &pattern(pid, i, round)));
                        }
                        for i in 0..PAGES {
                            let data = proc.read_bytes(page(i), 32).unwrap();
                            assert_eq!(data, pattern(pid, i, round), "process {pid} page {i}");
                        }
                    }
                    proc
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });
    assert!(machine.terminated().is_empty());

    let infos: Vec<_> = procs
        .iter()
        .flat_map(|proc| (0..PAGES).map(|i| proc.space.page_info(VirtAddr(page(i))).unwrap()))
        .collect();
    let slots: Vec<_> = infos.iter().filter_map(|info| info.swap_slot).collect();
    let frames: Vec<_> = infos.iter().filter_map(|info| info.frame).collect();
    assert_eq!(slots.iter().collect::<HashSet<_>>().len(), slots.len());
    assert_eq!(frames.iter().collect::<HashSet<_>>().len(), frames.len());
    for info in &infos {
        assert!(info.frame.is_some() != info.swap_slot.is_some());
    }
    let meminfo = machine.vm.meminfo();
    assert_eq!(meminfo.resident_frames, frames.len());
    assert_eq!(meminfo.swap_used, slots.len());
    assert_eq!(frames.len() + slots.len(), PROCS * PAGES);

    for (proc, pid) in procs.iter().zip(1..) {
        for i in 0..PAGES {
            assert_eq!(
                proc.read_bytes(page(i), 32).unwrap(),
                pattern(pid, i, ROUNDS - 1)
            );
        }
    }
}
