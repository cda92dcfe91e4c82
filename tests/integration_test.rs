use std::{collections::HashSet, thread};

use mmu_simulator::{
    MemoryManager, MmError, PhysicalAddress, PhysicalMemoryPool, ProcessId, VirtualAddress,
    DEFAULT_MEMORY_CAPACITY, PAGE_SIZE,
};
use rand::Rng;
use serial_test::serial;

/// Root table, three intermediate tables and four data frames.
const CAPACITY: usize = 8 * PAGE_SIZE;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn assert_partition<const C: usize>(pool: &PhysicalMemoryPool<C>) {
    let snapshot = pool.snapshot();
    let all: HashSet<_> = snapshot
        .free
        .iter()
        .chain(&snapshot.allocated)
        .chain(&snapshot.pinned)
        .collect();
    assert_eq!(all.len(), snapshot.total(), "a frame sits on two lists");
    assert_eq!(snapshot.total(), pool.total_pages(), "a frame sits on no list");
}

fn sorted(mut addresses: Vec<PhysicalAddress>) -> Vec<PhysicalAddress> {
    addresses.sort_unstable();
    addresses
}

#[test]
fn partition_holds_across_operations() {
    init_logger();
    let manager = MemoryManager::<CAPACITY>::init().unwrap();
    assert_partition(manager.pool());

    let mut pages = Vec::new();
    for pid in 1..=6 {
        pages.push((pid, manager.get_page(pid).unwrap()));
        assert_partition(manager.pool());
    }
    for (pid, va) in pages.iter().rev() {
        manager.write_bytes(*pid, *va, &pid.to_be_bytes()).unwrap();
        assert_partition(manager.pool());
    }
    for (pid, va) in pages {
        manager.free_page(pid, va).unwrap();
        assert_partition(manager.pool());
    }
    assert!(manager.pool().snapshot().allocated.is_empty());
    assert!(manager.swap_space().is_empty());
}

#[test]
fn get_then_free_restores_pool() {
    init_logger();
    let manager = MemoryManager::<CAPACITY>::init().unwrap();
    // Materialize the page tables so the round trip below allocates none.
    manager.get_page(1).unwrap();

    let before = manager.pool().snapshot();
    let va = manager.get_page(1).unwrap();
    let pa = manager.translate(1, va).unwrap();
    manager.free_page(1, va).unwrap();
    let after = manager.pool().snapshot();

    assert_eq!(after.free.last(), Some(&pa));
    assert_eq!(sorted(after.free), sorted(before.free));
    assert_eq!(after.allocated, before.allocated);
    assert_eq!(after.pinned, before.pinned);

    let leaf = manager.page_table().leaf_entry(va).unwrap().unwrap();
    assert!(!leaf.is_valid());
}

#[test]
fn translation_reaches_bound_frame() {
    init_logger();
    let manager = MemoryManager::<CAPACITY>::init().unwrap();

    for pid in [3, 4, 5] {
        let va = manager.get_page(pid).unwrap();
        let pa = manager.translate(pid, va).unwrap();
        assert_eq!(pa % PAGE_SIZE as u64, 0);

        manager.pool().memory().write_u8(pa + 17, 0x5a + pid as u8).unwrap();
        let mut marker = [0];
        manager.read_bytes(pid, va + 17, &mut marker).unwrap();
        assert_eq!(marker[0], 0x5a + pid as u8);
    }
}

#[test]
fn exhaustion_evicts_exactly_one_page() {
    init_logger();
    let manager = MemoryManager::<CAPACITY>::init().unwrap();

    let pages: Vec<VirtualAddress> = (0..4).map(|_| manager.get_page(1).unwrap()).collect();
    let first_frame = manager.translate(1, pages[0]).unwrap();
    assert!(manager.pool().snapshot().free.is_empty());
    assert!(manager.swap_space().is_empty());

    let fifth = manager.get_page(1).unwrap();

    assert_eq!(manager.swap_space().len(), 1);
    assert!(manager.swap_space().contains(1, pages[0]));
    assert_eq!(manager.translate(1, fifth).unwrap(), first_frame);
    assert_partition(manager.pool());
}

#[test]
fn evicted_page_comes_back_intact() {
    init_logger();
    let manager = MemoryManager::<CAPACITY>::init().unwrap();
    let mut rng = rand::thread_rng();
    let mut payload = vec![0u8; PAGE_SIZE];
    rng.fill(payload.as_mut_slice());

    let victim = manager.get_page(7).unwrap();
    manager.write_bytes(7, victim, &payload).unwrap();
    let others: Vec<_> = (0..4).map(|_| manager.get_page(7).unwrap()).collect();
    assert!(manager.swap_space().contains(7, victim));

    let mut restored = vec![0u8; PAGE_SIZE];
    manager.read_bytes(7, victim, &mut restored).unwrap();
    assert_eq!(restored, payload);
    assert!(!manager.swap_space().contains(7, victim));

    // Making room for the restore evicted the next oldest page.
    assert!(manager.swap_space().contains(7, others[0]));
    assert_eq!(manager.swap_space().len(), 1);
    assert_partition(manager.pool());
}

#[test]
fn double_free_is_rejected() {
    init_logger();
    let manager = MemoryManager::<CAPACITY>::init().unwrap();
    let va = manager.get_page(2).unwrap();
    manager.free_page(2, va).unwrap();

    let free = manager.pool().snapshot().free;
    assert_eq!(manager.free_page(2, va), Err(MmError::WrongValue(va)));
    assert_eq!(manager.pool().snapshot().free, free);
    assert_partition(manager.pool());
}

#[test]
fn free_page_of_swapped_out_page() {
    init_logger();
    let manager = MemoryManager::<CAPACITY>::init().unwrap();
    let pages: Vec<_> = (0..5).map(|_| manager.get_page(1).unwrap()).collect();
    assert!(manager.swap_space().contains(1, pages[0]));

    manager.free_page(1, pages[0]).unwrap();

    assert!(!manager.swap_space().contains(1, pages[0]));
    assert_eq!(manager.free_page(1, pages[0]), Err(MmError::WrongValue(pages[0])));
    assert_partition(manager.pool());
}

#[test]
fn four_data_frames_scenario() {
    init_logger();
    let manager = MemoryManager::<CAPACITY>::init().unwrap();

    let pages: Vec<_> = (0..4).map(|_| manager.get_page(1).unwrap()).collect();
    let allocated = manager.pool().snapshot().allocated;
    assert_eq!(allocated.len(), 4);

    let fifth = manager.get_page(1).unwrap();
    assert!(manager.swap_space().contains(1, pages[0]));
    assert_eq!(manager.pool().snapshot().allocated[3], allocated[0]);

    let free = manager.pool().snapshot().free.len();
    manager.free_page(1, fifth).unwrap();
    assert_eq!(manager.pool().snapshot().free.len(), free + 1);
    assert_partition(manager.pool());
}

#[test]
fn default_capacity_keeps_one_page_resident() {
    init_logger();
    let manager = MemoryManager::<DEFAULT_MEMORY_CAPACITY>::init().unwrap();

    let pages: Vec<_> = (0..5).map(|_| manager.get_page(1).unwrap()).collect();

    // Root and three tables leave a single data frame, so every grant evicts the last.
    assert_eq!(manager.pool().snapshot().allocated.len(), 1);
    assert_eq!(manager.swap_space().len(), 4);
    for va in &pages[..4] {
        assert!(manager.swap_space().contains(1, *va));
    }

    manager.free_page(1, pages[4]).unwrap();
    assert_eq!(manager.pool().snapshot().free.len(), 1);
    assert_partition(manager.pool());
}

#[test]
fn teardown_after_all_pages_freed() {
    init_logger();
    let manager = MemoryManager::<CAPACITY>::init().unwrap();
    let pages: Vec<_> = (0..3).map(|_| manager.get_page(9).unwrap()).collect();
    for va in pages {
        manager.free_page(9, va).unwrap();
    }
    assert!(manager.teardown().is_ok());
}

fn retry<T>(mut op: impl FnMut() -> Result<T, MmError>) -> T {
    for _ in 0..100_000 {
        match op() {
            Ok(value) => return value,
            Err(MmError::NoFrameAvailable) | Err(MmError::WrongValue(_)) => thread::yield_now(),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    panic!("operation did not succeed under contention");
}

#[test]
#[serial]
fn concurrent_grants_share_page_tables() {
    init_logger();
    const THREADS: ProcessId = 4;
    const PAGES: usize = 8;
    let manager = MemoryManager::<{ 64 * PAGE_SIZE }>::init().unwrap();

    let frames: Vec<PhysicalAddress> = thread::scope(|s| {
        let handles: Vec<_> = (1..=THREADS)
            .map(|pid| {
                let manager = &manager;
                s.spawn(move || {
                    let pages: Vec<_> =
                        (0..PAGES).map(|_| manager.get_page(pid).unwrap()).collect();
                    for va in &pages {
                        manager.write_bytes(pid, *va, &pid.to_be_bytes()).unwrap();
                    }
                    pages
                        .iter()
                        .map(|va| {
                            let mut buf = [0; 4];
                            manager.read_bytes(pid, *va, &mut buf).unwrap();
                            assert_eq!(ProcessId::from_be_bytes(buf), pid);
                            manager.translate(pid, *va).unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });

    let distinct: HashSet<_> = frames.iter().collect();
    assert_eq!(distinct.len(), THREADS as usize * PAGES);
    // One table per level, whoever won the race to install it.
    assert_eq!(manager.pool().snapshot().pinned.len(), 4);
    assert!(manager.swap_space().is_empty());
    assert_partition(manager.pool());
}

#[test]
#[serial]
fn concurrent_eviction_keeps_lists_consistent() {
    init_logger();
    const THREADS: ProcessId = 4;
    const PAGES: usize = 4;
    let manager = MemoryManager::<{ 10 * PAGE_SIZE }>::init().unwrap();

    thread::scope(|s| {
        for pid in 1..=THREADS {
            let manager = &manager;
            s.spawn(move || {
                let pages: Vec<_> = (0..PAGES)
                    .map(|_| retry(|| manager.get_page(pid)))
                    .collect();
                for va in pages {
                    retry(|| manager.free_page(pid, va));
                }
            });
        }
    });

    let snapshot = manager.pool().snapshot();
    assert!(snapshot.allocated.is_empty());
    assert!(manager.swap_space().is_empty());
    assert_partition(manager.pool());
    assert!(manager.teardown().is_ok());
}

#[test]
#[serial]
fn concurrent_faults_on_one_swapped_page() {
    init_logger();
    let manager = MemoryManager::<CAPACITY>::init().unwrap();
    let mut payload = [0u8; 64];
    rand::thread_rng().fill(&mut payload);

    let swapped = manager.get_page(1).unwrap();
    manager.write_bytes(1, swapped, &payload).unwrap();
    for _ in 0..4 {
        manager.get_page(1).unwrap();
    }
    assert!(manager.swap_space().contains(1, swapped));

    thread::scope(|s| {
        let readers: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    let mut buf = [0u8; 64];
                    manager.read_bytes(1, swapped, &mut buf).map(|()| buf)
                })
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.join().unwrap(), Ok(payload));
        }
    });

    assert!(!manager.swap_space().contains(1, swapped));
    assert_eq!(manager.swap_space().len(), 1);
    manager.free_page(1, swapped).unwrap();
    assert_partition(manager.pool());
}
