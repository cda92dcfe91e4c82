use std::collections::HashSet;

use super::*;
use crate::init_logger;

const CAPACITY: usize = 4 * PAGE_SIZE;

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

#[test]
fn init() {
    init_logger();
    let pool = PhysicalMemoryPool::<CAPACITY>::init().unwrap();
    assert_eq!(pool.total_pages(), 4);
    assert_eq!(pool.base_address(), 0);
    assert_eq!(pool.root_table_address(), 0x3000);

    let snapshot = pool.snapshot();
    assert_eq!(snapshot.free, vec![0x0000, 0x1000, 0x2000]);
    assert!(snapshot.allocated.is_empty());
    assert_eq!(snapshot.pinned, vec![0x3000]);
    assert!(pool.frame(0x3000).unwrap().flags.contains(FrameFlags::PINNED));
    assert_partition(&pool);
}

#[test]
fn init_rejects_odd_capacity() {
    assert_eq!(
        PhysicalMemoryPool::<{ PAGE_SIZE + 1 }>::init().err(),
        Some(MmError::InvalidInput(PAGE_SIZE as u64 + 1))
    );
    assert_eq!(
        PhysicalMemoryPool::<PAGE_SIZE>::init().err(),
        Some(MmError::InvalidInput(PAGE_SIZE as u64))
    );
}

#[test]
fn acquire_takes_oldest_free_frame() {
    init_logger();
    let pool = PhysicalMemoryPool::<CAPACITY>::init().unwrap();
    let swap = SwapSpace::new();

    let data = pool.acquire_frame(false, &swap).unwrap();
    assert_eq!(data.physical_address, 0x0000);
    assert!(data.flags.contains(FrameFlags::BUSY));

    let table = pool.acquire_frame(true, &swap).unwrap();
    assert_eq!(table.physical_address, 0x1000);
    assert!(table.flags.contains(FrameFlags::PINNED));

    let snapshot = pool.snapshot();
    assert_eq!(snapshot.free, vec![0x2000]);
    assert_eq!(snapshot.allocated, vec![0x0000]);
    assert_eq!(snapshot.pinned, vec![0x3000, 0x1000]);
    assert_partition(&pool);
}

#[test]
fn released_frames_are_reused_last() {
    init_logger();
    let pool = PhysicalMemoryPool::<CAPACITY>::init().unwrap();
    let swap = SwapSpace::new();

    let first = pool.acquire_frame(false, &swap).unwrap();
    pool.release_frame(first.physical_address, false).unwrap();
    assert_eq!(pool.snapshot().free, vec![0x1000, 0x2000, 0x0000]);

    let frame = pool.frame(first.physical_address).unwrap();
    assert!(frame.flags.is_empty());
    assert_eq!(frame.owner, None);

    assert_eq!(pool.acquire_frame(false, &swap).unwrap().physical_address, 0x1000);
    assert_partition(&pool);
}

#[test]
fn release_unaligned_address() {
    let pool = PhysicalMemoryPool::<CAPACITY>::init().unwrap();
    assert_eq!(pool.release_frame(0x1004, false), Err(MmError::InvalidInput(0x1004)));
}

#[test]
fn release_from_empty_list() {
    let pool = PhysicalMemoryPool::<CAPACITY>::init().unwrap();
    assert_eq!(pool.release_frame(0x1000, false), Err(MmError::NoFrameAvailable));
}

#[test]
fn release_from_wrong_list() {
    init_logger();
    let pool = PhysicalMemoryPool::<CAPACITY>::init().unwrap();
    let swap = SwapSpace::new();
    let data = pool.acquire_frame(false, &swap).unwrap();

    assert_eq!(
        pool.release_frame(data.physical_address, true),
        Err(MmError::NoFrameAvailable)
    );
    assert_eq!(pool.release_frame(0x2000, false), Err(MmError::NoFrameAvailable));
    assert_eq!(pool.snapshot().allocated, vec![data.physical_address]);
    assert_partition(&pool);
}

#[test]
fn exhausted_pool_without_victims() {
    init_logger();
    let pool = PhysicalMemoryPool::<CAPACITY>::init().unwrap();
    let swap = SwapSpace::new();
    for _ in 0..3 {
        pool.acquire_frame(true, &swap).unwrap();
    }

    assert_eq!(pool.acquire_frame(false, &swap).err(), Some(MmError::NoFrameAvailable));
    assert!(swap.is_empty());
    assert_partition(&pool);
}

#[test]
fn busy_frames_are_not_evicted() {
    init_logger();
    let pool = PhysicalMemoryPool::<CAPACITY>::init().unwrap();
    let swap = SwapSpace::new();
    for _ in 0..3 {
        pool.acquire_frame(false, &swap).unwrap();
    }

    assert_eq!(pool.acquire_frame(false, &swap).err(), Some(MmError::NoFrameAvailable));
    assert_eq!(pool.snapshot().allocated.len(), 3);
    assert!(swap.is_empty());
}

#[test]
fn stamp_reverse_mapping_clears_busy() {
    init_logger();
    let pool = PhysicalMemoryPool::<CAPACITY>::init().unwrap();
    let swap = SwapSpace::new();
    let data = pool.acquire_frame(false, &swap).unwrap();

    pool.stamp_reverse_mapping(data.physical_address, 9, 0x4000).unwrap();
    let frame = pool.frame(data.physical_address).unwrap();
    assert_eq!(frame.owner, Some(9));
    assert_eq!(frame.virtual_address, Some(0x4000));
    assert!(!frame.flags.contains(FrameFlags::BUSY));

    assert_eq!(
        pool.stamp_reverse_mapping(0x2000, 9, 0x5000),
        Err(MmError::WrongValue(0x2000))
    );
}

#[test]
fn teardown_clean_pool() {
    init_logger();
    let pool = PhysicalMemoryPool::<CAPACITY>::init().unwrap();
    let swap = SwapSpace::new();
    pool.acquire_frame(true, &swap).unwrap();
    assert!(pool.teardown().is_ok());
}

#[test]
fn teardown_with_allocated_frame() {
    init_logger();
    let pool = PhysicalMemoryPool::<CAPACITY>::init().unwrap();
    let swap = SwapSpace::new();
    let data = pool.acquire_frame(false, &swap).unwrap();

    let pool = match pool.teardown() {
        Err((pool, err)) => {
            assert_eq!(err, MmError::DeallocationError(FrameList::Allocated));
            pool
        }
        Ok(()) => panic!("teardown succeeded with an allocated frame"),
    };
    assert_partition(&pool);

    pool.release_frame(data.physical_address, false).unwrap();
    assert!(pool.teardown().is_ok());
}
