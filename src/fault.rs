use log::{error, info};

use crate::{
    error::MmError, frame_pool::PhysicalMemoryPool, swap_space::SwapSpace, ProcessId,
    VirtualAddress,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFault {
    /// `acquire_frame` found the free list empty.
    PoolExhausted,
    /// A table walk met an invalid entry.
    TranslationMiss {
        owner: ProcessId,
        virtual_frame_address: VirtualAddress,
    },
}

/// Routes page faults to the swap space.
///
/// Only the frame pool and the page-table walker raise faults.
pub(crate) struct PageFaultDispatcher<'a, const CAPACITY: usize> {
    pool: &'a PhysicalMemoryPool<CAPACITY>,
    swap: &'a SwapSpace,
}

impl<'a, const CAPACITY: usize> PageFaultDispatcher<'a, CAPACITY> {
    pub(crate) fn new(pool: &'a PhysicalMemoryPool<CAPACITY>, swap: &'a SwapSpace) -> Self {
        Self { pool, swap }
    }

    pub(crate) fn handle(&self, fault: PageFault) -> Result<(), MmError> {
        info!("PAGE FAULT : {:?}", fault);
        let result = match fault {
            PageFault::PoolExhausted => self.swap.evict_victim(self.pool),
            PageFault::TranslationMiss {
                owner,
                virtual_frame_address,
            } => self.swap.restore(owner, virtual_frame_address, self.pool),
        };
        match &result {
            Ok(()) => {
                self.pool.log_lists();
                self.swap.log_blocks();
            }
            Err(err) => error!("Could not handle page fault {:?}, err: {}", fault, err),
        }
        result
    }
}
