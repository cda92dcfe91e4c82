//! A software memory-management unit.
//!
//! Physical memory is one heap buffer cut into 4 KiB frames. Virtual pages are
//! mapped through a four-level page table stored in that buffer, and pages are
//! swapped out to an in-memory swap space when the frames run out.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    thread,
};

use log::{debug, error, info, warn};
use memory::MemoryError;

pub mod error;
pub mod fault;
pub mod frame_pool;
pub mod page_frame;
pub mod page_table;
pub mod swap_space;

pub use error::{FrameList, MmError};
pub use fault::PageFault;
pub use frame_pool::{PhysicalMemoryPool, PoolSnapshot};
pub use page_frame::{FrameFlags, PageFrame};
pub use page_table::{PageTable, PageTableEntry};
pub use swap_space::{SwapBlock, SwapSpace};

use page_frame::{align_down, is_page_aligned, page_offset};

pub const PAGE_SIZE: usize = memory::FRAME_SIZE;
pub const DEFAULT_MEMORY_CAPACITY: usize = 20 * 1024;

pub type PhysicalAddress = u64;
pub type VirtualAddress = u64;
pub type ProcessId = u32;

/// Entry point for callers: hands out virtual pages and translates them.
///
/// Owns the frame pool and the swap space; virtual addresses are handed out
/// from a single counter shared by every process.
pub struct MemoryManager<const CAPACITY: usize> {
    pool: PhysicalMemoryPool<CAPACITY>,
    swap: SwapSpace,
    next_virtual_address: AtomicU64,
}

impl<const CAPACITY: usize> MemoryManager<CAPACITY> {
    pub fn init() -> Result<Self, MmError> {
        Ok(Self {
            pool: PhysicalMemoryPool::init()?,
            swap: SwapSpace::new(),
            next_virtual_address: AtomicU64::new(0),
        })
    }

    pub fn pool(&self) -> &PhysicalMemoryPool<CAPACITY> {
        &self.pool
    }

    pub fn swap_space(&self) -> &SwapSpace {
        &self.swap
    }

    pub fn page_table(&self) -> PageTable<'_, CAPACITY> {
        PageTable::new(&self.pool, &self.swap)
    }

    /// Maps a zeroed frame at the next virtual address and returns that address.
    pub fn get_page(&self, owner: ProcessId) -> Result<VirtualAddress, MmError> {
        let frame = self.pool.acquire_frame(false, &self.swap)?;
        let physical_address = frame.physical_address;
        let virtual_address = self
            .next_virtual_address
            .fetch_add(PAGE_SIZE as u64, Ordering::Relaxed);

        let mapped = self
            .pool
            .memory()
            .zero_frame(physical_address)
            .map_err(MmError::from)
            .and_then(|()| self.page_table().map(owner, virtual_address, physical_address));

        if let Err(err) = mapped {
            error!(
                "Could not map {:#x} for pid {}, err: {}",
                virtual_address, owner, err
            );
            if let Err(release_err) = self.pool.release_frame(physical_address, false) {
                warn!(
                    "Page frame {:#x} could not be returned, err: {}",
                    physical_address, release_err
                );
            }
            return Err(err);
        }

        info!(
            "GET PAGE : pid:{}, virtual addr:{:#x} -> page frame addr:{:#x}",
            owner, virtual_address, physical_address
        );
        Ok(virtual_address)
    }

    /// Unmaps the page at `virtual_address` and returns its frame to `free`.
    ///
    /// A page that sits in swap is faulted back in first. The frame released is
    /// the one the leaf maps at the moment it is invalidated, looked up under
    /// the pool lock; a page that moves in the meantime is looked up again.
    pub fn free_page(
        &self,
        owner: ProcessId,
        virtual_address: VirtualAddress,
    ) -> Result<(), MmError> {
        if !is_page_aligned(virtual_address) {
            error!("free_page needs a page aligned address, got {:#x}", virtual_address);
            return Err(MmError::InvalidInput(virtual_address));
        }

        loop {
            match self.translate(owner, virtual_address) {
                Ok(_) => {}
                Err(MmError::SwapSpaceError { .. }) => {
                    error!(
                        "Page {:#x} of pid {} is neither mapped nor swapped out",
                        virtual_address, owner
                    );
                    return Err(MmError::WrongValue(virtual_address));
                }
                Err(err) => return Err(err),
            }

            let page_table = self.page_table();
            if let Some(physical_address) =
                self.pool.unmap_and_release(&page_table, owner, virtual_address)?
            {
                info!(
                    "FREE PAGE : pid:{}, virtual addr:{:#x}, page frame addr:{:#x}",
                    owner, virtual_address, physical_address
                );
                return Ok(());
            }
            debug!(
                "Page {:#x} of pid {} moved while being freed, looking again",
                virtual_address, owner
            );
            thread::yield_now();
        }
    }

    pub fn translate(
        &self,
        owner: ProcessId,
        virtual_address: VirtualAddress,
    ) -> Result<PhysicalAddress, MmError> {
        self.page_table().translate(owner, virtual_address)
    }

    /// Runs `access` on the physical address of `virtual_address` while the
    /// backing frame is held BUSY, so it is neither evicted nor freed during
    /// the access.
    fn with_frame<T>(
        &self,
        owner: ProcessId,
        virtual_address: VirtualAddress,
        len: usize,
        dirty: bool,
        access: impl FnOnce(PhysicalAddress) -> Result<T, MemoryError>,
    ) -> Result<T, MmError> {
        if page_offset(virtual_address) as usize + len > PAGE_SIZE {
            error!(
                "Access of {} bytes at {:#x} crosses a page boundary",
                len, virtual_address
            );
            return Err(MmError::InvalidInput(virtual_address));
        }

        let page = align_down(virtual_address);
        let frame = loop {
            self.translate(owner, page)?;
            if let Some(frame) = self.pool.pin_mapping(&self.page_table(), owner, page)? {
                break frame;
            }
            thread::yield_now();
        };

        let result = access(frame + page_offset(virtual_address));
        self.pool.unpin_mapping(frame, dirty && result.is_ok());
        result.map_err(MmError::from)
    }

    /// Reads `buf.len()` bytes at `virtual_address`, within one page.
    pub fn read_bytes(
        &self,
        owner: ProcessId,
        virtual_address: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), MmError> {
        let memory = self.pool.memory();
        self.with_frame(owner, virtual_address, buf.len(), false, |address| {
            memory.read_bytes(address, buf)
        })
    }

    /// Writes `bytes` at `virtual_address`, within one page, and marks the frame dirty.
    pub fn write_bytes(
        &self,
        owner: ProcessId,
        virtual_address: VirtualAddress,
        bytes: &[u8],
    ) -> Result<(), MmError> {
        let memory = self.pool.memory();
        self.with_frame(owner, virtual_address, bytes.len(), true, |address| {
            memory.write_bytes(address, bytes)
        })
    }

    /// Releases the pool; fails, handing the manager back, while pages are mapped.
    pub fn teardown(self) -> Result<(), (Self, MmError)> {
        let Self {
            pool,
            swap,
            next_virtual_address,
        } = self;

        match pool.teardown() {
            Ok(()) => {
                if !swap.is_empty() {
                    warn!("Discarding {} swap blocks", swap.len());
                }
                Ok(())
            }
            Err((pool, err)) => Err((
                Self {
                    pool,
                    swap,
                    next_virtual_address,
                },
                err,
            )),
        }
    }
}

#[cfg(test)]
pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
