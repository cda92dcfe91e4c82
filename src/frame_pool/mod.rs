#[cfg(test)]
mod tests;

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError, TryLockError},
};

use log::{debug, error, info, log_enabled, Level};
use memory::PhysicalMemory;

use crate::{
    error::{FrameList, MmError},
    fault::{PageFault, PageFaultDispatcher},
    page_frame::{is_page_aligned, FrameFlags, PageFrame},
    page_table::PageTable,
    swap_space::SwapSpace,
    PhysicalAddress, ProcessId, VirtualAddress, PAGE_SIZE,
};

/// Frame arena plus the three ownership lists, stored as arena indices.
///
/// Every index in `0..frames.len()` is on exactly one of `free`, `allocated`
/// and `pinned`.
#[derive(Debug)]
pub(crate) struct FrameLists {
    frames: Vec<PageFrame>,
    free: VecDeque<usize>,
    allocated: VecDeque<usize>,
    pinned: VecDeque<usize>,
}

impl FrameLists {
    fn list(&self, list: FrameList) -> &VecDeque<usize> {
        match list {
            FrameList::Free => &self.free,
            FrameList::Allocated => &self.allocated,
            FrameList::Pinned => &self.pinned,
        }
    }

    fn list_mut(&mut self, list: FrameList) -> &mut VecDeque<usize> {
        match list {
            FrameList::Free => &mut self.free,
            FrameList::Allocated => &mut self.allocated,
            FrameList::Pinned => &mut self.pinned,
        }
    }

    pub(crate) fn frame(&self, index: usize) -> &PageFrame {
        &self.frames[index]
    }

    fn take_free(&mut self, pinned: bool) -> Option<PageFrame> {
        let index = self.free.pop_front()?;
        let frame = &mut self.frames[index];
        if pinned {
            frame.flags.insert(FrameFlags::PINNED);
            self.pinned.push_back(index);
        } else {
            frame.flags.insert(FrameFlags::BUSY);
            self.allocated.push_back(index);
        }
        Some(self.frames[index].clone())
    }

    /// `(position, index)` of every allocated frame whose mapping is settled,
    /// oldest first.
    pub(crate) fn settled_allocated(&self) -> Vec<(usize, usize)> {
        self.allocated
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, index)| !self.frames[*index].flags.contains(FrameFlags::BUSY))
            .collect()
    }

    pub(crate) fn allocated_at(&self, position: usize) -> Option<usize> {
        self.allocated.get(position).copied()
    }

    pub(crate) fn is_allocated_empty(&self) -> bool {
        self.allocated.is_empty()
    }

    /// Moves the frame at `position` of `from` to the tail of `free`.
    pub(crate) fn move_to_free(&mut self, from: FrameList, position: usize) -> Option<usize> {
        let index = self.list_mut(from).remove(position)?;
        self.frames[index].clear();
        self.free.push_back(index);
        Some(index)
    }

    fn position_of(&self, list: FrameList, address: PhysicalAddress) -> Option<usize> {
        self.list(list)
            .iter()
            .position(|index| self.frames[*index].physical_address == address)
    }

    fn addresses(&self, list: FrameList) -> Vec<PhysicalAddress> {
        self.list(list)
            .iter()
            .map(|index| self.frames[*index].physical_address)
            .collect()
    }
}

/// Physical addresses on each list, in list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub free: Vec<PhysicalAddress>,
    pub allocated: Vec<PhysicalAddress>,
    pub pinned: Vec<PhysicalAddress>,
}

impl PoolSnapshot {
    pub fn total(&self) -> usize {
        self.free.len() + self.allocated.len() + self.pinned.len()
    }
}

/// The simulated physical memory cut into page frames.
///
/// The last frame is the root page table and stays pinned for the lifetime of
/// the pool. All list mutation and membership reads go through `lists`.
pub struct PhysicalMemoryPool<const CAPACITY: usize> {
    memory: PhysicalMemory<CAPACITY>,
    base_address: PhysicalAddress,
    total_pages: usize,
    root_table_address: PhysicalAddress,
    lists: Mutex<FrameLists>,
}

impl<const CAPACITY: usize> PhysicalMemoryPool<CAPACITY> {
    pub fn init() -> Result<Self, MmError> {
        if CAPACITY % PAGE_SIZE != 0 || CAPACITY < 2 * PAGE_SIZE {
            error!(
                "Memory capacity {} must be a multiple of {} and hold at least two frames",
                CAPACITY, PAGE_SIZE
            );
            return Err(MmError::InvalidInput(CAPACITY as u64));
        }
        let memory = PhysicalMemory::<CAPACITY>::create()?;
        let total_pages = CAPACITY / PAGE_SIZE;

        let mut frames = Vec::new();
        if frames.try_reserve_exact(total_pages).is_err() {
            error!("Error allocating {} page frame descriptors", total_pages);
            return Err(MmError::AllocationError);
        }
        frames.extend((0..total_pages).map(PageFrame::init));

        let root = total_pages - 1;
        frames[root].flags.insert(FrameFlags::PINNED);
        let root_table_address = frames[root].physical_address;

        let lists = FrameLists {
            frames,
            free: (0..root).collect(),
            allocated: VecDeque::new(),
            pinned: VecDeque::from([root]),
        };

        info!(
            "Initialized {} page frames, root table at {:#x}",
            total_pages, root_table_address
        );
        Ok(Self {
            memory,
            base_address: 0,
            total_pages,
            root_table_address,
            lists: Mutex::new(lists),
        })
    }

    pub fn memory(&self) -> &PhysicalMemory<CAPACITY> {
        &self.memory
    }

    pub fn base_address(&self) -> PhysicalAddress {
        self.base_address
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn root_table_address(&self) -> PhysicalAddress {
        self.root_table_address
    }

    pub(crate) fn lock_lists(&self) -> MutexGuard<'_, FrameLists> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn try_lock_lists(&self) -> Option<MutexGuard<'_, FrameLists>> {
        match self.lists.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn take_free_frame(&self, pinned: bool) -> Option<PageFrame> {
        let frame = self.lock_lists().take_free(pinned)?;
        if pinned {
            info!("PAGE ALLOCATION : Pinned page frame addr:{:#x}", frame.physical_address);
        } else {
            info!("PAGE ALLOCATION : Allocated page frame addr:{:#x}", frame.physical_address);
        }
        Some(frame)
    }

    /// Hands out the oldest free frame, onto `pinned` or `allocated`.
    ///
    /// When `free` is empty the list lock is dropped before the pool-exhausted
    /// fault is raised, and the pop is retried once after it is handled. A data
    /// frame stays BUSY until [`Self::stamp_reverse_mapping`] is called for it.
    pub fn acquire_frame(&self, pinned: bool, swap: &SwapSpace) -> Result<PageFrame, MmError> {
        if let Some(frame) = self.take_free_frame(pinned) {
            return Ok(frame);
        }

        debug!("Free list empty, raising pool exhausted fault");
        PageFaultDispatcher::new(self, swap).handle(PageFault::PoolExhausted)?;

        self.take_free_frame(pinned).ok_or_else(|| {
            error!("No page frame available after eviction");
            MmError::NoFrameAvailable
        })
    }

    /// Returns the frame at `physical_address` from `pinned` or `allocated` to `free`.
    pub fn release_frame(
        &self,
        physical_address: PhysicalAddress,
        pinned: bool,
    ) -> Result<(), MmError> {
        if !is_page_aligned(physical_address) {
            error!(
                "Invalid address given to release_frame, addr:{:#x}",
                physical_address
            );
            return Err(MmError::InvalidInput(physical_address));
        }

        let from = if pinned {
            FrameList::Pinned
        } else {
            FrameList::Allocated
        };
        let mut lists = self.lock_lists();
        if lists.list(from).is_empty() {
            error!("No page available in the {} list to free", from);
            return Err(MmError::NoFrameAvailable);
        }
        let Some(position) = lists.position_of(from, physical_address) else {
            error!(
                "Page frame {:#x} is not in the {} list",
                physical_address, from
            );
            return Err(MmError::NoFrameAvailable);
        };
        lists.move_to_free(from, position);
        drop(lists);

        info!("PAGE RELEASE : page frame addr:{:#x}", physical_address);
        Ok(())
    }

    /// Records the owner of an allocated frame and makes it evictable.
    pub fn stamp_reverse_mapping(
        &self,
        physical_address: PhysicalAddress,
        owner: ProcessId,
        virtual_address: VirtualAddress,
    ) -> Result<(), MmError> {
        let mut lists = self.lock_lists();
        let index = lists
            .position_of(FrameList::Allocated, physical_address)
            .and_then(|position| lists.allocated_at(position))
            .ok_or(MmError::WrongValue(physical_address))?;
        let frame = &mut lists.frames[index];
        frame.owner = Some(owner);
        frame.virtual_address = Some(virtual_address);
        frame.flags.remove(FrameFlags::BUSY);
        Ok(())
    }

    /// The settled frame backing `virtual_address` for `owner`, as its position
    /// on `allocated` and its physical address.
    ///
    /// `None` while the leaf is invalid or the frame is BUSY; the caller looks
    /// again once the page has settled.
    fn settled_mapping(
        lists: &FrameLists,
        table: &PageTable<'_, CAPACITY>,
        owner: ProcessId,
        virtual_address: VirtualAddress,
    ) -> Result<Option<(usize, PhysicalAddress)>, MmError> {
        let entry = match table.leaf_entry(virtual_address)? {
            Some(entry) if entry.is_valid() => entry,
            _ => return Ok(None),
        };
        let physical_address = entry.physical_address();
        let Some(position) = lists.position_of(FrameList::Allocated, physical_address) else {
            error!(
                "PTE for {:#x} points at {:#x}, which is not allocated",
                virtual_address, physical_address
            );
            return Err(MmError::WrongValue(virtual_address));
        };

        let frame = lists.frame(lists.allocated[position]);
        if frame.flags.contains(FrameFlags::BUSY) {
            return Ok(None);
        }
        if frame.owner != Some(owner) || frame.virtual_address != Some(virtual_address) {
            error!(
                "Page {:#x} is not mapped for pid {}, frame {:#x} belongs to {:?}",
                virtual_address, owner, physical_address, frame.owner
            );
            return Err(MmError::WrongValue(virtual_address));
        }
        Ok(Some((position, physical_address)))
    }

    /// Marks the frame backing `virtual_address` BUSY so it is neither evicted
    /// nor freed until [`Self::unpin_mapping`].
    pub(crate) fn pin_mapping(
        &self,
        table: &PageTable<'_, CAPACITY>,
        owner: ProcessId,
        virtual_address: VirtualAddress,
    ) -> Result<Option<PhysicalAddress>, MmError> {
        let mut lists = self.lock_lists();
        let Some((position, physical_address)) =
            Self::settled_mapping(&lists, table, owner, virtual_address)?
        else {
            return Ok(None);
        };
        let index = lists.allocated[position];
        lists.frames[index].flags.insert(FrameFlags::BUSY);
        Ok(Some(physical_address))
    }

    pub(crate) fn unpin_mapping(&self, physical_address: PhysicalAddress, dirty: bool) {
        let mut lists = self.lock_lists();
        if let Some(index) = lists
            .position_of(FrameList::Allocated, physical_address)
            .and_then(|position| lists.allocated_at(position))
        {
            let flags = &mut lists.frames[index].flags;
            flags.remove(FrameFlags::BUSY);
            if dirty {
                flags.insert(FrameFlags::DIRTY);
            }
        }
    }

    /// Invalidates the leaf for `virtual_address` and moves the frame it maps
    /// to `free`, both under the list lock so eviction cannot move the page in
    /// between.
    ///
    /// `Ok(None)` when the page is not resident and settled at this moment.
    pub(crate) fn unmap_and_release(
        &self,
        table: &PageTable<'_, CAPACITY>,
        owner: ProcessId,
        virtual_address: VirtualAddress,
    ) -> Result<Option<PhysicalAddress>, MmError> {
        let mut lists = self.lock_lists();
        let Some((position, physical_address)) =
            Self::settled_mapping(&lists, table, owner, virtual_address)?
        else {
            return Ok(None);
        };
        table.invalidate(virtual_address)?;
        lists.move_to_free(FrameList::Allocated, position);
        drop(lists);

        info!("PAGE RELEASE : page frame addr:{:#x}", physical_address);
        Ok(Some(physical_address))
    }

    /// A copy of the frame starting at `physical_address`.
    pub fn frame(&self, physical_address: PhysicalAddress) -> Option<PageFrame> {
        if !is_page_aligned(physical_address) {
            return None;
        }
        let index = ((physical_address - self.base_address) / PAGE_SIZE as u64) as usize;
        self.lock_lists().frames.get(index).cloned()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let lists = self.lock_lists();
        PoolSnapshot {
            free: lists.addresses(FrameList::Free),
            allocated: lists.addresses(FrameList::Allocated),
            pinned: lists.addresses(FrameList::Pinned),
        }
    }

    pub fn log_lists(&self) {
        if !log_enabled!(Level::Debug) {
            return;
        }
        let snapshot = self.snapshot();
        debug!("----------------------------");
        for (name, addresses) in [
            (FrameList::Free, &snapshot.free),
            (FrameList::Allocated, &snapshot.allocated),
            (FrameList::Pinned, &snapshot.pinned),
        ] {
            debug!("{} pages----", name);
            for address in addresses {
                debug!("phy addr:{:#x}", address);
            }
        }
        debug!("----------------------------");
    }

    /// Drains every list and releases the backing buffer.
    ///
    /// Page-table frames belong to the pool and are drained with the free
    /// frames. Data frames must have been returned first; if any remain the
    /// pool is handed back untouched together with the error.
    pub fn teardown(self) -> Result<(), (Self, MmError)> {
        let mut lists = self.lock_lists();
        if !lists.allocated.is_empty() {
            error!(
                "All pages are not free'd, {} allocated pages remain",
                lists.allocated.len()
            );
            drop(lists);
            return Err((self, MmError::DeallocationError(FrameList::Allocated)));
        }

        let drained = lists.free.drain(..).count() + lists.pinned.drain(..).count();
        lists.frames.clear();
        drop(lists);

        info!("Released {} page frames", drained);
        Ok(())
    }
}
