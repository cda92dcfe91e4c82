mod page_table_entry;

use log::{debug, error, info, warn};

pub use page_table_entry::{
    entry_address, table_index, virtual_frame_number, PageTableEntry, ENTRY_COUNT, ENTRY_SIZE,
    LEVELS,
};

use crate::{
    error::MmError,
    fault::{PageFault, PageFaultDispatcher},
    frame_pool::PhysicalMemoryPool,
    page_frame::{is_page_aligned, page_offset, PAGE_SHIFT},
    swap_space::SwapSpace,
    PhysicalAddress, ProcessId, VirtualAddress,
};

/// Four-level page table rooted at the pool's root frame.
///
/// This is a view over the tables stored in physical memory; entries are read
/// and rewritten one word at a time through `PhysicalMemory::update_u64`.
pub struct PageTable<'a, const CAPACITY: usize> {
    pool: &'a PhysicalMemoryPool<CAPACITY>,
    swap: &'a SwapSpace,
}

impl<'a, const CAPACITY: usize> PageTable<'a, CAPACITY> {
    pub fn new(pool: &'a PhysicalMemoryPool<CAPACITY>, swap: &'a SwapSpace) -> Self {
        Self { pool, swap }
    }

    fn vfn(virtual_address: VirtualAddress) -> Result<u64, MmError> {
        virtual_frame_number(virtual_address).ok_or_else(|| {
            error!("Virtual address {:#x} is beyond 48 bits", virtual_address);
            MmError::InvalidInput(virtual_address)
        })
    }

    fn read_entry(&self, address: PhysicalAddress) -> Result<PageTableEntry, MmError> {
        let bits = self.pool.memory().read_u64(address)?;
        Ok(PageTableEntry::from_bits(bits))
    }

    /// Walks the table for `virtual_address` and returns the physical address.
    ///
    /// An invalid entry on the way raises a translation-miss fault for
    /// `owner`; the entry is read again once the fault has been handled.
    pub fn translate(
        &self,
        owner: ProcessId,
        virtual_address: VirtualAddress,
    ) -> Result<PhysicalAddress, MmError> {
        let vfn = Self::vfn(virtual_address)?;
        let mut table = self.pool.root_table_address();

        for level in 1..=LEVELS {
            let address = entry_address(table, table_index(vfn, level));
            let mut entry = self.read_entry(address)?;
            if !entry.is_valid() {
                debug!(
                    "Translation miss at level {} for {:#x}, pid {}",
                    level, virtual_address, owner
                );
                PageFaultDispatcher::new(self.pool, self.swap).handle(PageFault::TranslationMiss {
                    owner,
                    virtual_frame_address: vfn << PAGE_SHIFT,
                })?;
                entry = self.read_entry(address)?;
                if !entry.is_valid() {
                    error!(
                        "Entry for {:#x} still invalid at level {} after page fault",
                        virtual_address, level
                    );
                    return Err(MmError::WrongValue(virtual_address));
                }
            }
            table = entry.physical_address();
        }

        Ok(table + page_offset(virtual_address))
    }

    /// Maps `virtual_address` to the frame at `physical_address`.
    ///
    /// Missing intermediate tables are taken from the pool as pinned frames.
    /// An entry that is already valid only gets its reference bit set, at the
    /// leaf too. Returns the address of the leaf entry.
    ///
    /// Must be called without the pool list lock held.
    pub fn bind(
        &self,
        virtual_address: VirtualAddress,
        physical_address: PhysicalAddress,
    ) -> Result<PhysicalAddress, MmError> {
        let vfn = Self::vfn(virtual_address)?;
        if !is_page_aligned(physical_address) {
            error!("Cannot bind unaligned frame address {:#x}", physical_address);
            return Err(MmError::InvalidInput(physical_address));
        }

        let mut table = self.pool.root_table_address();
        for level in 1..LEVELS {
            let address = entry_address(table, table_index(vfn, level));
            table = self.next_table(address, level)?;
        }

        let leaf = entry_address(table, table_index(vfn, LEVELS));
        let frame_number = physical_address >> PAGE_SHIFT;
        let previous = self.pool.memory().update_u64(leaf, |bits| {
            let entry = PageTableEntry::from_bits(bits);
            if entry.is_valid() {
                Some(entry.touched().bits())
            } else {
                Some(PageTableEntry::mapping(frame_number).bits())
            }
        })?;
        let previous = PageTableEntry::from_bits(previous.unwrap_or_else(|bits| bits));

        if previous.is_valid() {
            debug!(
                "Leaf for {:#x} already maps frame {:#x}, reference bit set",
                virtual_address,
                previous.physical_address()
            );
        } else {
            debug!(
                "Mapped {:#x} -> {:#x}, PTE at {:#x}",
                virtual_address, physical_address, leaf
            );
        }
        Ok(leaf)
    }

    /// Follows the entry at `address`, creating the next-level table if it is
    /// missing.
    fn next_table(
        &self,
        address: PhysicalAddress,
        level: u8,
    ) -> Result<PhysicalAddress, MmError> {
        let memory = self.pool.memory();
        let entry = self.read_entry(address)?;
        if entry.is_valid() {
            // Intermediate entries are never invalidated, so the update cannot be refused.
            let _ = memory.update_u64(address, |bits| {
                let entry = PageTableEntry::from_bits(bits);
                entry.is_valid().then(|| entry.touched().bits())
            })?;
            return Ok(entry.physical_address());
        }

        let frame = self.pool.acquire_frame(true, self.swap)?;
        let table = frame.physical_address;
        if let Err(err) = memory.zero_frame(table) {
            self.pool.release_frame(table, true)?;
            return Err(err.into());
        }

        let installed = memory.update_u64(address, |bits| {
            if PageTableEntry::from_bits(bits).is_valid() {
                None
            } else {
                Some(PageTableEntry::mapping(frame.frame_number()).bits())
            }
        })?;

        match installed {
            Ok(_) => {
                debug!("Level {} table created at {:#x}", level + 1, table);
                Ok(table)
            }
            Err(current) => {
                warn!(
                    "Level {} entry at {:#x} was filled concurrently, returning {:#x}",
                    level, address, table
                );
                self.pool.release_frame(table, true)?;
                Ok(PageTableEntry::from_bits(current).physical_address())
            }
        }
    }

    /// Binds `virtual_address` to the data frame at `physical_address` and
    /// stamps the frame's reverse mapping, which makes it evictable.
    ///
    /// If the frame cannot be stamped the leaf is invalidated again, so it never
    /// points at a frame the caller is about to release.
    pub(crate) fn map(
        &self,
        owner: ProcessId,
        virtual_address: VirtualAddress,
        physical_address: PhysicalAddress,
    ) -> Result<(), MmError> {
        self.bind(virtual_address, physical_address)?;
        if let Err(err) = self
            .pool
            .stamp_reverse_mapping(physical_address, owner, virtual_address)
        {
            error!(
                "Page frame {:#x} could not be stamped for {:#x}, unmapping",
                physical_address, virtual_address
            );
            if let Err(undo_err) = self.invalidate(virtual_address) {
                warn!(
                    "PTE for {:#x} could not be invalidated, err: {}",
                    virtual_address, undo_err
                );
            }
            return Err(err);
        }
        Ok(())
    }

    /// Clears the valid bit of the leaf entry for `virtual_address` and returns
    /// the entry as it was.
    ///
    /// Never raises a fault, so it is safe to call with the pool and swap locks
    /// held. Invalidating an entry that is not valid is an error.
    pub fn invalidate(&self, virtual_address: VirtualAddress) -> Result<PageTableEntry, MmError> {
        let Some(leaf) = self.leaf_address(virtual_address)? else {
            error!(
                "No page table for {:#x} while invalidating the PTE",
                virtual_address
            );
            return Err(MmError::WrongValue(virtual_address));
        };

        let updated = self.pool.memory().update_u64(leaf, |bits| {
            let entry = PageTableEntry::from_bits(bits);
            entry.is_valid().then(|| entry.invalidated().bits())
        })?;

        match updated {
            Ok(previous) => {
                let previous = PageTableEntry::from_bits(previous);
                info!(
                    "INVALIDATED PTE : {:#x}, PTE value: {:#x}",
                    virtual_address,
                    previous.invalidated().bits()
                );
                Ok(previous)
            }
            Err(_) => {
                error!(
                    "Wrong PTE value found while invalidating the PTE for {:#x}",
                    virtual_address
                );
                Err(MmError::WrongValue(virtual_address))
            }
        }
    }

    /// The leaf entry for `virtual_address`, without raising faults.
    ///
    /// `None` when an intermediate table is missing.
    pub fn leaf_entry(
        &self,
        virtual_address: VirtualAddress,
    ) -> Result<Option<PageTableEntry>, MmError> {
        match self.leaf_address(virtual_address)? {
            Some(leaf) => Ok(Some(self.read_entry(leaf)?)),
            None => Ok(None),
        }
    }

    fn leaf_address(
        &self,
        virtual_address: VirtualAddress,
    ) -> Result<Option<PhysicalAddress>, MmError> {
        let vfn = Self::vfn(virtual_address)?;
        let mut table = self.pool.root_table_address();
        for level in 1..LEVELS {
            let entry = self.read_entry(entry_address(table, table_index(vfn, level)))?;
            if !entry.is_valid() {
                return Ok(None);
            }
            table = entry.physical_address();
        }
        Ok(Some(entry_address(table, table_index(vfn, LEVELS))))
    }
}
