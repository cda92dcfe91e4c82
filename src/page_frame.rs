use bitflags::bitflags;

use crate::{PhysicalAddress, ProcessId, VirtualAddress, PAGE_SIZE};

bitflags! {
    /// State bits carried by every page frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        /// The frame was written through `MemoryManager::write_bytes`.
        const DIRTY = 0x01;
        /// The frame has been handed out but its reverse mapping is not stamped yet.
        const BUSY = 0x02;
        /// The frame backs a page-table page.
        const PINNED = 0x04;
    }
}

/// One 4 KiB frame of the simulated physical memory.
///
/// The reverse mapping (`virtual_address`, `owner`) is only meaningful while the
/// frame sits on the allocated list and is mapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFrame {
    pub physical_address: PhysicalAddress,
    pub size: usize,
    pub flags: FrameFlags,
    pub virtual_address: Option<VirtualAddress>,
    pub owner: Option<ProcessId>,
}

impl PageFrame {
    pub(crate) fn init(index: usize) -> Self {
        PageFrame {
            physical_address: (index * PAGE_SIZE) as PhysicalAddress,
            size: PAGE_SIZE,
            flags: FrameFlags::empty(),
            virtual_address: None,
            owner: None,
        }
    }

    pub fn frame_number(&self) -> u64 {
        self.physical_address >> PAGE_SHIFT
    }

    pub(crate) fn clear(&mut self) {
        self.flags = FrameFlags::empty();
        self.virtual_address = None;
        self.owner = None;
    }
}

pub const PAGE_SHIFT: u32 = 12;

#[inline]
pub const fn is_page_aligned(address: u64) -> bool {
    address & (PAGE_SIZE as u64 - 1) == 0
}

#[inline]
pub const fn page_offset(address: u64) -> u64 {
    address & (PAGE_SIZE as u64 - 1)
}

#[inline]
pub const fn align_down(address: u64) -> u64 {
    address & !(PAGE_SIZE as u64 - 1)
}
