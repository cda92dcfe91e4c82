use std::fmt;

use crate::{page_frame::PAGE_SHIFT, PhysicalAddress, VirtualAddress};

/// Number of table levels; level 1 is the root, level 4 holds the leaves.
pub const LEVELS: u8 = 4;
/// Entries per table page (9 index bits).
pub const ENTRY_COUNT: usize = 512;
pub const ENTRY_SIZE: usize = 8;
pub const VIRTUAL_FRAME_BITS: u32 = 36;

const INDEX_BITS: u32 = 9;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

const VALID: u64 = 1 << 52;
const REFERENCED: u64 = 1 << 53;
const FRAME_MASK: u64 = VALID - 1;

/// One 64-bit page-table entry.
///
/// | 63..54 unused | 53 referenced | 52 valid | 51..0 frame number |
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const UNUSED: Self = Self(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// A fresh mapping: valid and referenced.
    pub const fn mapping(frame_number: u64) -> Self {
        Self((frame_number & FRAME_MASK) | VALID | REFERENCED)
    }

    pub const fn is_valid(self) -> bool {
        self.0 & VALID != 0
    }

    pub const fn is_referenced(self) -> bool {
        self.0 & REFERENCED != 0
    }

    pub const fn frame_number(self) -> u64 {
        self.0 & FRAME_MASK
    }

    pub const fn physical_address(self) -> PhysicalAddress {
        self.frame_number() << PAGE_SHIFT
    }

    pub const fn touched(self) -> Self {
        Self(self.0 | REFERENCED)
    }

    /// Clears the valid bit; the frame number is left in place.
    pub const fn invalidated(self) -> Self {
        Self(self.0 & !VALID)
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            write!(f, "PageTableEntry::INVALID({:#x})", self.0)
        } else {
            f.debug_struct("PageTableEntry")
                .field("frame", &self.frame_number())
                .field("referenced", &self.is_referenced())
                .finish()
        }
    }
}

/// Splits a virtual address into its frame number, or `None` past 48 bits.
pub fn virtual_frame_number(virtual_address: VirtualAddress) -> Option<u64> {
    let vfn = virtual_address >> PAGE_SHIFT;
    (vfn >> VIRTUAL_FRAME_BITS == 0).then_some(vfn)
}

/// Index into the level `level` table: level 1 takes vfn bits 27..35, level 4
/// bits 0..8.
pub fn table_index(vfn: u64, level: u8) -> usize {
    debug_assert!((1..=LEVELS).contains(&level));
    let shift = INDEX_BITS * u32::from(LEVELS - level);
    ((vfn >> shift) & INDEX_MASK) as usize
}

pub fn entry_address(table: PhysicalAddress, index: usize) -> PhysicalAddress {
    table + (index * ENTRY_SIZE) as PhysicalAddress
}
