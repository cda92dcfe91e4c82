use std::fmt;

use memory::MemoryError;

use crate::ProcessId;

/// The three ownership lists of the physical pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameList {
    Free,
    Allocated,
    Pinned,
}

impl fmt::Display for FrameList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameList::Free => write!(f, "free"),
            FrameList::Allocated => write!(f, "allocated"),
            FrameList::Pinned => write!(f, "pinned"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MmError {
    /// Backing storage or a bookkeeping object could not be obtained.
    AllocationError,
    /// Teardown found frames still owned by the named list.
    DeallocationError(FrameList),
    /// Malformed address: misaligned, outside the buffer or beyond 48 bits.
    InvalidInput(u64),
    /// No free frame and nothing evictable.
    NoFrameAvailable,
    /// A page-table entry did not hold the value the operation required.
    WrongValue(u64),
    /// A translation miss with no matching swap block.
    SwapSpaceError {
        owner: ProcessId,
        virtual_frame_address: u64,
    },
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmError::AllocationError => write!(f, "could not allocate backing storage"),
            MmError::DeallocationError(list) => {
                write!(f, "frames are still present in the {} list", list)
            }
            MmError::InvalidInput(address) => write!(f, "invalid address {:#x}", address),
            MmError::NoFrameAvailable => write!(f, "no page frame available"),
            MmError::WrongValue(address) => {
                write!(f, "unexpected page table entry for {:#x}", address)
            }
            MmError::SwapSpaceError {
                owner,
                virtual_frame_address,
            } => write!(
                f,
                "no swap block for pid {} at {:#x}",
                owner, virtual_frame_address
            ),
        }
    }
}

impl std::error::Error for MmError {}

impl From<MemoryError> for MmError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::OverCapacity(address) | MemoryError::Misaligned(address) => {
                MmError::InvalidInput(address)
            }
            MemoryError::OutOfMemory => MmError::AllocationError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_errors_map_to_kinds() {
        assert_eq!(
            MmError::from(MemoryError::Misaligned(0x13)),
            MmError::InvalidInput(0x13)
        );
        assert_eq!(
            MmError::from(MemoryError::OverCapacity(0x5000)),
            MmError::InvalidInput(0x5000)
        );
        assert_eq!(
            MmError::from(MemoryError::OutOfMemory),
            MmError::AllocationError
        );
    }

    #[test]
    fn deallocation_error_names_list() {
        let msg = MmError::DeallocationError(FrameList::Allocated).to_string();
        assert_eq!(msg, "frames are still present in the allocated list");
    }
}
