use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError, TryLockError,
    },
    thread,
};

use log::{debug, error, info, log_enabled, warn, Level};

use crate::{
    error::{FrameList, MmError},
    frame_pool::{FrameLists, PhysicalMemoryPool},
    page_table::PageTable,
    PhysicalAddress, ProcessId, VirtualAddress, PAGE_SIZE,
};

/// The saved contents of one evicted page.
#[derive(Debug)]
pub struct SwapBlock {
    pub owner: ProcessId,
    pub virtual_frame_address: VirtualAddress,
    serial: u64,
    /// A fault is copying this block back into memory.
    in_flight: bool,
    data: Box<[u8; PAGE_SIZE]>,
}

impl SwapBlock {
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    fn matches(&self, owner: ProcessId, virtual_frame_address: VirtualAddress) -> bool {
        self.owner == owner && self.virtual_frame_address == virtual_frame_address
    }
}

/// Outcome of looking up a block to restore.
enum Claim {
    Claimed {
        serial: u64,
        data: Box<[u8; PAGE_SIZE]>,
    },
    InFlight,
    Missing,
}

/// Unordered, unbounded store of evicted pages keyed by (owner, virtual address).
#[derive(Debug, Default)]
pub struct SwapSpace {
    blocks: Mutex<Vec<SwapBlock>>,
    next_serial: AtomicU64,
}

impl SwapSpace {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_blocks(&self) -> MutexGuard<'_, Vec<SwapBlock>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock_blocks(&self) -> Option<MutexGuard<'_, Vec<SwapBlock>>> {
        match self.blocks.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.lock_blocks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_blocks().is_empty()
    }

    pub fn contains(&self, owner: ProcessId, virtual_frame_address: VirtualAddress) -> bool {
        self.lock_blocks()
            .iter()
            .any(|block| block.matches(owner, virtual_frame_address))
    }

    pub fn log_blocks(&self) {
        if !log_enabled!(Level::Debug) {
            return;
        }
        let blocks = self.lock_blocks();
        debug!("----------------------------");
        debug!("Swap Space Pages----");
        for block in blocks.iter() {
            debug!(
                "pid:{}, vfn addr:{:#x}, in flight:{}",
                block.owner, block.virtual_frame_address, block.in_flight
            );
        }
        debug!("----------------------------");
    }

    /// Takes the pool list lock and the swap lock together.
    ///
    /// There is no global order between the two locks. Each round tries the
    /// pool lock, then the swap lock; if the second is taken the first is let
    /// go and the whole pair is retried after yielding. Neither lock is ever
    /// waited on while the other is held.
    fn lock_both<'s, const CAPACITY: usize>(
        &'s self,
        pool: &'s PhysicalMemoryPool<CAPACITY>,
    ) -> (MutexGuard<'s, FrameLists>, MutexGuard<'s, Vec<SwapBlock>>) {
        loop {
            if let Some(lists) = pool.try_lock_lists() {
                if let Some(blocks) = self.try_lock_blocks() {
                    return (lists, blocks);
                }
                drop(lists);
            }
            thread::yield_now();
        }
    }

    /// Pages out the oldest settled frame of `allocated` and moves it to `free`.
    ///
    /// Victims are chosen strictly in allocation order; access history is not
    /// consulted. Frames still BUSY being mapped are skipped, and so is a frame
    /// whose entry another caller has already invalidated on its way to `free`.
    pub(crate) fn evict_victim<const CAPACITY: usize>(
        &self,
        pool: &PhysicalMemoryPool<CAPACITY>,
    ) -> Result<(), MmError> {
        let (mut lists, mut blocks) = self.lock_both(pool);

        if lists.is_allocated_empty() {
            error!("No page frames available in the memory");
            return Err(MmError::NoFrameAvailable);
        }

        for (position, index) in lists.settled_allocated() {
            let victim = lists.frame(index).clone();
            let (Some(owner), Some(virtual_address)) = (victim.owner, victim.virtual_address)
            else {
                error!(
                    "Page frame {:#x} has no reverse mapping",
                    victim.physical_address
                );
                return Err(MmError::WrongValue(victim.physical_address));
            };

            let data = pool.memory().read_frame(victim.physical_address)?;
            match PageTable::new(pool, self).invalidate(virtual_address) {
                Ok(_) => {}
                Err(MmError::WrongValue(_)) => {
                    warn!(
                        "Page frame {:#x} is being released, looking for another victim",
                        victim.physical_address
                    );
                    continue;
                }
                Err(err) => return Err(err),
            }

            lists.move_to_free(FrameList::Allocated, position);
            blocks.push(SwapBlock {
                owner,
                virtual_frame_address: virtual_address,
                serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
                in_flight: false,
                data,
            });
            drop(blocks);
            drop(lists);

            info!(
                "PAGE_SWAP : Page frame addr:{:#x}, pid:{}, vfn addr:{:#x}",
                victim.physical_address, owner, virtual_address
            );
            return Ok(());
        }

        error!("No allocated page frame can be evicted");
        Err(MmError::NoFrameAvailable)
    }

    /// Marks the settled block for (`owner`, `virtual_frame_address`) in flight
    /// and hands back a copy of its contents.
    ///
    /// The block stays in the swap space until the page is mapped again, so a
    /// concurrent fault on the same page waits for it instead of missing it.
    fn claim_block(&self, owner: ProcessId, virtual_frame_address: VirtualAddress) -> Claim {
        let mut blocks = self.lock_blocks();
        if let Some(block) = blocks
            .iter_mut()
            .find(|block| block.matches(owner, virtual_frame_address) && !block.in_flight)
        {
            block.in_flight = true;
            return Claim::Claimed {
                serial: block.serial,
                data: block.data.clone(),
            };
        }
        if blocks
            .iter()
            .any(|block| block.matches(owner, virtual_frame_address))
        {
            Claim::InFlight
        } else {
            Claim::Missing
        }
    }

    fn remove_block(&self, serial: u64) {
        let mut blocks = self.lock_blocks();
        if let Some(position) = blocks.iter().position(|block| block.serial == serial) {
            blocks.swap_remove(position);
        }
    }

    fn unclaim_block(&self, serial: u64) {
        if let Some(block) = self
            .lock_blocks()
            .iter_mut()
            .find(|block| block.serial == serial)
        {
            block.in_flight = false;
        }
    }

    /// Pages the block saved for (`owner`, `virtual_frame_address`) back in.
    ///
    /// The swap lock is not held while a frame is requested, since the request
    /// may itself evict. A block already being restored by another fault is
    /// waited for. If the page cannot be reinstalled the block becomes
    /// claimable again.
    pub(crate) fn restore<const CAPACITY: usize>(
        &self,
        owner: ProcessId,
        virtual_frame_address: VirtualAddress,
        pool: &PhysicalMemoryPool<CAPACITY>,
    ) -> Result<(), MmError> {
        debug!(
            "Looking up swap block pid:{}, vfn addr:{:#x}",
            owner, virtual_frame_address
        );
        let (serial, data) = loop {
            match self.claim_block(owner, virtual_frame_address) {
                Claim::Claimed { serial, data } => break (serial, data),
                Claim::InFlight => thread::yield_now(),
                Claim::Missing => {
                    // Another fault may have finished restoring the page meanwhile.
                    let resident = PageTable::new(pool, self)
                        .leaf_entry(virtual_frame_address)?
                        .map_or(false, |entry| entry.is_valid());
                    if resident {
                        debug!(
                            "pid:{}, vfn addr:{:#x} was restored by another fault",
                            owner, virtual_frame_address
                        );
                        return Ok(());
                    }
                    error!(
                        "No swap block for pid:{}, vfn addr:{:#x}",
                        owner, virtual_frame_address
                    );
                    return Err(MmError::SwapSpaceError {
                        owner,
                        virtual_frame_address,
                    });
                }
            }
        };

        match self.reinstall(owner, virtual_frame_address, &data, pool) {
            Ok(physical_address) => {
                self.remove_block(serial);
                info!(
                    "PAGE_RESTORE : pid:{}, vfn addr:{:#x} -> page frame addr:{:#x}",
                    owner, virtual_frame_address, physical_address
                );
                Ok(())
            }
            Err(err) => {
                self.unclaim_block(serial);
                Err(err)
            }
        }
    }

    fn reinstall<const CAPACITY: usize>(
        &self,
        owner: ProcessId,
        virtual_frame_address: VirtualAddress,
        data: &[u8; PAGE_SIZE],
        pool: &PhysicalMemoryPool<CAPACITY>,
    ) -> Result<PhysicalAddress, MmError> {
        let frame = pool.acquire_frame(false, self)?;
        let physical_address = frame.physical_address;

        let installed = pool
            .memory()
            .write_frame(physical_address, data)
            .map_err(MmError::from)
            .and_then(|()| {
                PageTable::new(pool, self).map(owner, virtual_frame_address, physical_address)
            });

        if let Err(err) = installed {
            if let Err(release_err) = pool.release_frame(physical_address, false) {
                warn!(
                    "Page frame {:#x} could not be returned, err: {}",
                    physical_address, release_err
                );
            }
            return Err(err);
        }
        Ok(physical_address)
    }
}
