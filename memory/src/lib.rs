use std::{
    mem::size_of,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::error;

pub const FRAME_SIZE: usize = 4096;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MemoryError {
    OverCapacity(u64),
    Misaligned(u64),
    OutOfMemory,
}

/// The simulated RAM: one heap buffer of `CAPACITY` bytes shared between clones.
///
/// Every accessor takes the buffer lock for the duration of a single access and
/// releases it before returning, so callers never hold it across other locks.
#[derive(Clone)]
pub struct PhysicalMemory<const CAPACITY: usize> {
    buffer: Arc<Mutex<Box<[u8]>>>,
}

impl<const CAPACITY: usize> PhysicalMemory<CAPACITY> {
    pub fn create() -> Result<Self, MemoryError> {
        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(CAPACITY).is_err() {
            error!("Could not reserve {} bytes of physical memory", CAPACITY);
            return Err(MemoryError::OutOfMemory);
        }
        buffer.resize(CAPACITY, 0u8);
        Ok(Self {
            buffer: Arc::new(Mutex::new(buffer.into_boxed_slice())),
        })
    }

    pub const fn capacity(&self) -> usize {
        CAPACITY
    }

    fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks that `len` bytes starting at `address` fit in the buffer.
    pub fn check_range(&self, address: u64, len: usize) -> Result<(), MemoryError> {
        let end = address.checked_add(len as u64);
        match end {
            Some(end) if end <= CAPACITY as u64 => Ok(()),
            _ => Err(MemoryError::OverCapacity(address)),
        }
    }

    pub fn check_address(&self, address: u64) -> Result<(), MemoryError> {
        self.check_range(address, 1)
    }

    fn check_frame(&self, address: u64) -> Result<(), MemoryError> {
        if address % FRAME_SIZE as u64 != 0 {
            return Err(MemoryError::Misaligned(address));
        }
        self.check_range(address, FRAME_SIZE)
    }

    fn check_word(&self, address: u64) -> Result<(), MemoryError> {
        if address % size_of::<u64>() as u64 != 0 {
            return Err(MemoryError::Misaligned(address));
        }
        self.check_range(address, size_of::<u64>())
    }

    pub fn read_u8(&self, address: u64) -> Result<u8, MemoryError> {
        self.check_address(address)?;
        let buffer = self.lock();
        Ok(buffer[address as usize])
    }

    pub fn write_u8(&self, address: u64, byte: u8) -> Result<(), MemoryError> {
        self.check_address(address)?;
        let mut buffer = self.lock();
        buffer[address as usize] = byte;
        Ok(())
    }

    pub fn read_u64(&self, address: u64) -> Result<u64, MemoryError> {
        self.check_word(address)?;
        let buffer = self.lock();
        Ok(word_at(&buffer, address))
    }

    pub fn write_u64(&self, address: u64, word: u64) -> Result<(), MemoryError> {
        self.check_word(address)?;
        let mut buffer = self.lock();
        let start = address as usize;
        buffer[start..start + size_of::<u64>()].copy_from_slice(&word.to_be_bytes());
        Ok(())
    }

    /// Atomically rewrites the word at `address` with `f(current)`.
    ///
    /// Mirrors `AtomicU64::fetch_update`: `Ok(previous)` when `f` returned a new
    /// value, `Err(previous)` when it returned `None` and the word was left alone.
    pub fn update_u64<F>(&self, address: u64, f: F) -> Result<Result<u64, u64>, MemoryError>
    where
        F: FnOnce(u64) -> Option<u64>,
    {
        self.check_word(address)?;
        let mut buffer = self.lock();
        let previous = word_at(&buffer, address);
        match f(previous) {
            Some(word) => {
                let start = address as usize;
                buffer[start..start + size_of::<u64>()].copy_from_slice(&word.to_be_bytes());
                Ok(Ok(previous))
            }
            None => Ok(Err(previous)),
        }
    }

    pub fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.check_range(address, buf.len())?;
        let buffer = self.lock();
        let start = address as usize;
        buf.copy_from_slice(&buffer[start..start + buf.len()]);
        Ok(())
    }

    pub fn write_bytes(&self, address: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        self.check_range(address, bytes.len())?;
        let mut buffer = self.lock();
        let start = address as usize;
        buffer[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_frame(&self, address: u64) -> Result<Box<[u8; FRAME_SIZE]>, MemoryError> {
        self.check_frame(address)?;
        let buffer = self.lock();
        let start = address as usize;
        let mut frame = Box::new([0u8; FRAME_SIZE]);
        frame.copy_from_slice(&buffer[start..start + FRAME_SIZE]);
        Ok(frame)
    }

    pub fn write_frame(&self, address: u64, frame: &[u8; FRAME_SIZE]) -> Result<(), MemoryError> {
        self.check_frame(address)?;
        let mut buffer = self.lock();
        let start = address as usize;
        buffer[start..start + FRAME_SIZE].copy_from_slice(frame);
        Ok(())
    }

    pub fn zero_frame(&self, address: u64) -> Result<(), MemoryError> {
        self.check_frame(address)?;
        let mut buffer = self.lock();
        let start = address as usize;
        buffer[start..start + FRAME_SIZE].fill(0);
        Ok(())
    }
}

fn word_at(buffer: &[u8], address: u64) -> u64 {
    let start = address as usize;
    let mut bytes = [0; size_of::<u64>()];
    bytes.copy_from_slice(&buffer[start..start + size_of::<u64>()]);
    u64::from_be_bytes(bytes)
}
