//! The NVRAM block I/O shim.
//!
//! A thin, synchronous, all-or-nothing wrapper over whatever physically backs
//! the NVRAM partition. Production callers supply their own [`BlockDevice`];
//! [`MmapBlockDevice`] is the crate's one concrete implementation, used by
//! tests and as a reference for how a real backend should behave.

use crate::error::{NvhError, Result};
use log::{debug, trace};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

/// Synchronous, fixed-size-block device. All operations are blocking and
/// all-or-nothing: a `read_block`/`write_block` either fully succeeds or
/// returns an error, never a partial transfer.
pub trait BlockDevice: Send + Sync {
    /// Size in bytes of one block.
    fn block_size(&self) -> usize;

    /// Total number of addressable blocks.
    fn block_count(&self) -> u64;

    /// Read block `addr` into `out`. `out.len()` must equal `block_size()`.
    fn read_block(&self, addr: u64, out: &mut [u8]) -> Result<()>;

    /// Write `data` into block `addr`. `data.len()` must equal `block_size()`.
    fn write_block(&self, addr: u64, data: &[u8]) -> Result<()>;

    /// Durability barrier: block until all prior writes are on stable storage.
    fn sync(&self) -> Result<()>;
}

/// A [`BlockDevice`] backed by a memory-mapped file, standing in for a real
/// NVRAM partition. Persist-then-reopen exercises the same commit-point
/// semantics a real device would: once `sync` returns, re-mapping the file
/// (simulating a process restart) sees exactly what was written.
pub struct MmapBlockDevice {
    block_size: usize,
    block_count: u64,
    map: Mutex<MmapMut>,
}

impl MmapBlockDevice {
    /// Create (or truncate) a file at `path` sized for `block_count` blocks
    /// of `block_size` bytes each, and map it.
    pub fn create<P: AsRef<Path>>(path: P, block_count: u64, block_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| NvhError::Io(e.to_string()))?;
        let len = block_count
            .checked_mul(block_size as u64)
            .ok_or_else(|| NvhError::Invalid("device size overflow".into()))?;
        file.set_len(len).map_err(|e| NvhError::Io(e.to_string()))?;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| NvhError::Io(e.to_string()))?;
        debug!(
            "created mmap block device: {} blocks x {} bytes",
            block_count, block_size
        );
        Ok(Self {
            block_size,
            block_count,
            map: Mutex::new(map),
        })
    }

    /// Re-open an existing file without resizing it, simulating a remount.
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| NvhError::Io(e.to_string()))?;
        let len = file.metadata().map_err(|e| NvhError::Io(e.to_string()))?.len();
        let block_count = len / block_size as u64;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| NvhError::Io(e.to_string()))?;
        debug!("opened mmap block device: {} blocks", block_count);
        Ok(Self {
            block_size,
            block_count,
            map: Mutex::new(map),
        })
    }

    fn check_bounds(&self, addr: u64, buf_len: usize) -> Result<()> {
        if buf_len != self.block_size {
            return Err(NvhError::Invalid(format!(
                "buffer length {} does not match block size {}",
                buf_len, self.block_size
            )));
        }
        if addr >= self.block_count {
            return Err(NvhError::Invalid(format!(
                "block address {} out of range (device has {} blocks)",
                addr, self.block_count
            )));
        }
        Ok(())
    }
}

impl BlockDevice for MmapBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, addr: u64, out: &mut [u8]) -> Result<()> {
        self.check_bounds(addr, out.len())?;
        trace!("read_block {}", addr);
        let map = self.map.lock().unwrap();
        let off = addr as usize * self.block_size;
        out.copy_from_slice(&map[off..off + self.block_size]);
        Ok(())
    }

    fn write_block(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.check_bounds(addr, data.len())?;
        trace!("write_block {}", addr);
        let mut map = self.map.lock().unwrap();
        let off = addr as usize * self.block_size;
        map[off..off + self.block_size].copy_from_slice(data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let map = self.map.lock().unwrap();
        map.flush().map_err(|e| NvhError::Io(e.to_string()))
    }
}
