//! The NVRAM arena allocator.
//!
//! Hands out contiguous block ranges for the hash table's own keys/hashes/
//! values arrays at table-creation time. It never frees (the table is sized
//! once and never grows online), so a single watermark suffices. Reserved
//! metadata blocks at the top of the device (blocks `N-1`, `N-2`, `N-3`) are
//! carved out up front and never handed out by `allocate_range`.
//!
//! This is distinct from the external per-file block allocator `index`
//! consumes (`BlockAllocator`): that one serves physical blocks for file
//! data and can free; this one only ever grows forward and serves the
//! table's own structures.

use crate::error::{NvhError, Result};
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of blocks reserved at the top of the device for metadata
/// descriptors (single-table, chunk-table, and one reserved for a future
/// inode-id map descriptor).
pub const RESERVED_TOP_BLOCKS: u64 = 3;

pub struct Arena {
    device_block_count: u64,
    next_free: AtomicU64,
}

impl Arena {
    /// `device_block_count` is the total size of the backing device; the
    /// arena allocates forward from block 1 (block 0 is never handed out,
    /// since a packed value's `addr == 0` means "no value")
    /// up to `device_block_count - RESERVED_TOP_BLOCKS`.
    pub fn new(device_block_count: u64) -> Self {
        Self {
            device_block_count,
            next_free: AtomicU64::new(1),
        }
    }

    /// Highest block address usable by the arena (exclusive).
    fn usable_end(&self) -> u64 {
        self.device_block_count.saturating_sub(RESERVED_TOP_BLOCKS)
    }

    /// Block address of the single-table metadata descriptor (`N-1`).
    pub fn single_descriptor_block(&self) -> u64 {
        self.device_block_count - 1
    }

    /// Block address of the chunk-table metadata descriptor (`N-2`).
    pub fn chunk_descriptor_block(&self) -> u64 {
        self.device_block_count - 2
    }

    /// Block address reserved for a future inode-id map descriptor (`N-3`).
    pub fn reserved_descriptor_block(&self) -> u64 {
        self.device_block_count - 3
    }

    /// Allocate `n` contiguous blocks, advancing the watermark.
    pub fn allocate_range(&self, n: u64) -> Result<u64> {
        if n == 0 {
            return Err(NvhError::Invalid("cannot allocate zero blocks".into()));
        }
        loop {
            let start = self.next_free.load(Ordering::Acquire);
            let end = start
                .checked_add(n)
                .ok_or_else(|| NvhError::NoSpace("arena range overflow".into()))?;
            if end > self.usable_end() {
                return Err(NvhError::NoSpace(format!(
                    "arena exhausted: requested {} blocks from {}, usable end is {}",
                    n,
                    start,
                    self.usable_end()
                )));
            }
            if self
                .next_free
                .compare_exchange(start, end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!("arena allocated [{}, {}) ({} blocks)", start, end, n);
                return Ok(start);
            }
        }
    }
}
