//! `nvhash`: the block-mapping index of an NVRAM file system.
//!
//! Translates `(inode number, logical block number)` pairs into
//! `(physical block, run length)` pairs and persists that mapping
//! crash-consistently in a globally shared, open-addressed hash table whose
//! backing arrays live directly in blocks of an NVRAM-like device. File I/O,
//! directory entries, the transaction log, and the block allocator for file
//! data are external collaborators this crate consumes via traits
//! ([`device::BlockDevice`], [`alloc::BlockAllocator`]) but does not
//! implement.

pub mod alloc;
pub mod arena;
pub mod config;
pub mod device;
pub mod error;
pub mod hash;
pub mod index;
pub mod value;

use alloc::BlockAllocator;
use arena::Arena;
use device::BlockDevice;
use error::Result;
use hash::{DirectHasher, KeyHasher};
use index::BlockMapper;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The index handle: owns both inner tables and tracks whether they hold
/// inserts/removals not yet covered by a `persist()` call.
pub struct NvHashIndex<H: KeyHasher = DirectHasher> {
    mapper: BlockMapper<H>,
    dirty: AtomicBool,
}

impl<H: KeyHasher> NvHashIndex<H> {
    /// Mount-time construction. Attempts to load an existing index from
    /// `device`'s reserved descriptor blocks; if none is found, creates a
    /// fresh one sized for `max_entries` live mappings.
    pub fn init(
        device: Arc<dyn BlockDevice>,
        allocator: Arc<dyn BlockAllocator>,
        max_entries: u64,
        stripe_count: usize,
    ) -> Result<Self> {
        let arena = Arena::new(device.block_count());
        let mapper = match BlockMapper::load(device.clone(), &arena, stripe_count, allocator.clone())? {
            Some(mapper) => {
                debug!("nvhash: recovered existing index from descriptors");
                mapper
            }
            None => {
                debug!("nvhash: no prior index found, creating fresh");
                BlockMapper::create(max_entries, stripe_count, device, &arena, allocator)?
            }
        };
        Ok(Self {
            mapper,
            dirty: AtomicBool::new(false),
        })
    }

    /// `get_blocks(inum, lblk, n, create) -> (phys, run, err)`. See
    /// [`index::BlockMapper::get_blocks`] for the full contract.
    pub fn get_blocks(
        &self,
        inum: u32,
        lblk: u32,
        n: u32,
        create: bool,
    ) -> Result<Option<(u64, u32)>> {
        let result = self.mapper.get_blocks(inum, lblk, n, create)?;
        if create && result.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(result)
    }

    /// `truncate(handle, inum, start_lblk, end_lblk) -> err`.
    pub fn truncate(&self, inum: u32, start_lblk: u32, end_lblk: u32) -> Result<()> {
        self.mapper.truncate(inum, start_lblk, end_lblk)?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// `persist(handle) -> err`: the sole durability point. Not called
    /// implicitly on drop.
    pub fn persist(&self) -> Result<()> {
        self.mapper.persist()?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// `load_factor(handle) -> f64`, for diagnostics.
    pub fn load_factor(&self) -> f64 {
        self.mapper.load_factor()
    }
}

impl<H: KeyHasher> Drop for NvHashIndex<H> {
    /// `destroy(handle)`. On-disk state is unaffected by
    /// drop; this only releases the in-memory handle. If inserts or
    /// removals since the last `persist()` are about to be lost, that is
    /// logged, not silently swallowed.
    fn drop(&mut self) {
        if self.dirty.load(Ordering::Acquire) {
            warn!("nvhash: index dropped with unpersisted changes since the last persist()");
        }
    }
}
