//! The two-level index and block mapper.
//!
//! `BlockMapper` owns two independent [`PersistentHashTable`]s — `single`,
//! keyed per logical block, and `chunk`, keyed per `RANGE_SIZE`-aligned run —
//! and bridges both to the external [`BlockAllocator`] for the physical
//! blocks a miss needs to acquire.

use crate::alloc::BlockAllocator;
use crate::arena::Arena;
use crate::config::{TableConfig, RANGE_SIZE};
use crate::device::BlockDevice;
use crate::error::{NvhError, Result};
use crate::hash::table::PersistentHashTable;
use crate::hash::{DirectHasher, Key, KeyHasher};
use crate::value::PackedValue;
use log::warn;
use std::sync::Arc;

const RANGE_BITS_U32: u32 = (RANGE_SIZE - 1) as u32;

fn make_key(inum: u32, lblk: u32) -> Key {
    Key::make(inum, lblk)
}

fn range_key(inum: u32, lblk: u32) -> Key {
    Key::make(inum, lblk & !RANGE_BITS_U32)
}

/// Owns the per-block and per-range tables and implements the block-mapping
/// protocol: lookup, allocate-on-miss, truncate.
pub struct BlockMapper<H: KeyHasher = DirectHasher> {
    single: PersistentHashTable<H>,
    chunk: PersistentHashTable<H>,
    allocator: Arc<dyn BlockAllocator>,
}

impl<H: KeyHasher> BlockMapper<H> {
    /// Build a fresh mapper, sizing `single` for `max_entries` and `chunk`
    /// for `max_entries / RANGE_SIZE` (a range entry replaces up to
    /// `RANGE_SIZE` single entries).
    pub fn create(
        max_entries: u64,
        stripe_count: usize,
        device: Arc<dyn BlockDevice>,
        arena: &Arena,
        allocator: Arc<dyn BlockAllocator>,
    ) -> Result<Self> {
        let single_cfg = TableConfig::new(max_entries).with_stripe_count(stripe_count);
        let chunk_cfg =
            TableConfig::new((max_entries / RANGE_SIZE).max(1)).with_stripe_count(stripe_count);
        let single = PersistentHashTable::new_table(
            &single_cfg,
            device.clone(),
            arena,
            arena.single_descriptor_block(),
        )?;
        let chunk = PersistentHashTable::new_table(
            &chunk_cfg,
            device,
            arena,
            arena.chunk_descriptor_block(),
        )?;
        Ok(Self {
            single,
            chunk,
            allocator,
        })
    }

    /// Reconstruct a mapper from on-disk descriptors. `Ok(None)` iff neither
    /// table has ever been persisted; a descriptor present on only one side
    /// is `Corrupt` (the two tables are always created and persisted
    /// together).
    pub fn load(
        device: Arc<dyn BlockDevice>,
        arena: &Arena,
        stripe_count: usize,
        allocator: Arc<dyn BlockAllocator>,
    ) -> Result<Option<Self>> {
        let single =
            PersistentHashTable::load_table(device.clone(), arena.single_descriptor_block(), stripe_count)?;
        let chunk =
            PersistentHashTable::load_table(device, arena.chunk_descriptor_block(), stripe_count)?;
        match (single, chunk) {
            (Some(single), Some(chunk)) => Ok(Some(Self {
                single,
                chunk,
                allocator,
            })),
            (None, None) => Ok(None),
            _ => Err(NvhError::Corrupt(
                "single-table and chunk-table descriptors disagree on whether a mapper exists".into(),
            )),
        }
    }

    /// Flush both inner tables. Always `single` before `chunk` — a documented
    /// (not runtime-enforced) lock ordering.
    pub fn persist(&self) -> Result<()> {
        self.single.persist()?;
        self.chunk.persist()?;
        Ok(())
    }

    /// Diagnostic occupancy figure: the more loaded of the two inner tables,
    /// since that is the one closer to refusing inserts.
    pub fn load_factor(&self) -> f64 {
        self.single.load_factor().max(self.chunk.load_factor())
    }

    /// `get_blocks(inum, lblk, n, create) -> (phys, run_len)`. Consults
    /// `single` before `chunk`. Returns only the first contiguous run; on a
    /// miss with `create = true`, allocates the residual via the external
    /// allocator and records it.
    pub fn get_blocks(
        &self,
        inum: u32,
        lblk: u32,
        n: u32,
        create: bool,
    ) -> Result<Option<(u64, u32)>> {
        if n == 0 {
            return Err(NvhError::Invalid("get_blocks requires n > 0".into()));
        }
        if let Some(run) = self.probe_existing_run(inum, lblk, n)? {
            return Ok(Some(run));
        }
        if !create {
            return Ok(None);
        }
        self.allocate_run(inum, lblk, n).map(Some)
    }

    /// Walk forward from `lblk` merging contiguous hits from either table,
    /// stopping at the first miss or discontinuity.
    fn probe_existing_run(&self, inum: u32, lblk: u32, n: u32) -> Result<Option<(u64, u32)>> {
        let first = match self.lookup_one(inum, lblk)? {
            Some((phys, avail)) => (phys, avail.min(n)),
            None => return Ok(None),
        };
        let (first_phys, mut run) = first;
        let mut next_lblk = lblk + run;
        while run < n {
            let expected_phys = first_phys + run as u64;
            match self.lookup_one(inum, next_lblk)? {
                Some((phys, avail)) if phys == expected_phys => {
                    let take = avail.min(n - run);
                    run += take;
                    next_lblk += take;
                }
                _ => break,
            }
        }
        Ok(Some((first_phys, run)))
    }

    /// Single-block lookup returning `(physical_block, available_run)` where
    /// `available_run` is however much of a contiguous run that entry
    /// already vouches for.
    fn lookup_one(&self, inum: u32, lblk: u32) -> Result<Option<(u64, u32)>> {
        if let Some(v) = self.single.lookup(make_key(inum, lblk))? {
            if !v.is_none() {
                return Ok(Some((v.addr(), v.idx() as u32 + 1)));
            }
        }
        let offset = lblk & RANGE_BITS_U32;
        if let Some(v) = self.chunk.lookup(range_key(inum, lblk))? {
            if !v.is_none() {
                let remaining = RANGE_SIZE as u32 - offset;
                return Ok(Some((v.addr() + offset as u64, remaining)));
            }
        }
        Ok(None)
    }

    /// Allocate-on-miss: ask the external allocator for the residual `n`,
    /// then record it as one chunk entry (request at least half a range,
    /// range-aligned) or as per-block single entries.
    ///
    /// A single entry's `idx` carries the remaining run length after this
    /// block, capped by `CONTINUITY_BITS` (0..15, a 16-block window) — half
    /// of `MAX_CONTIGUOUS_BLOCKS`, since that constant bounds the codec's
    /// field width in general, not specifically how far a single-table
    /// insert advertises a run before the caller needs another probe. A run
    /// longer than 16 blocks still gets per-block entries correctly; callers
    /// just take more than one hop through `probe_existing_run` to see all
    /// of it, which is no different from the cost of stepping across a
    /// genuine discontinuity.
    fn allocate_run(&self, inum: u32, lblk: u32, n: u32) -> Result<(u64, u32)> {
        let aligned = lblk & RANGE_BITS_U32 == 0;
        let range_size = RANGE_SIZE as u32;
        if aligned && n >= range_size / 2 {
            let run = n.min(range_size);
            let phys = self.allocator.allocate(run)?;
            let value = PackedValue::encode(true, 0, phys);
            match self.chunk.insert(range_key(inum, lblk), value) {
                Ok(_) => return Ok((phys, run)),
                Err(e) => {
                    warn!("chunk insert failed ({}), falling back to single entries", e);
                    self.allocator.free(phys, run)?;
                }
            }
        }
        let phys = self.allocator.allocate(n)?;
        for i in 0..n {
            let remaining = (n - i - 1).min(15);
            let value = PackedValue::encode(false, remaining as u8, phys + i as u64);
            self.single.insert(make_key(inum, lblk + i), value)?;
        }
        Ok((phys, n))
    }

    /// `truncate(start..=end)`: for each hit, free the run the entry itself
    /// names and remove it, skipping forward by the run length — no separate
    /// contiguity scan.
    pub fn truncate(&self, inum: u32, start: u32, end: u32) -> Result<()> {
        let mut lblk = start;
        while lblk <= end {
            if let Some(v) = self.single.lookup(make_key(inum, lblk))? {
                if !v.is_none() {
                    let run = v.idx() as u32 + 1;
                    self.allocator.free(v.addr(), run)?;
                    self.single.remove(make_key(inum, lblk))?;
                    lblk = lblk.saturating_add(run.max(1));
                    continue;
                }
            }
            let key = range_key(inum, lblk);
            if let Some(v) = self.chunk.lookup(key)? {
                if !v.is_none() {
                    self.allocator.free(v.addr(), RANGE_SIZE as u32)?;
                    self.chunk.remove(key)?;
                    let range_start = lblk & !RANGE_BITS_U32;
                    lblk = range_start.saturating_add(RANGE_SIZE as u32);
                    continue;
                }
            }
            lblk = lblk.saturating_add(1);
            if lblk == 0 {
                break; // wrapped past u32::MAX
            }
        }
        Ok(())
    }
}
