//! The persistent hash table, plus persist/recover, which is colocated here
//! because both govern the same metadata descriptor.
//!
//! Three parallel arrays of 64-bit words (keys, hashes, values), each
//! spanning `ceil(size * 8 / block_bytes)` contiguous NVRAM blocks, back an
//! open-addressed table probed with double hashing. Reading the hashes array
//! is the hot path; keys are only re-read on a hash match.

use crate::arena::Arena;
use crate::config::{
    TableConfig, BLOCK_SIZE_BYTES, EMPTY_KEY, REHASH_REFUSAL_LOAD, TOMBSTONE_HASH, TOMBSTONE_KEY,
};
use crate::device::BlockDevice;
use crate::error::{NvhError, Result};
use crate::hash::locks::StripeLocks;
use crate::hash::{DirectHasher, Key, KeyHasher};
use crate::value::PackedValue;
use log::{debug, info, warn};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const MAGIC1: u32 = 0x4E56_5448; // "NVTH"
const MAGIC2: u32 = 0x4153_4831; // "ASH1"

const DESCRIPTOR_FIXED_BYTES: usize = 4 + 4 + 8 * 9;

/// On-disk metadata descriptor, exactly one block wide. `bytemuck::Pod` lets
/// the wire format and the in-memory representation stay identical by
/// construction.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct MetadataDescriptor {
    magic1: u32,
    magic2: u32,
    size: u64,
    mod_: u64,
    mask: u64,
    nnodes: u64,
    noccupied: u64,
    nvram_size: u64,
    keys_start: u64,
    hashes_start: u64,
    values_start: u64,
    _pad: [u8; BLOCK_SIZE_BYTES - DESCRIPTOR_FIXED_BYTES],
}

impl MetadataDescriptor {
    fn magic_matches(&self) -> bool {
        self.magic1 == MAGIC1 && self.magic2 == MAGIC2
    }
}

fn words_per_block(block_size: usize) -> u64 {
    (block_size / 8) as u64
}

fn array_blocks(size: u64, block_size: usize) -> u64 {
    let wpb = words_per_block(block_size);
    (size + wpb - 1) / wpb
}

fn read_word(device: &dyn BlockDevice, start_block: u64, index: u64) -> Result<u64> {
    let wpb = words_per_block(device.block_size());
    let block_addr = start_block + index / wpb;
    let offset = (index % wpb) as usize * 8;
    let mut buf = vec![0u8; device.block_size()];
    device.read_block(block_addr, &mut buf)?;
    Ok(u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap()))
}

fn write_word(device: &dyn BlockDevice, start_block: u64, index: u64, value: u64) -> Result<()> {
    let wpb = words_per_block(device.block_size());
    let block_addr = start_block + index / wpb;
    let offset = (index % wpb) as usize * 8;
    let mut buf = vec![0u8; device.block_size()];
    device.read_block(block_addr, &mut buf)?;
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    device.write_block(block_addr, &buf)
}

/// A persistent, striped-lock, open-addressed hash table whose three backing
/// arrays live in NVRAM blocks. Generic over [`KeyHasher`]; defaults to the
/// built-in multiplicative hash below.
pub struct PersistentHashTable<H: KeyHasher = DirectHasher> {
    device: Arc<dyn BlockDevice>,
    descriptor_block: u64,
    size: u64,
    mod_: u64,
    mask: u64,
    nvram_size: u64,
    keys_start: u64,
    hashes_start: u64,
    values_start: u64,
    nnodes: AtomicU64,
    noccupied: AtomicU64,
    locks: StripeLocks,
    _hasher: PhantomData<H>,
}

impl<H: KeyHasher> PersistentHashTable<H> {
    /// Create a fresh table sized for `config.max_entries`, carving its three
    /// arrays out of `arena` and writing an initial descriptor at
    /// `descriptor_block`.
    pub fn new_table(
        config: &TableConfig,
        device: Arc<dyn BlockDevice>,
        arena: &Arena,
        descriptor_block: u64,
    ) -> Result<Self> {
        if config.max_entries == 0 {
            return Err(NvhError::Invalid("max_entries must be > 0".into()));
        }
        let min_size = (config.max_entries as f64 / config.target_load).ceil() as u64;
        let size = min_size.next_power_of_two().max(8);
        let mask = size - 1;
        let mod_ = size;

        let blocks_per_array = array_blocks(size, device.block_size());
        let keys_start = arena.allocate_range(blocks_per_array)?;
        let hashes_start = arena.allocate_range(blocks_per_array)?;
        let values_start = arena.allocate_range(blocks_per_array)?;

        let zero = vec![0u8; device.block_size()];
        for start in [keys_start, hashes_start, values_start] {
            for b in 0..blocks_per_array {
                device.write_block(start + b, &zero)?;
            }
        }

        info!(
            "created hash table: size={} stripe_count={} arrays at keys={} hashes={} values={}",
            size, config.stripe_count, keys_start, hashes_start, values_start
        );

        let table = Self {
            device: device.clone(),
            descriptor_block,
            size,
            mod_,
            mask,
            nvram_size: device.block_count(),
            keys_start,
            hashes_start,
            values_start,
            nnodes: AtomicU64::new(0),
            noccupied: AtomicU64::new(0),
            locks: StripeLocks::new(config.stripe_count),
            _hasher: PhantomData,
        };
        table.write_descriptor()?;
        Ok(table)
    }

    /// Read the descriptor at `descriptor_block`. Returns `Ok(None)` if the
    /// magic doesn't match — "no table yet, initialize fresh".
    pub fn load_table(
        device: Arc<dyn BlockDevice>,
        descriptor_block: u64,
        stripe_count: usize,
    ) -> Result<Option<Self>> {
        let mut buf = vec![0u8; device.block_size()];
        device.read_block(descriptor_block, &mut buf)?;
        if buf.len() != std::mem::size_of::<MetadataDescriptor>() {
            return Err(NvhError::Corrupt(
                "device block size does not match descriptor size".into(),
            ));
        }
        let desc: &MetadataDescriptor = bytemuck::from_bytes(&buf);
        if !desc.magic_matches() || desc.size == 0 {
            debug!("no valid descriptor at block {}", descriptor_block);
            return Ok(None);
        }
        info!(
            "loaded hash table: size={} nnodes={} noccupied={}",
            desc.size, desc.nnodes, desc.noccupied
        );
        Ok(Some(Self {
            device,
            descriptor_block,
            size: desc.size,
            mod_: desc.mod_,
            mask: desc.mask,
            nvram_size: desc.nvram_size,
            keys_start: desc.keys_start,
            hashes_start: desc.hashes_start,
            values_start: desc.values_start,
            nnodes: AtomicU64::new(desc.nnodes),
            noccupied: AtomicU64::new(desc.noccupied),
            locks: StripeLocks::new(stripe_count),
            _hasher: PhantomData,
        }))
    }

    fn write_descriptor(&self) -> Result<()> {
        let desc = MetadataDescriptor {
            magic1: MAGIC1,
            magic2: MAGIC2,
            size: self.size,
            mod_: self.mod_,
            mask: self.mask,
            nnodes: self.nnodes.load(Ordering::Acquire),
            noccupied: self.noccupied.load(Ordering::Acquire),
            nvram_size: self.nvram_size,
            keys_start: self.keys_start,
            hashes_start: self.hashes_start,
            values_start: self.values_start,
            _pad: [0u8; BLOCK_SIZE_BYTES - DESCRIPTOR_FIXED_BYTES],
        };
        let bytes = bytemuck::bytes_of(&desc);
        self.device.write_block(self.descriptor_block, bytes)
    }

    /// Persist: flush dirty bucket blocks, then write the descriptor — the
    /// commit point.
    pub fn persist(&self) -> Result<()> {
        let _meta = self.locks.metadata.lock().unwrap();
        self.device.sync()?;
        self.write_descriptor()?;
        self.device.sync()?;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn len(&self) -> u64 {
        self.nnodes.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn load_factor(&self) -> f64 {
        self.noccupied.load(Ordering::Acquire) as f64 / self.size as f64
    }

    #[inline]
    fn hash_key(&self, key: Key) -> u64 {
        H::hash(key) | 1
    }

    fn read_hash(&self, i: u64) -> Result<u64> {
        read_word(self.device.as_ref(), self.hashes_start, i)
    }
    fn write_hash(&self, i: u64, h: u64) -> Result<()> {
        write_word(self.device.as_ref(), self.hashes_start, i, h)
    }
    fn read_key(&self, i: u64) -> Result<u64> {
        read_word(self.device.as_ref(), self.keys_start, i)
    }
    fn write_key(&self, i: u64, k: u64) -> Result<()> {
        write_word(self.device.as_ref(), self.keys_start, i, k)
    }
    fn read_value(&self, i: u64) -> Result<PackedValue> {
        read_word(self.device.as_ref(), self.values_start, i).map(PackedValue::from_raw)
    }
    fn write_value(&self, i: u64, v: PackedValue) -> Result<()> {
        write_word(self.device.as_ref(), self.values_start, i, v.raw())
    }

    /// Double-hashing probe sequence, bounded to `size` steps by callers (an
    /// unbounded iterator would spin forever on a corrupt table that never
    /// reports empty).
    fn probe_sequence(&self, h: u64) -> impl Iterator<Item = u64> {
        let mask = self.mask;
        let step = (1 + (((h >> 16) | 1) % (self.mod_ - 2))) | 1;
        let mut i = h & mask;
        let mut first = true;
        std::iter::from_fn(move || {
            if !first {
                i = (i + step) & mask;
            }
            first = false;
            Some(i)
        })
    }

    pub fn lookup(&self, key: Key) -> Result<Option<PackedValue>> {
        let h = self.hash_key(key);
        for i in self.probe_sequence(h).take(self.size as usize) {
            let stripe = self.locks.stripe(i, self.size);
            let guard = stripe.read().unwrap();
            let stored_hash = self.read_hash(i)?;
            if stored_hash == 0 {
                drop(guard);
                return Ok(None);
            }
            if stored_hash == TOMBSTONE_HASH && self.read_key(i)? == TOMBSTONE_KEY {
                drop(guard);
                continue;
            }
            if stored_hash == h {
                let k = self.read_key(i)?;
                if k == key.0 {
                    let v = self.read_value(i)?;
                    drop(guard);
                    return Ok(Some(v));
                }
                drop(guard);
            } else {
                drop(guard);
            }
        }
        panic!("probe chain exceeded table size: out-of-space invariant violated");
    }

    pub fn contains(&self, key: Key) -> Result<bool> {
        Ok(self.lookup(key)?.is_some())
    }

    /// Insert or overwrite. Returns `Ok(true)` for a new key, `Ok(false)` for
    /// an overwritten existing key. The commit slot is found optimistically
    /// under read locks, then re-verified under its write lock before the
    /// write lands — concurrent writers cannot both land in the same slot.
    pub fn insert(&self, key: Key, value: PackedValue) -> Result<bool> {
        let h = self.hash_key(key);
        loop {
            let mut tombstone_slot: Option<u64> = None;
            let mut empty_slot: Option<u64> = None;
            let mut found_slot: Option<u64> = None;

            for i in self.probe_sequence(h).take(self.size as usize) {
                let stripe = self.locks.stripe(i, self.size);
                let guard = stripe.read().unwrap();
                let stored_hash = self.read_hash(i)?;
                if stored_hash == 0 {
                    drop(guard);
                    empty_slot = Some(i);
                    break;
                } else if stored_hash == TOMBSTONE_HASH && self.read_key(i)? == TOMBSTONE_KEY {
                    drop(guard);
                    if tombstone_slot.is_none() {
                        tombstone_slot = Some(i);
                    }
                    continue;
                } else if stored_hash == h {
                    let k = self.read_key(i)?;
                    drop(guard);
                    if k == key.0 {
                        found_slot = Some(i);
                        break;
                    }
                } else {
                    drop(guard);
                }
            }

            if let Some(i) = found_slot {
                let stripe = self.locks.stripe(i, self.size);
                let _w = stripe.write().unwrap();
                if self.read_hash(i)? == h && self.read_key(i)? == key.0 {
                    self.write_value(i, value)?;
                    return Ok(false);
                }
                continue;
            }

            let commit_slot = match tombstone_slot.or(empty_slot) {
                Some(s) => s,
                None => panic!("probe chain exceeded table size: out-of-space invariant violated"),
            };
            let reused_tombstone = tombstone_slot == Some(commit_slot);

            let stripe = self.locks.stripe(commit_slot, self.size);
            let _w = stripe.write().unwrap();
            let cur_hash = self.read_hash(commit_slot)?;
            let still_free = if reused_tombstone {
                cur_hash == TOMBSTONE_HASH
            } else {
                cur_hash == 0
            };
            if !still_free {
                continue;
            }

            {
                let _meta = self.locks.metadata.lock().unwrap();
                if !reused_tombstone {
                    let noccupied = self.noccupied.load(Ordering::Acquire);
                    let ratio = (noccupied + 1) as f64 / self.size as f64;
                    if ratio > REHASH_REFUSAL_LOAD {
                        warn!(
                            "refusing insert: occupancy would reach {:.2}, above {:.2} ceiling",
                            ratio, REHASH_REFUSAL_LOAD
                        );
                        return Err(NvhError::NoSpace(
                            "table occupancy above refusal threshold".into(),
                        ));
                    }
                }
                self.write_key(commit_slot, key.0)?;
                self.write_hash(commit_slot, h)?;
                self.write_value(commit_slot, value)?;
                self.nnodes.fetch_add(1, Ordering::AcqRel);
                if !reused_tombstone {
                    self.noccupied.fetch_add(1, Ordering::AcqRel);
                }
            }
            return Ok(true);
        }
    }

    /// Like `insert`, kept as a distinct name for call-site clarity: the u64
    /// values this table stores need no destructor, unlike the generic
    /// glib-style tables `replace` is traditionally paired with.
    pub fn replace(&self, key: Key, value: PackedValue) -> Result<bool> {
        self.insert(key, value)
    }

    pub fn remove(&self, key: Key) -> Result<bool> {
        let h = self.hash_key(key);
        for i in self.probe_sequence(h).take(self.size as usize) {
            let stripe = self.locks.stripe(i, self.size);
            let guard = stripe.read().unwrap();
            let stored_hash = self.read_hash(i)?;
            if stored_hash == 0 {
                drop(guard);
                return Ok(false);
            }
            if stored_hash == TOMBSTONE_HASH && self.read_key(i)? == TOMBSTONE_KEY {
                drop(guard);
                continue;
            }
            if stored_hash == h {
                let k = self.read_key(i)?;
                drop(guard);
                if k == key.0 {
                    let stripe = self.locks.stripe(i, self.size);
                    let _w = stripe.write().unwrap();
                    if self.read_hash(i)? == h && self.read_key(i)? == key.0 {
                        self.write_key(i, TOMBSTONE_KEY)?;
                        self.write_hash(i, TOMBSTONE_HASH)?;
                        self.nnodes.fetch_sub(1, Ordering::AcqRel);
                        return Ok(true);
                    }
                    continue;
                }
            } else {
                drop(guard);
            }
        }
        panic!("probe chain exceeded table size: out-of-space invariant violated");
    }

    /// Visit every live `(key, value)` pair. Takes each bucket's read lock in
    /// turn; never holds more than one stripe lock at a time.
    pub fn foreach<F: FnMut(Key, PackedValue)>(&self, mut f: F) -> Result<()> {
        for i in 0..self.size {
            let stripe = self.locks.stripe(i, self.size);
            let _g = stripe.read().unwrap();
            let stored_hash = self.read_hash(i)?;
            if stored_hash == 0 || stored_hash == TOMBSTONE_HASH {
                continue;
            }
            let k = self.read_key(i)?;
            if k == EMPTY_KEY || k == TOMBSTONE_KEY {
                continue;
            }
            let v = self.read_value(i)?;
            f(Key(k), v);
        }
        Ok(())
    }

    pub fn find<P: Fn(Key, PackedValue) -> bool>(&self, predicate: P) -> Result<Option<(Key, PackedValue)>> {
        let mut result = None;
        self.foreach(|k, v| {
            if result.is_none() && predicate(k, v) {
                result = Some((k, v));
            }
        })?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MmapBlockDevice;
    use tempfile::tempdir;

    fn new_test_table(max_entries: u64) -> (PersistentHashTable, Arc<MmapBlockDevice>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.img");
        let block_count = 4096;
        let device = Arc::new(MmapBlockDevice::create(&path, block_count, BLOCK_SIZE_BYTES).unwrap());
        let arena = Arena::new(block_count);
        let cfg = TableConfig::new(max_entries);
        let descriptor_block = arena.single_descriptor_block();
        let table =
            PersistentHashTable::<DirectHasher>::new_table(&cfg, device.clone(), &arena, descriptor_block)
                .unwrap();
        (table, device, dir)
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let (table, _dev, _dir) = new_test_table(64);
        let key = Key::make(7, 15);
        let value = PackedValue::encode(false, 0, 1015);
        assert_eq!(table.insert(key, value).unwrap(), true);
        assert_eq!(table.lookup(key).unwrap(), Some(value));
    }

    #[test]
    fn overwriting_an_existing_key_returns_false() {
        let (table, _dev, _dir) = new_test_table(64);
        let key = Key::make(1, 1);
        table.insert(key, PackedValue::encode(false, 0, 10)).unwrap();
        let inserted_again = table.insert(key, PackedValue::encode(false, 0, 20)).unwrap();
        assert_eq!(inserted_again, false);
        assert_eq!(table.lookup(key).unwrap().unwrap().addr(), 20);
    }

    #[test]
    fn removed_key_looks_up_absent() {
        let (table, _dev, _dir) = new_test_table(64);
        let key = Key::make(3, 9);
        table.insert(key, PackedValue::encode(false, 0, 5)).unwrap();
        assert!(table.remove(key).unwrap());
        assert_eq!(table.lookup(key).unwrap(), None);
        assert!(!table.remove(key).unwrap());
    }

    #[test]
    fn nnodes_tracks_live_entries_exactly() {
        let (table, _dev, _dir) = new_test_table(64);
        for i in 0..10u32 {
            table
                .insert(Key::make(1, i), PackedValue::encode(false, 0, i as u64 + 1))
                .unwrap();
        }
        assert_eq!(table.len(), 10);
        table.remove(Key::make(1, 0)).unwrap();
        assert_eq!(table.len(), 9);
    }

    #[test]
    fn tombstone_slot_is_reused_without_growing_noccupied() {
        let (table, _dev, _dir) = new_test_table(64);
        let before = table.load_factor();
        table.insert(Key::make(1, 1), PackedValue::encode(false, 0, 10)).unwrap();
        table.remove(Key::make(1, 1)).unwrap();
        let after_remove = table.load_factor();
        table.insert(Key::make(1, 2), PackedValue::encode(false, 0, 20)).unwrap();
        let after_reinsert = table.load_factor();
        assert!(after_remove > before);
        assert_eq!(after_reinsert, after_remove);
    }

    #[test]
    fn refuses_inserts_above_occupancy_ceiling() {
        let (table, _dev, _dir) = new_test_table(8);
        let size = table.size();
        let mut last_err = None;
        for i in 0..size {
            match table.insert(Key::make(1, i as u32), PackedValue::encode(false, 0, i + 1)) {
                Ok(_) => {}
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }
        assert!(last_err.is_some());
        // Pre-existing keys still look up fine.
        assert!(table.lookup(Key::make(1, 0)).unwrap().is_some());
    }

    #[test]
    fn persist_then_load_answers_identically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.img");
        let block_count = 4096;
        let device = Arc::new(MmapBlockDevice::create(&path, block_count, BLOCK_SIZE_BYTES).unwrap());
        let arena = Arena::new(block_count);
        let cfg = TableConfig::new(64);
        let descriptor_block = arena.single_descriptor_block();

        let keys: Vec<Key> = (0..20u32).map(|i| Key::make(2, i)).collect();
        {
            let table = PersistentHashTable::<DirectHasher>::new_table(
                &cfg,
                device.clone(),
                &arena,
                descriptor_block,
            )
            .unwrap();
            for (i, k) in keys.iter().enumerate() {
                table.insert(*k, PackedValue::encode(false, 0, i as u64 + 1)).unwrap();
            }
            table.persist().unwrap();
        }

        let reloaded =
            PersistentHashTable::<DirectHasher>::load_table(device, descriptor_block, 1024)
                .unwrap()
                .expect("descriptor should be valid after persist");
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(reloaded.lookup(*k).unwrap().unwrap().addr(), i as u64 + 1);
        }
        assert_eq!(reloaded.len(), keys.len() as u64);
    }

    #[test]
    fn load_without_a_prior_table_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.img");
        let block_count = 64;
        let device = Arc::new(MmapBlockDevice::create(&path, block_count, BLOCK_SIZE_BYTES).unwrap());
        let result =
            PersistentHashTable::<DirectHasher>::load_table(device, block_count - 1, 16).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn concurrent_inserts_of_disjoint_keys_all_land() {
        use std::thread;
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.img");
        let block_count = 1 << 16;
        let device = Arc::new(MmapBlockDevice::create(&path, block_count, BLOCK_SIZE_BYTES).unwrap());
        let arena = Arena::new(block_count);
        let cfg = TableConfig::new(100_000);
        let descriptor_block = arena.single_descriptor_block();
        let table = Arc::new(
            PersistentHashTable::<DirectHasher>::new_table(&cfg, device, &arena, descriptor_block)
                .unwrap(),
        );

        let threads_n = 8u32;
        let per_thread = 1000u32;
        let mut handles = Vec::new();
        for t in 0..threads_n {
            let table = table.clone();
            handles.push(thread::spawn(move || {
                for i in 0..per_thread {
                    let key = Key::make(t, i);
                    table
                        .insert(key, PackedValue::encode(false, 0, (t * per_thread + i) as u64 + 1))
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(table.len(), (threads_n * per_thread) as u64);
        for t in 0..threads_n {
            for i in 0..per_thread {
                assert!(table.lookup(Key::make(t, i)).unwrap().is_some());
            }
        }
    }
}
