use criterion::{criterion_group, criterion_main, BenchmarkId, Bencher, Criterion, Throughput};
use once_cell::sync::Lazy;
use rand::Rng;
use std::sync::Arc;
use tempfile::tempdir;

use nvhash::alloc::BumpBlockAllocator;
use nvhash::config::BLOCK_SIZE_BYTES;
use nvhash::device::MmapBlockDevice;
use nvhash::NvHashIndex;

const CAPACITY: [u64; 3] = [512, 4096, 10_024];
const TOTAL_OPERATIONS: u64 = 1_000;

static RANDOM_LBLKS: Lazy<Vec<u32>> = Lazy::new(|| {
    let mut rng = rand::thread_rng();
    (0..TOTAL_OPERATIONS)
        .map(|_| rng.gen_range(0, CAPACITY[2] as u32))
        .collect()
});

fn new_index(capacity: u64) -> NvHashIndex {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dev.img");
    let block_count = (capacity * 8).max(1 << 16);
    let device = Arc::new(MmapBlockDevice::create(&path, block_count, BLOCK_SIZE_BYTES).unwrap());
    let allocator = Arc::new(BumpBlockAllocator::new(1, block_count));
    let index = NvHashIndex::init(device, allocator, capacity, 256).unwrap();
    std::mem::forget(dir);
    index
}

fn random_get_blocks(b: &mut Bencher, capacity: u64) {
    let index = new_index(capacity);
    for &lblk in RANDOM_LBLKS.iter() {
        let _ = index.get_blocks(1, lblk, 1, true);
    }
    b.iter(|| {
        for &lblk in RANDOM_LBLKS.iter() {
            let _ = index.get_blocks(1, lblk, 1, false);
        }
    });
}

fn insert_new_blocks(b: &mut Bencher, capacity: u64) {
    b.iter_batched(
        || new_index(capacity),
        |index| {
            for &lblk in RANDOM_LBLKS.iter() {
                let _ = index.get_blocks(1, lblk, 1, true);
            }
        },
        criterion::BatchSize::LargeInput,
    );
}

fn persist_round_trip(b: &mut Bencher, capacity: u64) {
    let index = new_index(capacity);
    for &lblk in RANDOM_LBLKS.iter() {
        let _ = index.get_blocks(1, lblk, 1, true);
    }
    b.iter(|| {
        index.persist().unwrap();
    });
}

fn table(c: &mut Criterion) {
    let mut group = c.benchmark_group("index");
    group.throughput(Throughput::Elements(TOTAL_OPERATIONS));

    for &capacity in CAPACITY.iter() {
        let description = format!("capacity={}", capacity);

        group.bench_with_input(
            BenchmarkId::new("Random get_blocks", description.clone()),
            &capacity,
            |b, &capacity| random_get_blocks(b, capacity),
        );
        group.bench_with_input(
            BenchmarkId::new("Allocate-on-miss get_blocks", description.clone()),
            &capacity,
            |b, &capacity| insert_new_blocks(b, capacity),
        );
        group.bench_with_input(
            BenchmarkId::new("persist", description.clone()),
            &capacity,
            |b, &capacity| persist_round_trip(b, capacity),
        );
    }
    group.finish();
}

criterion_group!(benches, table);
criterion_main!(benches);
