//! The external block allocator collaborator: out of scope for this crate's
//! core, consumed as a trait. `index` calls it to obtain and release physical
//! blocks for file data; it never touches the index's own metadata or array
//! blocks (that's [`crate::arena::Arena`]'s job).

use crate::error::Result;

/// `allocate_blocks(count) -> first_block` / `free_blocks(first, count)`,
/// modeled as a trait so the index can be tested without a real filesystem
/// block allocator behind it.
pub trait BlockAllocator: Send + Sync {
    /// Allocate `count` contiguous physical blocks, returning the first.
    /// Fails with [`crate::error::NvhError::NoSpace`] if none are available.
    fn allocate(&self, count: u32) -> Result<u64>;

    /// Release `count` contiguous physical blocks starting at `first`.
    fn free(&self, first: u64, count: u32) -> Result<()>;
}

/// A test-only allocator fake: hands out forever-increasing ranges and never
/// reclaims freed ones. Not a production allocator — real allocators track
/// free lists or bitmaps; this one exists so `index` can be exercised without
/// pulling in a full file-data allocator.
pub struct BumpBlockAllocator {
    next_free: std::sync::atomic::AtomicU64,
    limit: u64,
}

impl BumpBlockAllocator {
    pub fn new(start: u64, limit: u64) -> Self {
        Self {
            next_free: std::sync::atomic::AtomicU64::new(start),
            limit,
        }
    }
}

impl BlockAllocator for BumpBlockAllocator {
    fn allocate(&self, count: u32) -> Result<u64> {
        use std::sync::atomic::Ordering;
        loop {
            let start = self.next_free.load(Ordering::Acquire);
            let end = start.saturating_add(count as u64);
            if end > self.limit {
                return Err(crate::error::NvhError::NoSpace(format!(
                    "bump allocator exhausted: requested {} blocks from {}, limit is {}",
                    count, start, self.limit
                )));
            }
            if self
                .next_free
                .compare_exchange(start, end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(start);
            }
        }
    }

    fn free(&self, _first: u64, _count: u32) -> Result<()> {
        // Never reclaims; see the type's doc comment.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_disjoint_ranges() {
        let alloc = BumpBlockAllocator::new(1, 1000);
        let a = alloc.allocate(10).unwrap();
        let b = alloc.allocate(5).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 11);
    }

    #[test]
    fn refuses_past_the_limit() {
        let alloc = BumpBlockAllocator::new(1, 10);
        assert!(alloc.allocate(5).is_ok());
        assert!(alloc.allocate(10).is_err());
    }
}
