//! Fixed-bucket memory pool accounting.
//!
//! A single region of `pool_size` bytes is carved on demand into blocks of
//! the configured bucket sizes. A released block goes onto its bucket's free
//! count and is reused by the next request of that size class; carved bytes
//! never move between buckets. Each carved block costs its bucket size plus a
//! fixed block header.
//!
//! The pool only keeps accounts: it hands out [`PoolBlock`] receipts and
//! tracks bytes against the region budget, but owns no backing memory.
//! Message content lives in heap buffers owned by the buffer descriptors.

use crate::config::MAX_MEM_BLOCK_SIZES;
use heapless::Vec;
use serde::{Deserialize, Serialize};

/// Per-block bookkeeping overhead carved alongside each block.
pub const BLOCK_HEADER_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool exhausted allocating {requested} bytes")]
    Exhausted { requested: usize },

    #[error("{requested} bytes exceeds the largest block size {largest}")]
    TooLarge { requested: usize, largest: usize },
}

/// Token for an allocated block. Must be handed back to [`MemPool::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct PoolBlock {
    bucket: u8,
    requested: usize,
}

impl PoolBlock {
    pub fn requested(&self) -> usize {
        self.requested
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BucketStats {
    pub block_size: usize,
    pub num_created: u32,
    pub num_free: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemPoolStats {
    pub pool_size: usize,
    pub num_blocks_requested: u32,
    pub num_failed_requests: u32,
    pub num_free_bytes: usize,
    pub buckets: alloc::vec::Vec<BucketStats>,
}

#[derive(Debug)]
pub struct MemPool {
    block_sizes: Vec<usize, MAX_MEM_BLOCK_SIZES>,
    created: Vec<u32, MAX_MEM_BLOCK_SIZES>,
    free: Vec<u32, MAX_MEM_BLOCK_SIZES>,
    pool_size: usize,
    carved: usize,
    blocks_requested: u32,
    failed_requests: u32,
}

impl MemPool {
    /// `block_sizes` must be ascending; extra sizes beyond the table ceiling are ignored.
    pub fn new(pool_size: usize, block_sizes: &[usize]) -> Self {
        let mut sizes = Vec::new();
        let mut created = Vec::new();
        let mut free = Vec::new();
        for size in block_sizes.iter().take(MAX_MEM_BLOCK_SIZES) {
            let _ = sizes.push(*size);
            let _ = created.push(0);
            let _ = free.push(0);
        }

        Self {
            block_sizes: sizes,
            created,
            free,
            pool_size,
            carved: 0,
            blocks_requested: 0,
            failed_requests: 0,
        }
    }

    /// Allocate a block of at least `size` bytes. Fails without side effects
    /// other than the failure counter.
    pub fn allocate(&mut self, size: usize) -> Result<PoolBlock, PoolError> {
        let Some(bucket) = self.block_sizes.iter().position(|b| *b >= size) else {
            self.failed_requests = self.failed_requests.saturating_add(1);
            return Err(PoolError::TooLarge {
                requested: size,
                largest: self.block_sizes.last().copied().unwrap_or(0),
            });
        };

        if self.free[bucket] > 0 {
            self.free[bucket] -= 1;
        } else {
            let cost = self.block_sizes[bucket] + BLOCK_HEADER_BYTES;
            if self.pool_size - self.carved < cost {
                self.failed_requests = self.failed_requests.saturating_add(1);
                return Err(PoolError::Exhausted { requested: size });
            }
            self.carved += cost;
            self.created[bucket] += 1;
        }

        self.blocks_requested = self.blocks_requested.wrapping_add(1);
        Ok(PoolBlock {
            bucket: bucket as u8,
            requested: size,
        })
    }

    pub fn release(&mut self, block: PoolBlock) {
        let bucket = usize::from(block.bucket);
        debug_assert!(
            self.free[bucket] < self.created[bucket],
            "released more blocks than were created in bucket {bucket}"
        );
        self.free[bucket] += 1;
    }

    /// Bytes not tied up in allocated blocks: never-carved space plus free blocks.
    pub fn free_bytes(&self) -> usize {
        let parked: usize = self
            .block_sizes
            .iter()
            .zip(self.free.iter())
            .map(|(size, free)| (size + BLOCK_HEADER_BYTES) * (*free as usize))
            .sum();
        self.pool_size - self.carved + parked
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Bucket size that a request of `size` bytes would occupy.
    pub fn block_size_for(&self, size: usize) -> Option<usize> {
        self.block_sizes.iter().copied().find(|b| *b >= size)
    }

    pub fn get_stats(&self) -> MemPoolStats {
        MemPoolStats {
            pool_size: self.pool_size,
            num_blocks_requested: self.blocks_requested,
            num_failed_requests: self.failed_requests,
            num_free_bytes: self.free_bytes(),
            buckets: self
                .block_sizes
                .iter()
                .zip(self.created.iter().zip(self.free.iter()))
                .map(|(size, (created, free))| BucketStats {
                    block_size: *size,
                    num_created: *created,
                    num_free: *free,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smallest_fitting_bucket() {
        let mut pool = MemPool::new(4096, &[8, 16, 64, 256]);
        let block = pool.allocate(10).unwrap();
        assert_eq!(pool.free_bytes(), 4096 - (16 + BLOCK_HEADER_BYTES));
        assert_eq!(pool.block_size_for(10), Some(16));
        pool.release(block);
        assert_eq!(pool.free_bytes(), 4096);
    }

    #[test]
    fn test_free_blocks_are_reused() {
        let mut pool = MemPool::new(4096, &[64]);
        let first = pool.allocate(64).unwrap();
        pool.release(first);
        let _second = pool.allocate(32).unwrap();

        let stats = pool.get_stats();
        assert_eq!(stats.buckets[0].num_created, 1);
        assert_eq!(stats.buckets[0].num_free, 0);
        assert_eq!(stats.num_blocks_requested, 2);
    }

    #[test]
    fn test_exhaustion_has_no_side_effects() {
        let mut pool = MemPool::new(2 * (64 + BLOCK_HEADER_BYTES), &[64]);
        let _a = pool.allocate(64).unwrap();
        let _b = pool.allocate(64).unwrap();
        let before = pool.free_bytes();

        assert_eq!(pool.allocate(1), Err(PoolError::Exhausted { requested: 1 }));
        assert_eq!(pool.free_bytes(), before);
        assert_eq!(pool.get_stats().num_failed_requests, 1);
    }

    #[test]
    fn test_oversize_request() {
        let mut pool = MemPool::new(4096, &[8, 16]);
        assert_eq!(
            pool.allocate(17),
            Err(PoolError::TooLarge {
                requested: 17,
                largest: 16
            })
        );
    }
}
