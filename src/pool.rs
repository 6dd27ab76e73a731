//! A shared pool of fixed-size memory blocks.
//!
//! The pool is the one piece of codec state that is meant to be shared between serializer
//! instances running on different threads or tasks. It is created once by the embedding system
//! and handed to every [`BinarySerializer`](crate::BinarySerializer) that should draw from it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use log::trace;
use parking_lot::Mutex;

/// Block size used by [`ChunkPool::default`].
pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;

/// A free list of equally sized blocks.
///
/// Borrowing never blocks and never fails: when the free list is empty a new block is
/// allocated, so the pool grows to the peak number of blocks in use at once. Cloning a
/// `ChunkPool` produces another handle to the same free list.
#[derive(Clone)]
pub struct ChunkPool {
    inner: Arc<PoolInner>,
}

/// A point-in-time view of a pool's bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub block_size: usize,
    /// Blocks allocated over the pool's lifetime and not yet released by [`ChunkPool::shrink`].
    pub allocated: usize,
    /// Blocks sitting in the free list.
    pub available: usize,
    /// Blocks currently borrowed.
    pub leased: usize,
}

struct PoolInner {
    block_size: usize,
    free_list: Mutex<Vec<BytesMut>>,
    allocated: AtomicUsize,
    leased: AtomicUsize,
}

impl Default for ChunkPool {
    fn default() -> Self {
        ChunkPool::new(DEFAULT_BLOCK_SIZE)
    }
}

impl ChunkPool {
    /// Creates an empty pool handing out blocks of `block_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero.
    pub fn new(block_size: usize) -> ChunkPool {
        assert!(block_size > 0, "chunk pool block size must be non-zero");
        ChunkPool {
            inner: Arc::new(PoolInner {
                block_size,
                free_list: Mutex::new(Vec::new()),
                allocated: AtomicUsize::new(0),
                leased: AtomicUsize::new(0),
            }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Takes a block of exactly `block_size()` bytes, recycled if one is free.
    ///
    /// The content of a recycled block is unspecified.
    pub fn borrow(&self) -> BytesMut {
        let recycled = self.inner.free_list.lock().pop();
        let block = match recycled {
            Some(block) => block,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                trace!("chunk pool allocating a {} byte block", self.inner.block_size);
                BytesMut::zeroed(self.inner.block_size)
            }
        };
        self.inner.leased.fetch_add(1, Ordering::Relaxed);
        block
    }

    /// Makes a block available for future borrows.
    ///
    /// Blocks that did not come from this pool (wrong length) are dropped instead of kept.
    pub fn give_back(&self, block: BytesMut) {
        self.inner.leased.fetch_sub(1, Ordering::Relaxed);
        if block.len() != self.inner.block_size {
            self.inner.allocated.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        self.inner.free_list.lock().push(block);
    }

    /// Releases every idle block, returning how many were freed.
    pub fn shrink(&self) -> usize {
        let released = {
            let mut list = self.inner.free_list.lock();
            let released = list.len();
            list.clear();
            released
        };
        self.inner.allocated.fetch_sub(released, Ordering::Relaxed);
        released
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            block_size: self.inner.block_size,
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            available: self.inner.free_list.lock().len(),
            leased: self.inner.leased.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPool").field("stats", &self.stats()).finish()
    }
}
