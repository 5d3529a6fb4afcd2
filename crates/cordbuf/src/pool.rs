// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::num::NonZero;
use std::sync::Arc;

use nm::Event;
use parking_lot::Mutex;

use crate::block::BlockMemory;
use crate::{Block, DEFAULT_BLOCK_SIZE};

#[expect(clippy::cast_possible_truncation, reason = "the default block size is a small constant")]
const DEFAULT_POOL_BLOCK_SIZE: NonZero<u32> = NonZero::new(DEFAULT_BLOCK_SIZE as u32).expect("default block size is non-zero");

/// Configuration for a [`BlockPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPoolOptions {
    pub(crate) block_size: NonZero<u32>,
    pub(crate) max_cached_blocks: usize,
}

impl BlockPoolOptions {
    /// Options with the default block size and cache limit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            block_size: DEFAULT_POOL_BLOCK_SIZE,
            max_cached_blocks: 64,
        }
    }

    /// Sets the capacity of every block the pool hands out.
    #[must_use]
    pub const fn block_size(mut self, size: NonZero<u32>) -> Self {
        self.block_size = size;
        self
    }

    /// Sets how many released blocks the pool keeps for reuse. Blocks released while the
    /// cache is full go back to the allocator.
    #[must_use]
    pub const fn max_cached_blocks(mut self, count: usize) -> Self {
        self.max_cached_blocks = count;
        self
    }
}

impl Default for BlockPoolOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// A pool of equally sized blocks that recycles released block memory.
///
/// The pool is meant to be bound to one connection's receive path through an
/// [`IoPortal`][crate::IoPortal] rather than shared process-wide. Clones are handles to the same
/// pool.
///
/// Blocks keep their pool alive, so the pool can be dropped by its creator while blocks it handed
/// out are still in use; their memory goes back to the allocator once nobody can reuse it.
#[derive(Clone, Debug)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    options: BlockPoolOptions,

    // Only raw memory is cached. Holding whole blocks here would make every cached block keep
    // its own pool alive.
    free: Mutex<Vec<BlockMemory>>,
}

impl BlockPool {
    /// Creates a pool with default options.
    #[must_use]
    #[expect(clippy::new_without_default, reason = "each pool owns separate capacity, so a default instance would be misleading")]
    pub fn new() -> Self {
        Self::with_options(BlockPoolOptions::default())
    }

    /// Creates a pool with the given options.
    #[must_use]
    pub fn with_options(options: BlockPoolOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                options,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The capacity of every block this pool hands out.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.inner.options.block_size.get() as usize
    }

    /// Hands out an empty block, reusing released memory when some is cached.
    ///
    /// # Errors
    ///
    /// Returns an error if no memory is cached and the allocator could not provide more.
    pub fn acquire(&self) -> crate::Result<Block> {
        let cached = self.inner.free.lock().pop();

        let memory = match cached {
            Some(memory) => {
                POOL_BLOCK_REUSED.with(|e| e.observe(memory.capacity() as usize));
                memory
            }
            None => BlockMemory::allocate(self.inner.options.block_size.get())?,
        };

        Ok(Block::from_memory(memory, 0, Some(self.clone())))
    }

    /// The number of released blocks currently kept for reuse.
    #[must_use]
    pub fn cached_blocks(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Returns all cached memory to the allocator.
    pub fn trim(&self) {
        let released = std::mem::take(&mut *self.inner.free.lock());
        drop(released);
    }

    pub(crate) fn give_back(&self, memory: BlockMemory) {
        let mut free = self.inner.free.lock();

        if free.len() < self.inner.options.max_cached_blocks {
            free.push(memory);
        }
    }
}

thread_local! {
    static POOL_BLOCK_REUSED: Event = Event::builder()
        .name("cordbuf_pool_block_reused")
        .build();
}
