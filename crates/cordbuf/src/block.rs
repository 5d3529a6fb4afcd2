// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::alloc::{self, Layout};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{self, AtomicU32, AtomicUsize, Ordering};

use nm::{Event, Magnitude};

use crate::{AllocError, BlockPool};

/// Capacity of the blocks a [`CordBuf`][crate::CordBuf] allocates when it is not bound to a pool.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Largest block a single append will allocate. Larger appends are split across blocks.
pub const MAX_BLOCK_SIZE: usize = 65_536;

/// Narrows a byte count that is known to fit inside a single block.
pub(crate) fn block_len(count: usize) -> u32 {
    debug_assert!(u32::try_from(count).is_ok(), "{count} bytes cannot be inside one block");

    #[expect(clippy::cast_possible_truncation, reason = "block sizes are always <= u32::MAX")]
    let narrowed = count as u32;
    narrowed
}

/// Raw block storage obtained from the Rust global allocator.
///
/// The bytes are always initialized: fresh memory is zeroed and recycled memory keeps whatever
/// the previous owner wrote into it.
#[derive(Debug)]
pub(crate) struct BlockMemory {
    ptr: NonNull<u8>,

    // How many bytes writers may claim. Can be less than the allocation for adopted vectors,
    // whose spare capacity is uninitialized.
    capacity: u32,

    layout: Layout,
}

impl BlockMemory {
    pub(crate) fn allocate(capacity: u32) -> crate::Result<Self> {
        debug_assert!(capacity > 0, "blocks always have capacity");

        let layout = Layout::array::<u8>(capacity as usize).map_err(|e| AllocError::caused_by(capacity as usize, e))?;

        // SAFETY: The layout has a non-zero size, as asserted above.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| AllocError::new(capacity as usize))?;

        BLOCK_ALLOCATED_SIZE.with(|e| e.observe(capacity as usize));

        Ok(Self { ptr, capacity, layout })
    }

    /// Takes over the allocation of a vector. The vector's contents become the whole
    /// claimable capacity, so nothing can ever be appended into the spare part.
    fn adopt(vec: Vec<u8>) -> Option<Self> {
        let capacity = u32::try_from(vec.len()).ok().filter(|len| *len > 0)?;
        let layout = Layout::array::<u8>(vec.capacity()).ok()?;

        let mut vec = ManuallyDrop::new(vec);
        let ptr = NonNull::new(vec.as_mut_ptr())?;

        Some(Self { ptr, capacity, layout })
    }

    pub(crate) const fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl Drop for BlockMemory {
    fn drop(&mut self) {
        // SAFETY: The pointer was obtained from the global allocator with exactly this layout,
        // either by `allocate()` or by the `Vec` we adopted, and nobody references it anymore.
        unsafe {
            alloc::dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

// SAFETY: The memory is a plain heap allocation with no thread affinity. Access to the bytes is
// governed by the claim protocol in `Block`.
unsafe impl Send for BlockMemory {}

// SAFETY: See `Send` above. Shared access only ever reads bytes that no writer touches anymore.
unsafe impl Sync for BlockMemory {}

struct BlockInner {
    // Whoever decrements this to zero releases the memory (or returns it to the pool).
    ref_count: AtomicUsize,

    // Bytes claimed by writers so far. Only ever grows, except when a writer hands back the
    // unused tail of its own claim.
    size: AtomicU32,

    memory: BlockMemory,
    pool: Option<BlockPool>,
}

/// A shared, reference-counted chunk of byte storage.
///
/// Any number of [`BlockRef`]s, in the same or in different buffers, may point into one block.
/// The block is released when the last handle goes away. Blocks that came from a
/// [`BlockPool`] go back to that pool instead of to the allocator.
///
/// # Writes
///
/// Bytes are only ever written past the current [`size()`][Self::size]. A writer first claims a
/// range by atomically advancing the size, then fills it, then creates references to it. Bytes
/// below the size are never rewritten while any reference can observe them, which is what makes
/// sharing a block between buffers and threads safe.
pub struct Block {
    inner: NonNull<BlockInner>,
}

impl Block {
    /// Allocates a new block that can hold up to `capacity` bytes.
    ///
    /// The capacity is clamped to the `1..=u32::MAX` range.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocator could not provide the memory.
    pub fn with_capacity(capacity: usize) -> crate::Result<Self> {
        let capacity = u32::try_from(capacity).unwrap_or(u32::MAX).max(1);

        Ok(Self::from_memory(BlockMemory::allocate(capacity)?, 0, None))
    }

    /// Takes ownership of the bytes of `vec` without copying them.
    ///
    /// Returns `None` for an empty vector or one longer than `u32::MAX` bytes.
    #[must_use]
    pub fn from_vec(vec: Vec<u8>) -> Option<Self> {
        let memory = BlockMemory::adopt(vec)?;
        let size = memory.capacity();

        Some(Self::from_memory(memory, size, None))
    }

    pub(crate) fn from_memory(memory: BlockMemory, size: u32, pool: Option<BlockPool>) -> Self {
        let inner = Box::new(BlockInner {
            ref_count: AtomicUsize::new(1),
            size: AtomicU32::new(size),
            memory,
            pool,
        });

        Self {
            inner: NonNull::from(Box::leak(inner)),
        }
    }

    fn inner(&self) -> &BlockInner {
        // SAFETY: The allocation stays alive for as long as any handle exists
        // and it is only ever accessed through shared references.
        unsafe { self.inner.as_ref() }
    }

    /// The total number of bytes the block can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner().memory.capacity() as usize
    }

    /// The number of bytes that writers have claimed so far.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner().size.load(Ordering::Acquire) as usize
    }

    /// The number of live handles to this block, including this one.
    ///
    /// This is a snapshot for diagnostics; other threads may change it at any time.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.inner().ref_count.load(Ordering::Acquire)
    }

    /// Whether the memory goes back to a [`BlockPool`] when the block is released.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.inner().pool.is_some()
    }

    /// Whether two handles refer to the same block.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.inner == other.inner
    }

    /// Claims up to `max` bytes starting at `at` for exclusive writing.
    ///
    /// Succeeds only if `at` is the current size, i.e. the caller holds the reference that ends
    /// where the claimed region ends. Returns the number of bytes claimed.
    pub(crate) fn try_claim(&self, at: u32, max: usize) -> Option<u32> {
        let inner = self.inner();

        let spare = inner.memory.capacity().checked_sub(at)?;
        let count = spare.min(u32::try_from(max).unwrap_or(u32::MAX));

        if count == 0 {
            return None;
        }

        inner
            .size
            .compare_exchange(at, at + count, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| count)
    }

    /// Hands back the last `count` bytes of a claim that ends at `end`.
    pub(crate) fn release_claim(&self, end: u32, count: u32) {
        if count == 0 {
            return;
        }

        // Nobody else can move the size away from the end of our own claim, so this only fails
        // if the caller passed the wrong end. The bytes then simply stay claimed.
        let released = self
            .inner()
            .size
            .compare_exchange(end, end - count, Ordering::AcqRel, Ordering::Relaxed);

        debug_assert!(released.is_ok(), "released a claim that was not the last one");
    }

    /// # Safety
    ///
    /// The range must be inside the block and no writer may be filling it concurrently.
    pub(crate) unsafe fn bytes(&self, offset: u32, len: u32) -> &[u8] {
        debug_assert!(offset as usize + len as usize <= self.capacity());

        // SAFETY: The caller guarantees the range is inside the allocation.
        let start = unsafe { self.inner().memory.ptr.as_ptr().add(offset as usize) };

        // SAFETY: Forwarding the caller's guarantees. Block memory is always initialized.
        unsafe { slice::from_raw_parts(start, len as usize) }
    }

    /// # Safety
    ///
    /// The caller must own a claim covering the range and nobody may read it until the caller
    /// is done writing.
    #[expect(clippy::mut_from_ref, reason = "claims hand out disjoint ranges of shared storage")]
    pub(crate) unsafe fn bytes_mut(&self, offset: u32, len: u32) -> &mut [u8] {
        debug_assert!(offset as usize + len as usize <= self.capacity());

        // SAFETY: The caller guarantees the range is inside the allocation.
        let start = unsafe { self.inner().memory.ptr.as_ptr().add(offset as usize) };

        // SAFETY: Forwarding the caller's guarantees. Block memory is always initialized.
        unsafe { slice::from_raw_parts_mut(start, len as usize) }
    }
}

impl Clone for Block {
    #[cfg_attr(test, mutants::skip)] // Mutations can violate memory safety and cause UB.
    fn clone(&self) -> Self {
        // Relaxed because the increment is independent of any other state.
        self.inner().ref_count.fetch_add(1, Ordering::Relaxed);

        Self { inner: self.inner }
    }
}

impl Drop for Block {
    #[cfg_attr(test, mutants::skip)] // Mutations can violate memory safety and cause UB.
    fn drop(&mut self) {
        if self.inner().ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }

        // Observe every write made into the block by other threads before reusing it.
        atomic::fence(Ordering::Acquire);

        // SAFETY: This was the last handle and the allocation came from `Box::leak`.
        let inner = unsafe { Box::from_raw(self.inner.as_ptr()) };
        let BlockInner { memory, pool, .. } = *inner;

        if let Some(pool) = pool {
            pool.give_back(memory);
        }
    }
}

impl fmt::Debug for Block {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("capacity", &self.capacity())
            .field("size", &self.size())
            .field("ref_count", &self.ref_count())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

// SAFETY: The reference count is atomic and writes into the storage are serialized by the claim
// protocol, so handles can move between threads freely.
unsafe impl Send for Block {}

// SAFETY: Shared handles only read bytes that are no longer being written.
unsafe impl Sync for Block {}

/// A half-open view `[offset, offset + len)` into a [`Block`].
///
/// Holding a `BlockRef` keeps the block alive. Cloning one duplicates only this small
/// descriptor, never the bytes.
#[derive(Clone)]
pub struct BlockRef {
    offset: u32,
    len: u32,
    block: Block,
}

impl BlockRef {
    pub(crate) fn new(block: Block, offset: u32, len: u32) -> Self {
        debug_assert!(offset as usize + len as usize <= block.size());

        Self { offset, len, block }
    }

    /// Where the view starts inside the block.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset as usize
    }

    /// The number of bytes in the view.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the view covers no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The block the view points into.
    #[must_use]
    pub fn block(&self) -> &Block {
        &self.block
    }

    /// The bytes covered by the view.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: A reference is only created after the bytes it covers were written, and the
        // claim protocol guarantees nobody writes them again while the block is alive.
        unsafe { self.block.bytes(self.offset, self.len) }
    }

    pub(crate) fn end(&self) -> u32 {
        self.offset + self.len
    }

    /// A new view over `len` bytes starting `start` bytes into this one.
    pub(crate) fn sub(&self, start: u32, len: u32) -> Self {
        debug_assert!(start + len <= self.len);

        Self {
            offset: self.offset + start,
            len,
            block: self.block.clone(),
        }
    }

    pub(crate) fn advance(&mut self, count: u32) {
        debug_assert!(count <= self.len);

        self.offset += count;
        self.len -= count;
    }

    pub(crate) fn truncate(&mut self, len: u32) {
        debug_assert!(len <= self.len);

        self.len = len;
    }

    pub(crate) fn extend(&mut self, count: u32) {
        self.len += count;
    }

    /// Whether `other` continues this view inside the same block, so the two can merge.
    pub(crate) fn is_continued_by(&self, other: &Self) -> bool {
        Block::ptr_eq(&self.block, &other.block) && self.end() == other.offset
    }
}

impl fmt::Debug for BlockRef {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRef")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("block", &self.block.inner)
            .finish()
    }
}

const BLOCK_SIZE_BUCKETS: &[Magnitude] = &[1024, 4096, 8192, 16_384, 65_536, 1_048_576];

thread_local! {
    static BLOCK_ALLOCATED_SIZE: Event = Event::builder()
        .name("cordbuf_block_allocated_size")
        .histogram(BLOCK_SIZE_BUCKETS)
        .build();
}
