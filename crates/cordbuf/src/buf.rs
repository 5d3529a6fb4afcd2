// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use nm::{Event, Magnitude};

use crate::block::block_len;
use crate::storage::RefQueue;
use crate::{AllocError, Block, BlockRef, CordBufBytesIterator, CordBufCutter, CordBufReader, CordBufWriter, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};

/// A logical byte sequence stored as an ordered list of references into shared blocks.
///
/// Cloning a `CordBuf`, appending one `CordBuf` to another and cutting bytes off the front only
/// move [`BlockRef`]s around and adjust block reference counts. Payload bytes are copied only
/// when raw bytes are appended or when content is materialized into a caller's slice.
///
/// Blocks are never modified once their bytes are visible to a reference, so clones can be
/// handed to other threads (for example to broadcast one serialized message to many
/// connections) without further synchronization.
///
/// # Examples
///
/// ```
/// use cordbuf::CordBuf;
///
/// let mut input = CordBuf::new();
/// input.append(b"GET key1\r\nGET").unwrap();
/// input.append(b" key2\r\n").unwrap();
///
/// let mut line = CordBuf::new();
/// assert!(input.cut_until(&mut line, b"\r\n").is_some());
/// assert_eq!(line, "GET key1");
/// ```
#[derive(Clone, Default)]
pub struct CordBuf {
    refs: RefQueue,

    // Always the sum of the lengths of `refs`.
    len: usize,
}

/// A range of a [`CordBuf`] set aside by [`CordBuf::reserve()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReservedArea {
    position: usize,
    len: usize,
}

impl ReservedArea {
    /// Where the area starts, counted from the front of the buffer at reservation time.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// The number of reserved bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the area covers no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl CordBuf {
    /// Creates an empty buffer. Does not allocate.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            refs: RefQueue::new(),
            len: 0,
        }
    }

    /// The number of bytes in the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Removes all bytes, releasing the block references.
    pub fn clear(&mut self) {
        self.refs.clear();
        self.len = 0;
    }

    /// Exchanges the contents of two buffers.
    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(self, other);
    }

    /// The number of block references the content is split across.
    #[must_use]
    pub fn num_refs(&self) -> usize {
        self.refs.len()
    }

    /// The `index`-th block reference, counting from the front.
    #[must_use]
    pub fn ref_at(&self, index: usize) -> Option<&BlockRef> {
        self.refs.get(index)
    }

    /// The block references making up the content, in order.
    pub fn refs(&self) -> impl DoubleEndedIterator<Item = &BlockRef> {
        self.refs.iter()
    }

    /// The content as a sequence of contiguous slices, in order.
    pub fn slices(&self) -> impl DoubleEndedIterator<Item = &[u8]> {
        self.refs.iter().map(BlockRef::as_slice)
    }

    /// The first contiguous run of bytes. Empty if the buffer is empty.
    #[must_use]
    pub fn first_slice(&self) -> &[u8] {
        self.refs.front().map_or(&[], BlockRef::as_slice)
    }

    /// Appends a copy of `data`.
    ///
    /// Bytes go into the spare room of the last block when this buffer is the one that filled
    /// that block so far, otherwise into freshly allocated blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if a block could not be allocated. The buffer is unchanged in that case.
    pub fn append(&mut self, data: &[u8]) -> crate::Result<()> {
        let mut copied = 0;

        self.append_with(data.len(), |dst| {
            dst.copy_from_slice(&data[copied..copied + dst.len()]);
            copied += dst.len();
        })
    }

    /// Appends a single byte.
    ///
    /// # Errors
    ///
    /// Returns an error if a block could not be allocated. The buffer is unchanged in that case.
    pub fn push_back(&mut self, byte: u8) -> crate::Result<()> {
        self.append(&[byte])
    }

    /// Appends the content of `other` without copying any bytes.
    ///
    /// Every block `other` references gains one reference.
    pub fn append_buf(&mut self, other: &Self) {
        for block_ref in other.refs.iter() {
            self.push_back_ref(block_ref.clone());
        }
    }

    /// Appends the content of `other`, taking over its block references.
    pub fn append_owned(&mut self, mut other: Self) {
        if self.is_empty() {
            *self = other;
            return;
        }

        while let Some(block_ref) = other.refs.pop_front() {
            self.push_back_ref(block_ref);
        }
    }

    /// Appends the bytes of `data` by taking over its allocation instead of copying.
    ///
    /// The adopted block is read-only: later appends always start a new block.
    pub fn append_vec(&mut self, data: Vec<u8>) {
        match u32::try_from(data.len()) {
            Ok(_) => {
                if let Some(block) = Block::from_vec(data) {
                    let len = block_len(block.capacity());
                    self.push_back_ref(BlockRef::new(block, 0, len));
                }
            }
            Err(_) => {
                for chunk in data.chunks(u32::MAX as usize) {
                    self.append_vec(chunk.to_vec());
                }
            }
        }
    }

    /// Appends `count` zero bytes whose final content is supplied later through
    /// [`unsafe_assign()`][Self::unsafe_assign], for example a length prefix that is only known
    /// once the payload after it has been serialized.
    ///
    /// # Errors
    ///
    /// Returns an error if a block could not be allocated. The buffer is unchanged in that case.
    pub fn reserve(&mut self, count: usize) -> crate::Result<ReservedArea> {
        let position = self.len;

        // Recycled pool memory still holds old bytes.
        self.append_with(count, |dst| dst.fill(0))?;

        Ok(ReservedArea { position, len: count })
    }

    /// Overwrites the bytes of a reserved area with `data`, truncated to the area length.
    ///
    /// # Safety
    ///
    /// No other buffer may reference the reserved bytes: the buffer must not have been cloned
    /// or appended elsewhere since the reservation. Bytes must not have been removed from the
    /// front either, otherwise the area points at the wrong bytes.
    pub unsafe fn unsafe_assign(&mut self, area: ReservedArea, data: &[u8]) {
        let mut skip = area.position;
        let mut source = &data[..data.len().min(area.len)];

        for block_ref in self.refs.iter() {
            if source.is_empty() {
                break;
            }

            if skip >= block_ref.len() {
                skip -= block_ref.len();
                continue;
            }

            let count = (block_ref.len() - skip).min(source.len());
            let offset = block_len(block_ref.offset() + skip);

            // SAFETY: The range is inside a reference of this buffer and the caller guarantees
            // that nobody else can observe it.
            let target = unsafe { block_ref.block().bytes_mut(offset, block_len(count)) };
            target.copy_from_slice(&source[..count]);

            source = &source[count..];
            skip = 0;
        }
    }

    /// Appends `count` bytes produced by `fill`, which is called with consecutive chunks of
    /// the destination until all of them are filled.
    pub(crate) fn append_with(&mut self, count: usize, mut fill: impl FnMut(&mut [u8])) -> crate::Result<()> {
        let mut remaining = count;

        while remaining > 0 {
            if let Some(back) = self.refs.back_mut() {
                let end = back.end();

                if let Some(claimed) = back.block().try_claim(end, remaining) {
                    // SAFETY: We own the freshly claimed range and no reference covers it yet.
                    fill(unsafe { back.block().bytes_mut(end, claimed) });

                    back.extend(claimed);
                    self.len += claimed as usize;
                    remaining -= claimed as usize;
                    continue;
                }
            }

            match Block::with_capacity(remaining.clamp(DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE)) {
                // The empty reference is extended in place on the next iteration, which is
                // guaranteed to succeed on a fresh block.
                Ok(block) => self.refs.push_back(BlockRef::new(block, 0, 0)),
                Err(e) => {
                    self.pop_back(count - remaining);
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Grows the buffer by the whole spare room of its last block, or of a new block with
    /// `block_size` capacity when the last block cannot be extended, and returns that room
    /// for the caller to fill. The room already counts as content.
    pub(crate) fn grow_writable(&mut self, block_size: usize) -> crate::Result<&mut [u8]> {
        let tail = self.refs.back().and_then(|back| {
            let end = back.end();
            back.block().try_claim(end, usize::MAX).map(|claimed| (end, claimed))
        });

        let (start, claimed) = match tail {
            Some(tail) => tail,
            None => {
                let block = Block::with_capacity(block_size)?;
                let claimed = block.try_claim(0, usize::MAX).ok_or_else(|| AllocError::new(block_size))?;
                self.refs.push_back(BlockRef::new(block, 0, 0));
                (0, claimed)
            }
        };

        match self.refs.back_mut() {
            Some(back) => {
                back.extend(claimed);
                self.len += claimed as usize;

                // SAFETY: We own the freshly claimed range and `&mut self` keeps anyone from
                // reading it through this buffer until the caller is done writing.
                Ok(unsafe { back.block().bytes_mut(start, claimed) })
            }
            None => Ok(&mut []),
        }
    }

    /// Removes the last `count` bytes of the room handed out by [`grow_writable`][Self::grow_writable]
    /// and gives them back to the block so that later appends can reuse them.
    pub(crate) fn shrink_writable(&mut self, count: usize) {
        let Some(back) = self.refs.back() else {
            return;
        };

        let count = count.min(back.len());
        back.block().release_claim(back.end(), block_len(count));
        self.pop_back(count);
    }

    pub(crate) fn push_back_ref(&mut self, block_ref: BlockRef) {
        if block_ref.is_empty() {
            return;
        }

        self.len += block_ref.len();

        if let Some(back) = self.refs.back_mut()
            && back.is_continued_by(&block_ref)
        {
            back.extend(block_len(block_ref.len()));
            return;
        }

        self.refs.push_back(block_ref);
    }

    pub(crate) fn push_front_ref(&mut self, mut block_ref: BlockRef) {
        if block_ref.is_empty() {
            return;
        }

        self.len += block_ref.len();

        let merges = self.refs.front().is_some_and(|front| block_ref.is_continued_by(front));

        if merges && let Some(front) = self.refs.pop_front() {
            block_ref.extend(block_len(front.len()));
        }

        self.refs.push_front(block_ref);
    }

    pub(crate) fn pop_front_ref(&mut self) -> Option<BlockRef> {
        let block_ref = self.refs.pop_front()?;
        self.len -= block_ref.len();
        Some(block_ref)
    }

    /// Removes up to `count` bytes from the front. Returns how many were removed.
    pub fn pop_front(&mut self, count: usize) -> usize {
        let count = count.min(self.len);
        let mut left = count;

        while left > 0 {
            let Some(front) = self.refs.front_mut() else {
                break;
            };

            if front.len() <= left {
                left -= front.len();
                self.refs.pop_front();
            } else {
                front.advance(block_len(left));
                left = 0;
            }
        }

        self.len -= count;
        count
    }

    /// Removes up to `count` bytes from the back. Returns how many were removed.
    pub fn pop_back(&mut self, count: usize) -> usize {
        let count = count.min(self.len);
        let mut left = count;

        while left > 0 {
            let Some(back) = self.refs.back_mut() else {
                break;
            };

            if back.len() <= left {
                left -= back.len();
                self.refs.pop_back();
            } else {
                back.truncate(block_len(back.len() - left));
                left = 0;
            }
        }

        self.len -= count;
        count
    }

    /// Moves up to `count` bytes from the front of this buffer to the back of `out` without
    /// copying them. Returns how many bytes moved.
    pub fn cutn(&mut self, out: &mut Self, count: usize) -> usize {
        let count = count.min(self.len);
        let mut left = count;

        while left > 0 {
            let Some(front) = self.refs.front_mut() else {
                break;
            };

            if front.len() <= left {
                left -= front.len();

                if let Some(block_ref) = self.refs.pop_front() {
                    out.push_back_ref(block_ref);
                }
            } else {
                out.push_back_ref(front.sub(0, block_len(left)));
                front.advance(block_len(left));
                left = 0;
            }
        }

        self.len -= count;
        count
    }

    /// Copies bytes from the front into `dst` and removes them. Returns how many were moved,
    /// which is less than `dst.len()` only if the buffer ran out.
    pub fn cut_into_slice(&mut self, dst: &mut [u8]) -> usize {
        let copied = self.copy_to(dst, 0);
        self.pop_front(copied)
    }

    /// Removes and returns the first byte.
    pub fn cut1(&mut self) -> Option<u8> {
        let byte = self.fetch1()?;
        self.pop_front(1);
        Some(byte)
    }

    /// Moves everything before the first occurrence of `delimiter` to `out` and drops the
    /// delimiter itself.
    ///
    /// Returns the number of bytes moved to `out`, or `None` when the delimiter does not occur
    /// in the buffer yet. The buffer is left untouched in that case, so the call can simply be
    /// repeated once more bytes have arrived. An empty delimiter matches at the front.
    pub fn cut_until(&mut self, out: &mut Self, delimiter: &[u8]) -> Option<usize> {
        let position = self.find(delimiter)?;

        self.cutn(out, position);
        self.pop_front(delimiter.len());

        Some(position)
    }

    /// The position of the first occurrence of `needle`, which may span block boundaries.
    #[must_use]
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        let Some((&first, rest)) = needle.split_first() else {
            return Some(0);
        };

        let last_start = self.len.checked_sub(needle.len())?;
        let mut base = 0;

        for (index, block_ref) in self.refs.iter().enumerate() {
            let slice = block_ref.as_slice();
            let mut from = 0;

            while let Some(hit) = slice[from..].iter().position(|b| *b == first) {
                let start = from + hit;

                if base + start > last_start {
                    return None;
                }

                if self.matches_at(index, start + 1, rest) {
                    return Some(base + start);
                }

                from = start + 1;
            }

            base += slice.len();
        }

        None
    }

    // Whether the bytes starting `offset` bytes into the `index`-th reference equal `expected`.
    fn matches_at(&self, mut index: usize, mut offset: usize, mut expected: &[u8]) -> bool {
        while !expected.is_empty() {
            let Some(block_ref) = self.refs.get(index) else {
                return false;
            };

            let available = &block_ref.as_slice()[offset..];
            let compared = available.len().min(expected.len());

            if available[..compared] != expected[..compared] {
                return false;
            }

            expected = &expected[compared..];
            index += 1;
            offset = 0;
        }

        true
    }

    /// Whether the content begins with `prefix`.
    #[must_use]
    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.len >= prefix.len() && self.matches_at(0, 0, prefix)
    }

    /// Returns the first `aux.len()` bytes as one contiguous slice.
    ///
    /// When the first block reference already holds that many bytes, the slice points straight
    /// into it. Otherwise the bytes are copied into `aux`, which is returned. Returns `None` if
    /// the buffer is shorter than `aux`.
    pub fn fetch<'a>(&'a self, aux: &'a mut [u8]) -> Option<&'a [u8]> {
        let wanted = aux.len();

        if self.len < wanted {
            return None;
        }

        let first = self.first_slice();
        if first.len() >= wanted {
            return Some(&first[..wanted]);
        }

        FETCH_COPIED.with(|e| e.observe(wanted));

        self.copy_to(aux, 0);
        Some(aux)
    }

    /// The first byte, if any.
    #[must_use]
    pub fn fetch1(&self) -> Option<u8> {
        self.first_slice().first().copied()
    }

    /// Copies bytes starting at `position` into `dst`. Returns how many bytes were copied.
    pub fn copy_to(&self, dst: &mut [u8], position: usize) -> usize {
        let mut skip = position;
        let mut copied = 0;

        for slice in self.slices() {
            if copied == dst.len() {
                break;
            }

            if skip >= slice.len() {
                skip -= slice.len();
                continue;
            }

            let source = &slice[skip..];
            skip = 0;

            let count = source.len().min(dst.len() - copied);
            dst[copied..copied + count].copy_from_slice(&source[..count]);
            copied += count;
        }

        copied
    }

    /// Copies the whole content into a new vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len);

        for slice in self.slices() {
            bytes.extend_from_slice(slice);
        }

        bytes
    }

    /// Appends up to `count` bytes starting at `position` to `out` without consuming them and
    /// without copying them. Returns how many bytes were appended.
    pub fn append_to(&self, out: &mut Self, count: usize, position: usize) -> usize {
        let mut skip = position;
        let mut left = count.min(self.len.saturating_sub(position));
        let appended = left;

        for block_ref in self.refs.iter() {
            if left == 0 {
                break;
            }

            if skip >= block_ref.len() {
                skip -= block_ref.len();
                continue;
            }

            let take = (block_ref.len() - skip).min(left);
            out.push_back_ref(block_ref.sub(block_len(skip), block_len(take)));

            skip = 0;
            left -= take;
        }

        appended
    }

    /// The number of distinct blocks the content lives in.
    #[must_use]
    pub fn backing_block_count(&self) -> usize {
        let mut seen: Vec<&Block> = Vec::with_capacity(self.refs.len());

        for block_ref in self.refs.iter() {
            if !seen.iter().any(|block| Block::ptr_eq(block, block_ref.block())) {
                seen.push(block_ref.block());
            }
        }

        seen.len()
    }

    /// A cursor that consumes the buffer from the front.
    pub fn cutter(&mut self) -> CordBufCutter<'_> {
        CordBufCutter::new(self)
    }

    /// An iterator over the bytes of the buffer that does not consume them.
    #[must_use]
    pub fn bytes(&self) -> CordBufBytesIterator<'_> {
        CordBufBytesIterator::new(self)
    }

    /// An adapter that implements [`std::io::Read`] and [`std::io::BufRead`] by consuming the
    /// buffer.
    pub fn reader(&mut self) -> CordBufReader<'_> {
        CordBufReader::new(self)
    }

    /// An adapter that implements [`std::io::Write`] and [`std::fmt::Write`] by appending to
    /// the buffer.
    pub fn writer(&mut self) -> CordBufWriter<'_> {
        CordBufWriter::new(self)
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        assert_eq!(self.len, self.refs.iter().map(BlockRef::len).sum::<usize>());
        assert!(self.refs.iter().all(|r| !r.is_empty()));
    }
}

// Compares two chunked byte sequences that are already known to have the same length.
fn content_eq<'a, 'b>(mut left: impl Iterator<Item = &'a [u8]>, mut right: impl Iterator<Item = &'b [u8]>) -> bool {
    let mut l: &[u8] = &[];
    let mut r: &[u8] = &[];

    loop {
        while l.is_empty() {
            match left.next() {
                Some(slice) => l = slice,
                None => break,
            }
        }

        while r.is_empty() {
            match right.next() {
                Some(slice) => r = slice,
                None => break,
            }
        }

        if l.is_empty() || r.is_empty() {
            return l.is_empty() && r.is_empty();
        }

        let count = l.len().min(r.len());
        if l[..count] != r[..count] {
            return false;
        }

        l = &l[count..];
        r = &r[count..];
    }
}

impl PartialEq for CordBuf {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && content_eq(self.slices(), other.slices())
    }
}

impl Eq for CordBuf {}

impl PartialEq<[u8]> for CordBuf {
    fn eq(&self, other: &[u8]) -> bool {
        self.len == other.len() && content_eq(self.slices(), std::iter::once(other))
    }
}

impl PartialEq<&[u8]> for CordBuf {
    fn eq(&self, other: &&[u8]) -> bool {
        *self == **other
    }
}

impl<const N: usize> PartialEq<[u8; N]> for CordBuf {
    fn eq(&self, other: &[u8; N]) -> bool {
        *self == other[..]
    }
}

impl<const N: usize> PartialEq<&[u8; N]> for CordBuf {
    fn eq(&self, other: &&[u8; N]) -> bool {
        *self == other[..]
    }
}

impl PartialEq<str> for CordBuf {
    fn eq(&self, other: &str) -> bool {
        *self == *other.as_bytes()
    }
}

impl PartialEq<&str> for CordBuf {
    fn eq(&self, other: &&str) -> bool {
        *self == *other.as_bytes()
    }
}

impl From<Vec<u8>> for CordBuf {
    fn from(value: Vec<u8>) -> Self {
        let mut buf = Self::new();
        buf.append_vec(value);
        buf
    }
}

impl From<&[u8]> for CordBuf {
    fn from(value: &[u8]) -> Self {
        Self::from(value.to_vec())
    }
}

impl From<&str> for CordBuf {
    fn from(value: &str) -> Self {
        Self::from(value.as_bytes())
    }
}

impl From<String> for CordBuf {
    fn from(value: String) -> Self {
        Self::from(value.into_bytes())
    }
}

// How many leading bytes the debug output shows.
const DEBUG_PREVIEW_LEN: usize = 64;

impl fmt::Debug for CordBuf {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut preview = [0; DEBUG_PREVIEW_LEN];
        let shown = self.copy_to(&mut preview, 0);

        f.debug_struct("CordBuf")
            .field("len", &self.len)
            .field("refs", &self.refs.len())
            .field("preview", &format_args!("\"{}\"", preview[..shown].escape_ascii()))
            .finish()
    }
}

const FETCH_COPIED_BUCKETS: &[Magnitude] = &[0, 2, 4, 8, 16, 32, 64, 128, 256, 1024];

thread_local! {
    static FETCH_COPIED: Event = Event::builder()
        .name("cordbuf_fetch_copied")
        .histogram(FETCH_COPIED_BUCKETS)
        .build();
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(CordBuf: Send, Sync, Clone);

    // Builds a buffer whose content is split across one block per chunk.
    fn fragmented(chunks: &[&[u8]]) -> CordBuf {
        let mut buf = CordBuf::new();

        for chunk in chunks {
            buf.append_vec(chunk.to_vec());
        }

        buf
    }

    #[test]
    fn append_copies_into_one_block() {
        let mut buf = CordBuf::new();
        buf.append(b"hello").unwrap();
        buf.append(b", world").unwrap();

        assert_eq!(buf.len(), 12);
        assert_eq!(buf.num_refs(), 1);
        assert_eq!(buf, "hello, world");
        buf.check_invariants();
    }

    #[test]
    fn large_append_spans_blocks() {
        let data: Vec<u8> = (0..200_000_u32).map(|i| (i % 251) as u8).collect();

        let mut buf = CordBuf::new();
        buf.append(&data).unwrap();

        assert_eq!(buf.len(), data.len());
        assert!(buf.num_refs() > 1);
        assert_eq!(buf.to_vec(), data);
        buf.check_invariants();
    }

    #[test]
    fn clone_shares_blocks() {
        let mut a = CordBuf::new();
        a.append(b"shared bytes").unwrap();

        let block = a.ref_at(0).unwrap().block().clone();
        assert_eq!(block.ref_count(), 2);

        let b = a.clone();
        assert_eq!(block.ref_count(), 3);
        assert_eq!(a, b);
        assert!(Block::ptr_eq(a.ref_at(0).unwrap().block(), b.ref_at(0).unwrap().block()));
    }

    #[test]
    fn append_after_clone_does_not_touch_shared_bytes() {
        let mut a = CordBuf::new();
        a.append(b"abc").unwrap();

        let mut b = a.clone();
        a.append(b"123").unwrap();
        b.append(b"xyz").unwrap();

        assert_eq!(a, "abc123");
        assert_eq!(b, "abcxyz");

        // `a` filled the block first, so only `a` may keep extending it.
        assert_eq!(a.num_refs(), 1);
        assert_eq!(b.num_refs(), 2);
    }

    #[test]
    fn append_after_pop_back_starts_new_block() {
        let mut a = CordBuf::new();
        a.append(b"abcdef").unwrap();
        let b = a.clone();

        a.pop_back(3);
        a.append(b"XYZ").unwrap();

        assert_eq!(a, "abcXYZ");
        assert_eq!(b, "abcdef");
    }

    #[test]
    fn append_buf_is_zero_copy() {
        let mut a = CordBuf::new();
        a.append(b"payload").unwrap();

        let mut b = CordBuf::new();
        b.append(b">").unwrap();
        b.append_buf(&a);

        assert_eq!(b, ">payload");
        assert_eq!(a.ref_at(0).unwrap().block().ref_count(), 2);
    }

    #[test]
    fn append_owned_moves_refs() {
        let mut a = CordBuf::from("left ");
        let b = fragmented(&[b"ri", b"ght"]);

        a.append_owned(b);
        assert_eq!(a, "left right");
        assert_eq!(a.num_refs(), 3);
        a.check_invariants();
    }

    #[test]
    fn pop_front_and_back_clamp() {
        let mut buf = fragmented(&[b"abc", b"def", b"ghi"]);

        assert_eq!(buf.pop_front(4), 4);
        assert_eq!(buf, "efghi");
        assert_eq!(buf.pop_back(2), 2);
        assert_eq!(buf, "efg");
        assert_eq!(buf.pop_back(100), 3);
        assert!(buf.is_empty());
        assert_eq!(buf.pop_front(1), 0);
        buf.check_invariants();
    }

    #[test]
    fn cutn_moves_without_copy() {
        let mut buf = fragmented(&[b"abc", b"defg"]);
        let mut out = CordBuf::new();

        assert_eq!(buf.cutn(&mut out, 5), 5);
        assert_eq!(out, "abcde");
        assert_eq!(buf, "fg");
        assert!(Block::ptr_eq(out.ref_at(1).unwrap().block(), buf.ref_at(0).unwrap().block()));

        assert_eq!(buf.cutn(&mut out, 10), 2);
        assert_eq!(out, "abcdefg");
        assert!(buf.is_empty());
        out.check_invariants();
        buf.check_invariants();
    }

    #[test]
    fn cut_until_single_and_multi_byte() {
        let mut buf = fragmented(&[b"a,b", b"c,", b"d\r", b"\ne"]);
        let mut out = CordBuf::new();

        assert_eq!(buf.cut_until(&mut out, b","), Some(1));
        assert_eq!(out, "a");

        out.clear();
        assert_eq!(buf.cut_until(&mut out, b","), Some(2));
        assert_eq!(out, "bc");

        out.clear();
        assert_eq!(buf.cut_until(&mut out, b"\r\n"), Some(1));
        assert_eq!(out, "d");
        assert_eq!(buf, "e");
    }

    #[test]
    fn cut_until_missing_delimiter_leaves_buffer_alone() {
        let mut buf = fragmented(&[b"GET key", b"\r"]);
        let before = buf.clone();
        let mut out = CordBuf::new();

        assert_eq!(buf.cut_until(&mut out, b"\r\n"), None);
        assert_eq!(buf, before);
        assert_eq!(buf.num_refs(), 2);
        assert!(out.is_empty());

        buf.append(b"\n").unwrap();
        assert_eq!(buf.cut_until(&mut out, b"\r\n"), Some(7));
        assert_eq!(out, "GET key");
        assert!(buf.is_empty());
    }

    #[test]
    fn find_handles_partial_matches() {
        let buf = fragmented(&[b"aab", b"aaab"]);

        assert_eq!(buf.find(b"aaab"), Some(3));
        assert_eq!(buf.find(b"ba"), Some(2));
        assert_eq!(buf.find(b"abx"), None);
        assert_eq!(buf.find(b""), Some(0));
        assert_eq!(buf.find(b"aabaaabx"), None);
    }

    #[test]
    fn fetch_points_into_storage_when_contiguous() {
        let buf = fragmented(&[b"abcd", b"ef"]);

        let mut aux = [0; 3];
        let fetched = buf.fetch(&mut aux).unwrap();
        assert_eq!(fetched, b"abc");
        assert_eq!(fetched.as_ptr(), buf.first_slice().as_ptr());
    }

    #[test]
    fn fetch_copies_across_refs() {
        let buf = fragmented(&[b"abcd", b"ef"]);

        let mut aux = [0; 6];
        assert_eq!(buf.fetch(&mut aux).unwrap(), b"abcdef");

        let mut too_long = [0; 7];
        assert!(buf.fetch(&mut too_long).is_none());
    }

    #[test]
    fn copy_to_with_position() {
        let buf = fragmented(&[b"abc", b"def", b"ghi"]);

        let mut dst = [0; 4];
        assert_eq!(buf.copy_to(&mut dst, 2), 4);
        assert_eq!(&dst, b"cdef");

        assert_eq!(buf.copy_to(&mut dst, 7), 2);
        assert_eq!(&dst[..2], b"hi");

        assert_eq!(buf.copy_to(&mut dst, 9), 0);
    }

    #[test]
    fn cut1_and_cut_into_slice() {
        let mut buf = fragmented(&[b"x", b"yz"]);

        assert_eq!(buf.cut1(), Some(b'x'));

        let mut dst = [0; 4];
        assert_eq!(buf.cut_into_slice(&mut dst), 2);
        assert_eq!(&dst[..2], b"yz");
        assert_eq!(buf.cut1(), None);
    }

    #[test]
    fn append_to_shares_sub_range() {
        let buf = fragmented(&[b"abc", b"def", b"ghi"]);
        let mut out = CordBuf::new();

        assert_eq!(buf.append_to(&mut out, 4, 2), 4);
        assert_eq!(out, "cdef");
        assert_eq!(buf.len(), 9);

        assert_eq!(buf.append_to(&mut out, 10, 8), 1);
        assert_eq!(out, "cdefi");
        assert_eq!(buf.append_to(&mut out, 1, 20), 0);
    }

    #[test]
    fn equality_ignores_layout() {
        let a = fragmented(&[b"he", b"llo wo", b"rld"]);
        let b = CordBuf::from("hello world");

        assert_eq!(a, b);
        assert_eq!(a, b"hello world");
        assert_ne!(a, "hello worlds");
        assert_ne!(a, CordBuf::from("hello_world"));
        assert!(a.starts_with(b"hello w"));
        assert!(!a.starts_with(b"help"));
    }

    #[test]
    fn contiguous_refs_merge() {
        let mut source = CordBuf::new();
        source.append(b"abcdef").unwrap();

        let mut out = CordBuf::new();
        source.cutn(&mut out, 2);
        source.cutn(&mut out, 2);

        assert_eq!(out.num_refs(), 1);
        assert_eq!(out, "abcd");
    }

    #[test]
    fn push_front_ref_restores_cut_bytes() {
        let mut buf = CordBuf::from("abcdef");
        let front = buf.pop_front_ref().unwrap();
        assert!(buf.is_empty());

        buf.push_front_ref(front.sub(2, 4));
        buf.push_front_ref(front.sub(0, 2));

        assert_eq!(buf, "abcdef");
        assert_eq!(buf.num_refs(), 1);
        buf.check_invariants();
    }

    #[test]
    fn empty_buffer_operations_are_noops() {
        let mut buf = CordBuf::new();
        let mut out = CordBuf::new();

        assert_eq!(buf.pop_front(3), 0);
        assert_eq!(buf.pop_back(3), 0);
        assert_eq!(buf.cutn(&mut out, 3), 0);
        assert_eq!(buf.fetch1(), None);
        assert_eq!(buf.cut_until(&mut out, b"\n"), None);
        assert!(buf.first_slice().is_empty());
        assert!(buf.to_vec().is_empty());

        buf.append(b"").unwrap();
        assert_eq!(buf.num_refs(), 0);
    }

    #[test]
    fn reserve_then_assign_length_prefix() {
        let mut buf = CordBuf::new();
        let area = buf.reserve(4).unwrap();
        buf.append(b"payload").unwrap();

        assert_eq!(area.position(), 0);
        assert_eq!(area.len(), 4);
        assert_eq!(buf.len(), 11);

        let len = u32::try_from(buf.len() - area.len()).unwrap();

        // SAFETY: The buffer has not been shared since the reservation.
        unsafe { buf.unsafe_assign(area, &len.to_be_bytes()) };

        assert_eq!(buf, b"\0\0\0\x07payload");
    }

    #[test]
    fn assign_spanning_blocks() {
        let mut buf = CordBuf::from("head");
        let area = buf.reserve(DEFAULT_BLOCK_SIZE + 2).unwrap();
        assert!(buf.num_refs() >= 2);

        let data = vec![b'x'; area.len() + 10];

        // SAFETY: The buffer has not been shared since the reservation.
        unsafe { buf.unsafe_assign(area, &data) };

        assert_eq!(buf.len(), 4 + area.len());
        assert!(buf.starts_with(b"headxxx"));
        assert!(buf.to_vec()[4..].iter().all(|b| *b == b'x'));
    }

    #[test]
    fn backing_block_count_dedups() {
        let mut buf = CordBuf::from("abcdef");
        let other = CordBuf::from("xyz");

        let copy = buf.clone();
        buf.append_buf(&other);
        buf.append_buf(&copy);

        assert_eq!(buf.num_refs(), 3);
        assert_eq!(buf.backing_block_count(), 2);
        assert_eq!(CordBuf::new().backing_block_count(), 0);
    }

    #[test]
    fn debug_shows_preview() {
        let buf = CordBuf::from("a\r\n");
        let debug = format!("{buf:?}");

        assert!(debug.contains("len: 3"));
        assert!(debug.contains(r"a\r\n"));
    }
}
