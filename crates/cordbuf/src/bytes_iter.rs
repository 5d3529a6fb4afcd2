// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::iter::FusedIterator;

use crate::CordBuf;

/// A read-only forward iterator over the bytes of a [`CordBuf`].
///
/// Parsers use it to scan for framing without consuming anything. The iterator is cheap to
/// copy, so a parser can look ahead speculatively from any point, and it can be re-based onto a
/// smaller byte budget so the look-ahead never runs past a known message length.
///
/// Create an instance via [`CordBuf::bytes()`].
#[derive(Clone, Debug)]
pub struct CordBufBytesIterator<'b> {
    buf: &'b CordBuf,

    // Index of the reference after the one `chunk` points into.
    next_ref: usize,
    chunk: &'b [u8],
    bytes_left: usize,
}

impl<'b> CordBufBytesIterator<'b> {
    pub(crate) fn new(buf: &'b CordBuf) -> Self {
        Self {
            buf,
            next_ref: 1,
            chunk: buf.first_slice(),
            bytes_left: buf.len(),
        }
    }

    /// A copy of this iterator that yields at most `bytes_left` more bytes.
    #[must_use]
    pub fn rebased(&self, bytes_left: usize) -> Self {
        Self {
            bytes_left: bytes_left.min(self.bytes_left),
            ..self.clone()
        }
    }

    /// The number of bytes the iterator will still yield.
    #[must_use]
    pub fn bytes_left(&self) -> usize {
        self.bytes_left
    }

    /// The next byte, without advancing.
    #[must_use]
    pub fn peek(&self) -> Option<u8> {
        if self.bytes_left == 0 {
            return None;
        }

        self.chunk.first().copied()
    }

    // Moves to the next non-empty chunk if the current one is used up.
    fn refill(&mut self) {
        while self.chunk.is_empty() {
            let Some(block_ref) = self.buf.ref_at(self.next_ref) else {
                return;
            };

            self.chunk = block_ref.as_slice();
            self.next_ref += 1;
        }
    }

    fn skip_in_chunk(&mut self, count: usize) {
        self.chunk = &self.chunk[count..];
        self.bytes_left -= count;
        self.refill();
    }

    /// Skips up to `count` bytes. Returns how many were skipped.
    pub fn forward(&mut self, count: usize) -> usize {
        let mut left = count.min(self.bytes_left);
        let skipped = left;

        while left > 0 {
            let step = self.chunk.len().min(left);
            self.skip_in_chunk(step);
            left -= step;
        }

        skipped
    }

    /// Copies upcoming bytes into `dst` and skips past them. Returns how many were copied.
    pub fn copy_and_forward(&mut self, dst: &mut [u8]) -> usize {
        let wanted = dst.len().min(self.bytes_left);
        let mut copied = 0;

        while copied < wanted {
            let step = self.chunk.len().min(wanted - copied);
            dst[copied..copied + step].copy_from_slice(&self.chunk[..step]);
            self.skip_in_chunk(step);
            copied += step;
        }

        copied
    }

    /// Appends up to `count` upcoming bytes to `out` without copying them, and skips past them.
    /// Returns how many bytes were appended.
    pub fn append_and_forward(&mut self, out: &mut CordBuf, count: usize) -> usize {
        let position = self.buf.len() - self.bytes_left_in_buf();
        let appended = self.buf.append_to(out, count.min(self.bytes_left), position);

        self.forward(appended)
    }

    // Bytes between the iterator position and the end of the buffer, ignoring the budget.
    fn bytes_left_in_buf(&self) -> usize {
        self.chunk.len()
            + self
                .buf
                .refs()
                .skip(self.next_ref)
                .map(crate::BlockRef::len)
                .sum::<usize>()
    }
}

impl Iterator for CordBufBytesIterator<'_> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.skip_in_chunk(1);
        Some(byte)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.bytes_left, Some(self.bytes_left))
    }
}

impl ExactSizeIterator for CordBufBytesIterator<'_> {}

impl FusedIterator for CordBufBytesIterator<'_> {}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn fragmented(chunks: &[&[u8]]) -> CordBuf {
        let mut buf = CordBuf::new();

        for chunk in chunks {
            buf.append_vec(chunk.to_vec());
        }

        buf
    }

    #[test]
    fn yields_every_byte_in_order() {
        let buf = fragmented(&[b"ab", b"cde", b"f"]);

        let collected: Vec<u8> = buf.bytes().collect();
        assert_eq!(collected, b"abcdef");
        assert_eq!(buf.bytes().len(), 6);
    }

    #[test]
    fn empty_buffer_yields_nothing() {
        let buf = CordBuf::new();
        let mut iter = buf.bytes();

        assert_eq!(iter.peek(), None);
        assert_eq!(iter.next(), None);
        assert_eq!(iter.bytes_left(), 0);
    }

    #[test]
    fn copies_are_independent() {
        let buf = fragmented(&[b"abc", b"def"]);
        let mut iter = buf.bytes();
        iter.forward(2);

        let mut lookahead = iter.clone();
        assert_eq!(lookahead.next(), Some(b'c'));
        assert_eq!(lookahead.next(), Some(b'd'));

        assert_eq!(iter.next(), Some(b'c'));
        assert_eq!(iter.bytes_left(), 3);
    }

    #[test]
    fn rebased_budget_limits_lookahead() {
        let buf = fragmented(&[b"abc", b"def"]);
        let mut iter = buf.bytes();
        iter.forward(1);

        let mut limited = iter.rebased(3);
        assert_eq!(limited.by_ref().collect::<Vec<_>>(), b"bcd");
        assert_eq!(limited.next(), None);

        // A rebase can only shrink the budget.
        assert_eq!(iter.rebased(100).bytes_left(), 5);
    }

    #[test]
    fn copy_and_forward_crosses_refs() {
        let buf = fragmented(&[b"ab", b"cd", b"ef"]);
        let mut iter = buf.bytes();

        let mut dst = [0; 5];
        assert_eq!(iter.copy_and_forward(&mut dst), 5);
        assert_eq!(&dst, b"abcde");
        assert_eq!(iter.next(), Some(b'f'));
        assert_eq!(iter.copy_and_forward(&mut dst), 0);
    }

    #[test]
    fn append_and_forward_shares_bytes() {
        let buf = fragmented(&[b"abc", b"def"]);
        let mut iter = buf.bytes();
        iter.forward(2);

        let mut out = CordBuf::new();
        assert_eq!(iter.append_and_forward(&mut out, 3), 3);
        assert_eq!(out, "cde");
        assert_eq!(iter.next(), Some(b'f'));

        let mut limited = iter.rebased(0);
        assert_eq!(limited.append_and_forward(&mut out, 10), 0);
    }
}
