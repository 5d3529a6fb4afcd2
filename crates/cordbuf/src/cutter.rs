// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::block::block_len;
use crate::{BlockRef, CordBuf};

/// A cursor that consumes a [`CordBuf`] from the front.
///
/// The cutter detaches the front block reference and serves reads from it directly, touching the
/// buffer's reference queue again only once that window is exhausted. This keeps byte-at-a-time
/// parsing cheap.
///
/// Bytes still in the window are put back at the front of the buffer when the cutter is dropped,
/// so the buffer always ends up holding exactly the bytes that were not consumed.
///
/// Create an instance via [`CordBuf::cutter()`].
#[derive(Debug)]
pub struct CordBufCutter<'b> {
    buf: &'b mut CordBuf,

    // The detached front reference and how much of it has been consumed.
    window: Option<BlockRef>,
    consumed: usize,
}

impl<'b> CordBufCutter<'b> {
    pub(crate) fn new(buf: &'b mut CordBuf) -> Self {
        Self {
            buf,
            window: None,
            consumed: 0,
        }
    }

    fn window(&self) -> &[u8] {
        self.window.as_ref().map_or(&[], |w| &w.as_slice()[self.consumed..])
    }

    // Detaches the next reference once the current window is used up.
    // Returns false if the buffer has no more bytes.
    fn load_next_ref(&mut self) -> bool {
        if !self.window().is_empty() {
            return true;
        }

        self.window = self.buf.pop_front_ref();
        self.consumed = 0;
        self.window.is_some()
    }

    /// The number of bytes not consumed yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.window().len() + self.buf.len()
    }

    /// Consumes and returns the next byte.
    pub fn cut1(&mut self) -> Option<u8> {
        if !self.load_next_ref() {
            return None;
        }

        let byte = self.window().first().copied();
        self.consumed += 1;
        byte
    }

    /// Copies upcoming bytes into `dst` without consuming them. Returns how many were copied.
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let window = self.window();
        let from_window = window.len().min(dst.len());
        dst[..from_window].copy_from_slice(&window[..from_window]);

        from_window + self.buf.copy_to(&mut dst[from_window..], 0)
    }

    /// Consumes bytes into `dst`. Returns how many were consumed.
    pub fn cut_into_slice(&mut self, dst: &mut [u8]) -> usize {
        let copied = self.copy_to(dst);
        self.pop_front(copied)
    }

    /// Consumes up to `count` bytes. Returns how many were consumed.
    pub fn pop_front(&mut self, count: usize) -> usize {
        let from_window = self.window().len().min(count);
        self.consumed += from_window;

        from_window + self.buf.pop_front(count - from_window)
    }

    /// Moves up to `count` upcoming bytes to the back of `out` without copying them.
    /// Returns how many bytes moved.
    pub fn cutn(&mut self, out: &mut CordBuf, count: usize) -> usize {
        let from_window = self.window().len().min(count);

        if let Some(window) = &self.window
            && from_window > 0
        {
            out.push_back_ref(window.sub(block_len(self.consumed), block_len(from_window)));
            self.consumed += from_window;
        }

        from_window + self.buf.cutn(out, count - from_window)
    }
}

impl Drop for CordBufCutter<'_> {
    fn drop(&mut self) {
        if let Some(mut window) = self.window.take() {
            window.advance(block_len(self.consumed));
            self.buf.push_front_ref(window);
        }
    }
}

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
    fn cut1_walks_across_refs() {
        let mut buf = fragmented(&[b"ab", b"c"]);

        {
            let mut cutter = buf.cutter();
            assert_eq!(cutter.remaining(), 3);
            assert_eq!(cutter.cut1(), Some(b'a'));
            assert_eq!(cutter.cut1(), Some(b'b'));
            assert_eq!(cutter.cut1(), Some(b'c'));
            assert_eq!(cutter.cut1(), None);
            assert_eq!(cutter.remaining(), 0);
        }

        assert!(buf.is_empty());
    }

    #[test]
    fn unconsumed_window_returns_to_buffer() {
        let mut buf = fragmented(&[b"hello", b" world"]);

        {
            let mut cutter = buf.cutter();
            assert_eq!(cutter.cut1(), Some(b'h'));
            assert_eq!(cutter.cut1(), Some(b'e'));
        }

        assert_eq!(buf, "llo world");
        assert_eq!(buf.num_refs(), 2);
        buf.check_invariants();
    }

    #[test]
    fn copy_to_does_not_consume() {
        let mut buf = fragmented(&[b"abc", b"def"]);
        let mut cutter = buf.cutter();
        cutter.cut1();

        let mut dst = [0; 4];
        assert_eq!(cutter.copy_to(&mut dst), 4);
        assert_eq!(&dst, b"bcde");
        assert_eq!(cutter.remaining(), 5);

        assert_eq!(cutter.cut_into_slice(&mut dst), 4);
        assert_eq!(cutter.remaining(), 1);
        assert_eq!(cutter.cut1(), Some(b'f'));
    }

    #[test]
    fn pop_front_spans_window_and_buffer() {
        let mut buf = fragmented(&[b"abc", b"def", b"ghi"]);

        {
            let mut cutter = buf.cutter();
            cutter.cut1();
            assert_eq!(cutter.pop_front(4), 4);
            assert_eq!(cutter.cut1(), Some(b'f'));
            assert_eq!(cutter.pop_front(100), 3);
        }

        assert!(buf.is_empty());
    }

    #[test]
    fn cutn_shares_window_bytes() {
        let mut buf = fragmented(&[b"abc", b"def"]);
        let mut out = CordBuf::new();

        {
            let mut cutter = buf.cutter();
            cutter.cut1();
            assert_eq!(cutter.cutn(&mut out, 3), 3);
        }

        assert_eq!(out, "bcd");
        assert_eq!(buf, "ef");
        out.check_invariants();
        buf.check_invariants();
    }
}
