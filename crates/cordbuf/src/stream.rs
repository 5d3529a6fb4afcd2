// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Chunk-oriented streams for structured serialization frameworks.
//!
//! Serializers that work on contiguous chunks can read from and write into a [`CordBuf`]
//! through these traits without an intermediate copy of the message.

use crate::{CordBuf, DEFAULT_BLOCK_SIZE};

/// A source that hands out its content one contiguous chunk at a time.
pub trait ZeroCopyInputStream {
    /// The next contiguous chunk, or `None` at the end of the stream. Never empty.
    fn next_chunk(&mut self) -> Option<&[u8]>;

    /// Returns the last `count` bytes of the previous chunk to the stream, so that the next call
    /// to [`next_chunk()`][Self::next_chunk] yields them again.
    ///
    /// `count` must not exceed the length of the chunk returned by the previous call.
    fn back_up(&mut self, count: usize);

    /// Skips `count` bytes. Returns `false` if the stream ended first.
    fn skip(&mut self, count: usize) -> bool;

    /// The total number of bytes handed out so far.
    fn byte_count(&self) -> u64;
}

/// A sink that hands out writable chunks which become part of its content.
pub trait ZeroCopyOutputStream {
    /// A writable chunk. Everything in it counts as written unless handed back through
    /// [`back_up()`][Self::back_up].
    ///
    /// # Errors
    ///
    /// Returns an error if storage for the chunk could not be allocated.
    fn next_chunk_mut(&mut self) -> crate::Result<&mut [u8]>;

    /// Hands back the last `count` bytes of the previous chunk as unused.
    ///
    /// `count` must not exceed the length of the chunk returned by the previous call.
    fn back_up(&mut self, count: usize);

    /// The total number of bytes written so far.
    fn byte_count(&self) -> u64;
}

/// Reads a [`CordBuf`] chunk by chunk without consuming it.
#[derive(Debug)]
pub struct CordBufInputStream<'b> {
    buf: &'b CordBuf,
    ref_index: usize,

    // Where the next chunk starts inside the reference at `ref_index`.
    offset: usize,
    byte_count: u64,
}

impl<'b> CordBufInputStream<'b> {
    /// Creates a stream positioned at the start of `buf`.
    #[must_use]
    pub fn new(buf: &'b CordBuf) -> Self {
        Self {
            buf,
            ref_index: 0,
            offset: 0,
            byte_count: 0,
        }
    }
}

impl ZeroCopyInputStream for CordBufInputStream<'_> {
    fn next_chunk(&mut self) -> Option<&[u8]> {
        let block_ref = self.buf.ref_at(self.ref_index)?;
        let chunk = &block_ref.as_slice()[self.offset..];

        self.ref_index += 1;
        self.offset = 0;
        self.byte_count += chunk.len() as u64;

        Some(chunk)
    }

    fn back_up(&mut self, count: usize) {
        if self.ref_index == 0 || count == 0 {
            return;
        }

        let Some(block_ref) = self.buf.ref_at(self.ref_index - 1) else {
            return;
        };

        let count = count.min(block_ref.len());
        self.ref_index -= 1;
        self.offset = block_ref.len() - count;
        self.byte_count -= count as u64;
    }

    fn skip(&mut self, count: usize) -> bool {
        let mut left = count;

        while left > 0 {
            let Some(block_ref) = self.buf.ref_at(self.ref_index) else {
                return false;
            };

            let available = block_ref.len() - self.offset;

            if left < available {
                self.offset += left;
                self.byte_count += left as u64;
                return true;
            }

            left -= available;
            self.byte_count += available as u64;
            self.ref_index += 1;
            self.offset = 0;
        }

        true
    }

    fn byte_count(&self) -> u64 {
        self.byte_count
    }
}

/// Appends to a [`CordBuf`] by handing out the spare room of its blocks for direct writing.
#[derive(Debug)]
pub struct CordBufOutputStream<'b> {
    buf: &'b mut CordBuf,
    block_size: usize,
    byte_count: u64,
}

impl<'b> CordBufOutputStream<'b> {
    /// Creates a stream that appends to `buf`, allocating default-sized blocks as needed.
    #[must_use]
    pub fn new(buf: &'b mut CordBuf) -> Self {
        Self::with_block_size(buf, DEFAULT_BLOCK_SIZE)
    }

    /// Creates a stream that appends to `buf`, allocating blocks of `block_size` bytes.
    #[must_use]
    pub fn with_block_size(buf: &'b mut CordBuf, block_size: usize) -> Self {
        Self {
            buf,
            block_size: block_size.max(1),
            byte_count: 0,
        }
    }
}

impl ZeroCopyOutputStream for CordBufOutputStream<'_> {
    fn next_chunk_mut(&mut self) -> crate::Result<&mut [u8]> {
        let chunk = self.buf.grow_writable(self.block_size)?;
        self.byte_count += chunk.len() as u64;
        Ok(chunk)
    }

    fn back_up(&mut self, count: usize) {
        let before = self.buf.len();
        self.buf.shrink_writable(count);
        self.byte_count -= (before - self.buf.len()) as u64;
    }

    fn byte_count(&self) -> u64 {
        self.byte_count
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
    fn input_stream_yields_refs() {
        let buf = fragmented(&[b"abc", b"de"]);
        let mut stream = CordBufInputStream::new(&buf);

        assert_eq!(stream.next_chunk(), Some(&b"abc"[..]));
        assert_eq!(stream.next_chunk(), Some(&b"de"[..]));
        assert_eq!(stream.next_chunk(), None);
        assert_eq!(stream.byte_count(), 5);
    }

    #[test]
    fn input_stream_back_up_replays_tail() {
        let buf = fragmented(&[b"abcd", b"ef"]);
        let mut stream = CordBufInputStream::new(&buf);

        stream.next_chunk();
        stream.back_up(2);
        assert_eq!(stream.byte_count(), 2);
        assert_eq!(stream.next_chunk(), Some(&b"cd"[..]));
        assert_eq!(stream.byte_count(), 4);
    }

    #[test]
    fn input_stream_skip() {
        let buf = fragmented(&[b"abcd", b"ef"]);
        let mut stream = CordBufInputStream::new(&buf);

        assert!(stream.skip(5));
        assert_eq!(stream.next_chunk(), Some(&b"f"[..]));
        assert!(!stream.skip(1));
        assert_eq!(stream.byte_count(), 6);
    }

    #[test]
    fn output_stream_writes_in_place() {
        let mut buf = CordBuf::new();

        {
            let mut stream = CordBufOutputStream::with_block_size(&mut buf, 8);
            let chunk = stream.next_chunk_mut().unwrap();
            assert_eq!(chunk.len(), 8);
            chunk[..5].copy_from_slice(b"hello");
            stream.back_up(3);
            assert_eq!(stream.byte_count(), 5);

            // The returned room is reused by the next chunk.
            let chunk = stream.next_chunk_mut().unwrap();
            assert_eq!(chunk.len(), 3);
            chunk.copy_from_slice(b"!!!");
            assert_eq!(stream.byte_count(), 8);
        }

        assert_eq!(buf, "hello!!!");
        assert_eq!(buf.num_refs(), 1);
        buf.check_invariants();
    }

    #[test]
    fn output_stream_after_shared_block_starts_new_block() {
        let mut buf = CordBuf::new();
        buf.append(b"head").unwrap();
        let shared = buf.clone();
        buf.pop_back(2);

        {
            let mut stream = CordBufOutputStream::with_block_size(&mut buf, 4);
            let chunk = stream.next_chunk_mut().unwrap();
            chunk.copy_from_slice(b"tail");
        }

        assert_eq!(buf, "hetail");
        assert_eq!(shared, "head");
    }
}
