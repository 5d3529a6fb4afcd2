// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{self, IoSliceMut, Read};
use std::ops::{Deref, DerefMut};

use smallvec::SmallVec;

use crate::block::block_len;
use crate::{Block, BlockPool, BlockRef, CordBuf};

// How many blocks a single vectored read fills at most.
const MAX_READ_BLOCKS: usize = 8;

/// The receive buffer of one connection: a [`CordBuf`] that reads from a transport straight into
/// blocks taken from a [`BlockPool`].
///
/// The portal dereferences to the underlying [`CordBuf`], so parsers cut messages out of it
/// like out of any other buffer. Blocks whose bytes have been cut and dropped everywhere go back
/// to the pool for the next read.
#[derive(Debug)]
pub struct IoPortal {
    buf: CordBuf,
    pool: BlockPool,
}

// A range of a block reserved for the current read.
struct Claim {
    block: Block,
    start: u32,
    count: u32,
}

impl IoPortal {
    /// Creates an empty portal that takes its blocks from `pool`.
    #[must_use]
    pub fn new(pool: BlockPool) -> Self {
        Self { buf: CordBuf::new(), pool }
    }

    /// The pool new blocks come from.
    #[must_use]
    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    /// Reads up to `max` bytes from `reader` with a single vectored read and appends them.
    ///
    /// The read fills the spare room of the last block first, then fresh pool blocks. Room that
    /// the read did not use goes back to its block or to the pool. Returns the number of bytes
    /// read; zero means end of stream (or `max == 0`).
    ///
    /// # Errors
    ///
    /// Forwards errors from the reader, including [`io::ErrorKind::WouldBlock`] for
    /// non-blocking transports. Fails with [`io::ErrorKind::OutOfMemory`] if no block could be
    /// obtained at all. Nothing is appended when an error is returned.
    pub fn append_from_reader(&mut self, reader: &mut impl Read, max: usize) -> io::Result<usize> {
        if max == 0 {
            return Ok(0);
        }

        let claims = self.claim(max)?;

        let result = {
            let mut slices: SmallVec<[IoSliceMut<'_>; MAX_READ_BLOCKS]> = claims
                .iter()
                .map(|claim| {
                    // SAFETY: Each claim is a freshly claimed range that no reference covers yet,
                    // and the claims are in distinct blocks.
                    IoSliceMut::new(unsafe { claim.block.bytes_mut(claim.start, claim.count) })
                })
                .collect();

            reader.read_vectored(&mut slices)
        };

        self.settle(claims, result.as_ref().map_or(0, |read| *read));
        result
    }

    // Claims room for up to `max` bytes, at the tail of the last block and in new pool blocks.
    fn claim(&self, max: usize) -> io::Result<SmallVec<[Claim; MAX_READ_BLOCKS]>> {
        let mut claims = SmallVec::new();
        let mut left = max;

        if let Some(back) = self.buf.refs().next_back() {
            let start = back.end();

            if let Some(count) = back.block().try_claim(start, left) {
                claims.push(Claim {
                    block: back.block().clone(),
                    start,
                    count,
                });
                left -= count as usize;
            }
        }

        while left > 0 && claims.len() < MAX_READ_BLOCKS {
            let block = match self.pool.acquire() {
                Ok(block) => block,
                Err(e) if claims.is_empty() => return Err(io::Error::new(io::ErrorKind::OutOfMemory, e)),
                // Read into whatever room we already have.
                Err(_) => break,
            };

            let Some(count) = block.try_claim(0, left) else {
                break;
            };

            claims.push(Claim { block, start: 0, count });
            left -= count as usize;
        }

        Ok(claims)
    }

    // Turns the first `read` claimed bytes into content and releases the rest.
    fn settle(&mut self, claims: SmallVec<[Claim; MAX_READ_BLOCKS]>, read: usize) {
        let mut left = read;

        for Claim { block, start, count } in claims {
            let used = (count as usize).min(left);
            left -= used;

            let used = block_len(used);
            block.release_claim(start + count, count - used);

            if used > 0 {
                self.buf.push_back_ref(BlockRef::new(block, start, used));
            }
        }
    }

    /// Takes the accumulated bytes out of the portal, leaving it empty.
    pub fn take(&mut self) -> CordBuf {
        std::mem::take(&mut self.buf)
    }

    /// Consumes the portal and returns the accumulated bytes.
    #[must_use]
    pub fn into_inner(self) -> CordBuf {
        self.buf
    }
}

impl Deref for IoPortal {
    type Target = CordBuf;

    fn deref(&self) -> &CordBuf {
        &self.buf
    }
}

impl DerefMut for IoPortal {
    fn deref_mut(&mut self) -> &mut CordBuf {
        &mut self.buf
    }
}
