// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::io::{self, BufRead, IoSlice, Read, Write};

use smallvec::SmallVec;

use crate::CordBuf;

// How many slices a single vectored write hands to the sink at most.
const MAX_WRITE_SLICES: usize = 64;

/// Adapter that implements [`Read`] and [`BufRead`] by consuming a [`CordBuf`].
///
/// Because the buffer already holds its bytes in memory, this adapter implements [`BufRead`]
/// directly. Prefer it over wrapping in [`std::io::BufReader`].
///
/// Create an instance via [`CordBuf::reader()`].
#[derive(Debug)]
pub struct CordBufReader<'b> {
    inner: &'b mut CordBuf,
}

impl<'b> CordBufReader<'b> {
    pub(crate) const fn new(inner: &'b mut CordBuf) -> Self {
        Self { inner }
    }
}

impl Read for CordBufReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.inner.cut_into_slice(buf))
    }
}

impl BufRead for CordBufReader<'_> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        Ok(self.inner.first_slice())
    }

    fn consume(&mut self, amount: usize) {
        self.inner.pop_front(amount);
    }
}

/// Adapter that implements [`io::Write`] and [`fmt::Write`] by appending to a [`CordBuf`].
///
/// This is the text sink for formatting output straight into a buffer:
///
/// ```
/// use std::fmt::Write;
///
/// use cordbuf::CordBuf;
///
/// let mut buf = CordBuf::new();
/// write!(buf.writer(), "+{}\r\n", 42).unwrap();
/// assert_eq!(buf, "+42\r\n");
/// ```
///
/// Create an instance via [`CordBuf::writer()`].
#[derive(Debug)]
pub struct CordBufWriter<'b> {
    inner: &'b mut CordBuf,
}

impl<'b> CordBufWriter<'b> {
    pub(crate) const fn new(inner: &'b mut CordBuf) -> Self {
        Self { inner }
    }
}

impl Write for CordBufWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .append(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;

        Ok(buf.len())
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        bufs.iter().map(|buf| self.write(buf)).sum()
    }

    #[cfg_attr(test, mutants::skip)] // Nothing to flush.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Write for CordBufWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.inner.append(s.as_bytes()).map_err(|_alloc_error| fmt::Error)
    }
}

impl CordBuf {
    /// Writes up to `max` bytes from the front into `sink` with a single vectored write and
    /// removes whatever the sink accepted.
    ///
    /// Returns the number of bytes written, which can be less than `max` if the sink accepted
    /// only part of the data.
    ///
    /// # Errors
    ///
    /// Forwards errors from the sink. Nothing is removed from the buffer in that case.
    pub fn cut_into_writer(&mut self, sink: &mut impl Write, max: usize) -> io::Result<usize> {
        let mut left = max.min(self.len());

        if left == 0 {
            return Ok(0);
        }

        let mut slices = SmallVec::<[IoSlice<'_>; MAX_WRITE_SLICES]>::new();

        for slice in self.slices() {
            if left == 0 || slices.len() == MAX_WRITE_SLICES {
                break;
            }

            let take = slice.len().min(left);
            slices.push(IoSlice::new(&slice[..take]));
            left -= take;
        }

        let written = sink.write_vectored(&slices)?;
        drop(slices);

        Ok(self.pop_front(written))
    }

    /// Writes the whole content into `sink`, emptying the buffer.
    ///
    /// # Errors
    ///
    /// Forwards errors from the sink, except [`io::ErrorKind::Interrupted`] which is retried.
    /// A sink that stops accepting bytes produces an [`io::ErrorKind::WriteZero`] error. Bytes
    /// not written stay in the buffer.
    pub fn write_all_to(&mut self, sink: &mut impl Write) -> io::Result<()> {
        while !self.is_empty() {
            match self.cut_into_writer(sink, usize::MAX) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}
