// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{self, IoSlice, Write};
use std::num::NonZero;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::CordBuf;

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    writes: usize,
    fail_next: Option<io::ErrorKind>,
}

/// A [`Write`] that collects everything written to it.
///
/// Clones share the captured bytes, so a test can hand one clone to the code under test (for
/// example as a connection's socket) and inspect the output through another.
///
/// This is for test purposes only and is not optimized for performance.
#[derive(Clone, Debug, Default)]
pub struct FakeWriter {
    captured: Arc<Mutex<Captured>>,

    // Limits how much a single write call accepts, to exercise short-write handling.
    max_write_size: Option<NonZero<usize>>,
}

impl FakeWriter {
    /// Creates a writer that accepts everything in one call.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a writer that accepts at most `max` bytes per write call.
    #[must_use]
    pub fn with_max_write_size(max: NonZero<usize>) -> Self {
        Self {
            max_write_size: Some(max),
            ..Self::default()
        }
    }

    /// A copy of everything written so far.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.captured.lock().bytes.clone()
    }

    /// Everything written so far, as a buffer.
    #[must_use]
    pub fn contents_buf(&self) -> CordBuf {
        CordBuf::from(self.contents())
    }

    /// Removes and returns everything written so far.
    pub fn take_contents(&self) -> Vec<u8> {
        std::mem::take(&mut self.captured.lock().bytes)
    }

    /// The number of successful write calls so far.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.captured.lock().writes
    }

    /// Fails the next write call with an error of the given kind.
    pub fn fail_next_write(&self, kind: io::ErrorKind) {
        self.captured.lock().fail_next = Some(kind);
    }

    fn limit(&self) -> usize {
        self.max_write_size.map_or(usize::MAX, NonZero::get)
    }
}

impl Write for FakeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_vectored(&[IoSlice::new(buf)])
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut left = self.limit();
        let mut captured = self.captured.lock();

        if let Some(kind) = captured.fail_next.take() {
            return Err(kind.into());
        }

        let mut written = 0;

        for buf in bufs {
            let count = buf.len().min(left);
            captured.bytes.extend_from_slice(&buf[..count]);
            written += count;
            left -= count;

            if left == 0 {
                break;
            }
        }

        captured.writes += 1;
        Ok(written)
    }

    #[cfg_attr(test, mutants::skip)] // Nothing to flush.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use new_zealand::nz;

    use super::*;

    #[test]
    fn clones_share_output() {
        let writer = FakeWriter::new();
        let mut handle = writer.clone();

        handle.write_all(b"hello").unwrap();
        assert_eq!(writer.contents(), b"hello");
        assert_eq!(writer.contents_buf(), "hello");
        assert_eq!(writer.writes(), 1);

        assert_eq!(writer.take_contents(), b"hello");
        assert!(writer.contents().is_empty());
    }

    #[test]
    fn short_writes() {
        let mut writer = FakeWriter::with_max_write_size(nz!(3));

        let written = writer
            .write_vectored(&[IoSlice::new(b"ab"), IoSlice::new(b"cd")])
            .unwrap();
        assert_eq!(written, 3);
        assert_eq!(writer.contents(), b"abc");
    }

    #[test]
    fn buffer_drains_through_short_writes() {
        let mut writer = FakeWriter::with_max_write_size(nz!(2));
        let mut buf = CordBuf::from("pipelined");

        buf.write_all_to(&mut writer).unwrap();
        assert_eq!(writer.contents(), b"pipelined");
        assert_eq!(writer.writes(), 5);
    }

    #[test]
    fn scripted_failure() {
        let mut writer = FakeWriter::new();
        writer.fail_next_write(io::ErrorKind::BrokenPipe);

        assert_eq!(writer.write(b"x").unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(writer.write(b"x").unwrap(), 1);
    }
}
