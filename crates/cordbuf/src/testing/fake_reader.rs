// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::io::{self, IoSliceMut, Read};

#[derive(Debug)]
enum Step {
    Data(Vec<u8>),
    Fail(io::ErrorKind),
}

/// A [`Read`] that replays a scripted sequence of chunks and failures.
///
/// Every chunk is delivered by its own read call (split further only if the caller's buffers are
/// too small), which makes it easy to reproduce a peer that trickles a message across several
/// socket reads. Once the script is exhausted the reader reports end of stream, or
/// [`io::ErrorKind::WouldBlock`] if it was built with [`keep_open()`][FakeReaderBuilder::keep_open].
///
/// This is for test purposes only and is not optimized for performance.
#[derive(Debug)]
pub struct FakeReader {
    steps: VecDeque<Step>,
    keep_open: bool,
    reads: usize,
}

impl FakeReader {
    /// Starts building a new `FakeReader`.
    #[must_use]
    pub fn builder() -> FakeReaderBuilder {
        FakeReaderBuilder {
            steps: VecDeque::new(),
            keep_open: false,
        }
    }

    /// Creates a reader that delivers `chunks` one per read and then reports end of stream.
    #[must_use]
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        chunks
            .into_iter()
            .fold(Self::builder(), |builder, chunk| builder.chunk(chunk))
            .build()
    }

    /// The number of read calls served so far, including failed ones.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Whether every scripted step has been consumed.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.steps.is_empty()
    }

    fn exhausted_result(&self) -> io::Result<usize> {
        if self.keep_open {
            Err(io::ErrorKind::WouldBlock.into())
        } else {
            Ok(0)
        }
    }
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_vectored(&mut [IoSliceMut::new(buf)])
    }

    fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        self.reads += 1;

        let Some(step) = self.steps.pop_front() else {
            return self.exhausted_result();
        };

        let data = match step {
            Step::Data(data) => data,
            Step::Fail(kind) => return Err(kind.into()),
        };

        let mut copied = 0;

        for buf in bufs.iter_mut() {
            let count = buf.len().min(data.len() - copied);
            buf[..count].copy_from_slice(&data[copied..copied + count]);
            copied += count;
        }

        if copied < data.len() {
            self.steps.push_front(Step::Data(data[copied..].to_vec()));
        }

        Ok(copied)
    }
}

/// Builds a [`FakeReader`] step by step.
#[derive(Debug)]
pub struct FakeReaderBuilder {
    steps: VecDeque<Step>,
    keep_open: bool,
}

impl FakeReaderBuilder {
    /// Delivers `data` on the next read. Empty chunks are skipped.
    #[must_use]
    pub fn chunk(mut self, data: impl AsRef<[u8]>) -> Self {
        let data = data.as_ref();

        if !data.is_empty() {
            self.steps.push_back(Step::Data(data.to_vec()));
        }

        self
    }

    /// Fails the next read with [`io::ErrorKind::WouldBlock`].
    #[must_use]
    pub fn would_block(self) -> Self {
        self.fail(io::ErrorKind::WouldBlock)
    }

    /// Fails the next read with an error of the given kind.
    #[must_use]
    pub fn fail(mut self, kind: io::ErrorKind) -> Self {
        self.steps.push_back(Step::Fail(kind));
        self
    }

    /// Reports [`io::ErrorKind::WouldBlock`] instead of end of stream once the script is done.
    #[must_use]
    pub fn keep_open(mut self) -> Self {
        self.keep_open = true;
        self
    }

    /// Creates the reader.
    #[must_use]
    pub fn build(self) -> FakeReader {
        FakeReader {
            steps: self.steps,
            keep_open: self.keep_open,
            reads: 0,
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_chunk_per_read() {
        let mut reader = FakeReader::new(["ab", "cde"]);
        let mut buf = [0; 8];

        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ab");
        assert_eq!(reader.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"cde");
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert_eq!(reader.reads(), 3);
    }

    #[test]
    fn small_buffer_splits_chunk() {
        let mut reader = FakeReader::new(["abcdef"]);
        let mut buf = [0; 4];

        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert!(!reader.is_exhausted());
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert!(reader.is_exhausted());
    }

    #[test]
    fn vectored_fills_in_order() {
        let mut reader = FakeReader::new(["hello"]);
        let mut first = [0; 2];
        let mut second = [0; 8];

        let read = reader
            .read_vectored(&mut [IoSliceMut::new(&mut first), IoSliceMut::new(&mut second)])
            .unwrap();

        assert_eq!(read, 5);
        assert_eq!(&first, b"he");
        assert_eq!(&second[..3], b"llo");
    }

    #[test]
    fn scripted_failures() {
        let mut reader = FakeReader::builder()
            .chunk("x")
            .would_block()
            .fail(io::ErrorKind::ConnectionReset)
            .keep_open()
            .build();
        let mut buf = [0; 4];

        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(reader.read(&mut buf).unwrap_err().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(reader.read(&mut buf).unwrap_err().kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(reader.read(&mut buf).unwrap_err().kind(), io::ErrorKind::WouldBlock);
    }
}
