// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Block-based byte buffers for network I/O that share, append and cut bytes without copying.
//!
//! A [`CordBuf`] is a logical byte sequence stored as an ordered list of [`BlockRef`]s, each a
//! view into a reference-counted [`Block`] of storage. The bytes of one message are usually
//! not contiguous in memory; in exchange, the operations a protocol stack performs all the time
//! are cheap:
//!
//! * Cloning a buffer or appending one buffer to another copies only the block references.
//! * Cutting a decoded message off the front of a receive buffer ([`cutn()`], [`cut_until()`])
//!   hands the message its own references to the same blocks.
//! * Broadcasting one serialized message to many connections shares the same blocks between
//!   threads, because bytes inside a block are never rewritten once a reference covers them.
//!
//! Bytes are copied only when raw data enters the buffer ([`append()`]) or when content must be
//! materialized contiguously ([`fetch()`], [`copy_to()`]).
//!
//! # Consuming
//!
//! Parsers either consume directly through the buffer's methods, through a [`CordBufCutter`]
//! that caches the front block for byte-at-a-time work, or scan ahead without consuming via the
//! cheap-to-copy [`CordBufBytesIterator`].
//!
//! ```
//! use cordbuf::CordBuf;
//!
//! let mut input = CordBuf::new();
//! input.append(b"GET k").unwrap();
//! input.append(b"ey1\r\nGET key2\r\n").unwrap();
//!
//! let mut line = CordBuf::new();
//! while input.cut_until(&mut line, b"\r\n").is_some() {
//!     assert!(line.starts_with(b"GET "));
//!     line.clear();
//! }
//!
//! assert!(input.is_empty());
//! ```
//!
//! # Transports
//!
//! [`CordBuf::cut_into_writer()`] moves content into any [`std::io::Write`] with one vectored
//! write, and [`IoPortal`] reads from any [`std::io::Read`] with one vectored read straight into
//! blocks from a per-connection [`BlockPool`]. The [`ZeroCopyInputStream`] and
//! [`ZeroCopyOutputStream`] traits let chunk-oriented serializers work on a buffer in place.
//!
//! [`cutn()`]: CordBuf::cutn
//! [`cut_until()`]: CordBuf::cut_until
//! [`append()`]: CordBuf::append
//! [`fetch()`]: CordBuf::fetch
//! [`copy_to()`]: CordBuf::copy_to

mod block;
mod buf;
mod bytes_iter;
mod cutter;
mod error;
mod io;
mod pool;
mod portal;
mod storage;
mod stream;

pub use block::{Block, BlockRef, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};
pub use buf::{CordBuf, ReservedArea};
pub use bytes_iter::CordBufBytesIterator;
pub use cutter::CordBufCutter;
pub use error::{AllocError, Result};
pub use io::{CordBufReader, CordBufWriter};
pub use pool::{BlockPool, BlockPoolOptions};
pub use portal::IoPortal;
pub use stream::{CordBufInputStream, CordBufOutputStream, ZeroCopyInputStream, ZeroCopyOutputStream};

#[cfg(any(test, feature = "test-util"))]
pub mod testing;
