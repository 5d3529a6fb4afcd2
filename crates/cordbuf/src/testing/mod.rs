// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fake transports for testing code that moves [`CordBuf`][crate::CordBuf] content through
//! [`std::io`] readers and writers.

mod fake_reader;
mod fake_writer;

pub use fake_reader::*;
pub use fake_writer::*;
