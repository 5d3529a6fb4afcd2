// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Memory for a new block could not be obtained from the allocator.
///
/// Operations that add bytes to a [`CordBuf`][crate::CordBuf] return this instead of aborting
/// the process. The buffer is left exactly as it was before the failed operation.
#[ohno::error]
#[display("failed to allocate a {size}-byte block")]
pub struct AllocError {
    /// The capacity of the block that could not be allocated.
    pub size: usize,
}

/// A `Result` that may contain an [`AllocError`].
pub type Result<T> = std::result::Result<T, AllocError>;
