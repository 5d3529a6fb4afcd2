// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// Why a protocol could not cut a message from the accumulated bytes.
///
/// Only some of these are failures. [`NotEnoughData`][Self::NotEnoughData] is the normal
/// "come back when more bytes have arrived" signal and [`TryOthers`][Self::TryOthers] is part of
/// protocol detection on a fresh connection.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Hash)]
pub enum ParseError {
    /// The bytes do not belong to this protocol. Another registered protocol should try.
    #[error("bytes do not match the protocol")]
    TryOthers,

    /// The message is incomplete. Parsing must be retried once more bytes arrive.
    #[error("message is incomplete")]
    NotEnoughData,

    /// The message is larger than the configured limit.
    #[error("message exceeds the size limit")]
    TooBigData,

    /// A resource the message needs is unavailable, for example because authentication was
    /// rejected.
    #[error("resource for the message is unavailable")]
    NoResource,

    /// The bytes are corrupt beyond recovery.
    #[error("message framing is corrupt")]
    AbsolutelyWrong,
}

impl ParseError {
    /// Whether the connection cannot continue after this error.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::TooBigData | Self::NoResource | Self::AbsolutelyWrong)
    }

    /// Whether the same bytes may parse successfully once more data arrives.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::NotEnoughData)
    }

    /// A stable identifier suitable for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TryOthers => "try_others",
            Self::NotEnoughData => "not_enough_data",
            Self::TooBigData => "too_big_data",
            Self::NoResource => "no_resource",
            Self::AbsolutelyWrong => "absolutely_wrong",
        }
    }
}

/// The outcome of one attempt to cut a message.
pub type ParseResult<T> = Result<T, ParseError>;
