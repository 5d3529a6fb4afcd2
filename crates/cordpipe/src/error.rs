// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::io;

use cordbuf::AllocError;
use thiserror::Error;

use crate::ParseError;

/// Why a call finished without a usable response.
///
/// Call errors reach only the caller waiting on that specific call. Sibling calls pipelined on
/// the same connection are unaffected.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CallError {
    /// The call's deadline passed before a response arrived.
    #[error("call timed out")]
    TimedOut,

    /// The call was canceled, or the registry tracking it went away.
    #[error("call canceled")]
    Canceled,

    /// The response carried a different number of replies than the request asked for.
    #[error("expected {expected} pipelined replies, received {actual}")]
    PipelinedCountMismatch {
        /// Replies recorded when the request was sent.
        expected: u32,
        /// Replies that actually arrived.
        actual: u32,
    },

    /// The server answered with an error reply.
    #[error("server replied with an error: {0}")]
    Protocol(String),

    /// The connection failed before the response arrived.
    #[error("connection broken before the response arrived")]
    ConnectionBroken,

    /// The request could not be turned into wire bytes.
    #[error("request could not be serialized: {0}")]
    InvalidRequest(String),

    /// A response was processed without any reply content.
    #[error("response carried no content")]
    EmptyResponse,
}

/// Failure to serialize an outgoing request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SerializeError {
    /// The request cannot be expressed on the wire.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The output buffer could not grow.
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

impl From<SerializeError> for CallError {
    fn from(value: SerializeError) -> Self {
        Self::InvalidRequest(value.to_string())
    }
}

/// What went wrong while processing input on a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum MessengerErrorKind {
    /// A protocol rejected the accumulated bytes.
    Parse(ParseError),

    /// The peer closed the connection in the middle of a message.
    TruncatedMessage,

    /// Reading from the transport failed.
    Io(io::ErrorKind),
}

impl fmt::Display for MessengerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(error) => write!(f, "parse failed: {error}"),
            Self::TruncatedMessage => f.write_str("connection closed with a partial message buffered"),
            Self::Io(kind) => write!(f, "read failed: {kind}"),
        }
    }
}

/// The input side of a connection cannot continue.
///
/// Returned to the connection layer, which decides whether to tear the connection down.
#[ohno::error]
#[display("input on connection {connection} failed: {kind}")]
pub struct MessengerError {
    /// The connection the input arrived on.
    pub connection: u64,
    /// The protocol the connection was locked into, if any.
    pub protocol: Option<&'static str>,
    /// What went wrong.
    pub kind: MessengerErrorKind,
}

impl MessengerError {
    /// The parse outcome that caused the failure, if a protocol rejected the bytes.
    #[must_use]
    pub fn parse_error(&self) -> Option<ParseError> {
        match self.kind {
            MessengerErrorKind::Parse(error) => Some(error),
            _ => None,
        }
    }
}
