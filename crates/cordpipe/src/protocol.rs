// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The plug-in points through which wire protocols join the pipeline.

use std::fmt::Debug;

use cordbuf::CordBuf;

use crate::{Connection, InputMessage, ParseResult, ParsedMessage, SerializeError};

/// What a parser may know about the bytes it is looking at.
#[derive(Debug)]
pub struct ParseContext<'a> {
    connection: &'a Connection,
    read_eof: bool,
    max_body_size: usize,
}

impl<'a> ParseContext<'a> {
    /// Creates a context for parsing input of `connection`.
    #[must_use]
    pub const fn new(connection: &'a Connection, read_eof: bool, max_body_size: usize) -> Self {
        Self {
            connection,
            read_eof,
            max_body_size,
        }
    }

    /// The connection the bytes arrived on.
    #[must_use]
    pub const fn connection(&self) -> &'a Connection {
        self.connection
    }

    /// Whether the peer has closed its side, so no more bytes will arrive.
    #[must_use]
    pub const fn read_eof(&self) -> bool {
        self.read_eof
    }

    /// The largest message body the parser may accept. Larger messages are
    /// [`TooBigData`][crate::ParseError::TooBigData].
    #[must_use]
    pub const fn max_body_size(&self) -> usize {
        self.max_body_size
    }
}

/// A wire protocol as seen by the receive side of the pipeline.
///
/// The pipeline calls [`parse()`][Self::parse] whenever new bytes arrive, until it stops
/// producing messages, and hands each message to [`process()`][Self::process].
pub trait Protocol: Send + Sync + Debug {
    /// A short name used in logs.
    fn name(&self) -> &'static str;

    /// Cuts one message from the front of `source`.
    ///
    /// Parsing only looks at bytes that have already arrived and never waits for more. On
    /// [`NotEnoughData`][crate::ParseError::NotEnoughData] the parser must leave `source` as it
    /// was, or consume only bytes whose meaning it has recorded in the connection's parsing
    /// context, so a retry with more bytes continues where this attempt stopped. A parser may
    /// write replies to the connection before returning.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`][crate::ParseError] describing why no message could be cut.
    fn parse(&self, source: &mut CordBuf, context: &ParseContext<'_>) -> ParseResult<ParsedMessage>;

    /// Consumes one message produced by [`parse()`][Self::parse].
    fn process(&self, message: InputMessage);
}

/// Per-call settings a serializer fills in while it writes the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallContext {
    pipelined_count: u32,
    with_auth: bool,
}

impl CallContext {
    /// A context for a request expecting a single reply.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pipelined_count: 1,
            with_auth: false,
        }
    }

    /// How many replies the response will consist of.
    #[must_use]
    pub const fn pipelined_count(&self) -> u32 {
        self.pipelined_count
    }

    /// Sets how many replies the response will consist of.
    pub const fn set_pipelined_count(&mut self, count: u32) {
        self.pipelined_count = count;
    }

    /// Whether the request was prefixed with an authentication command.
    #[must_use]
    pub const fn with_auth(&self) -> bool {
        self.with_auth
    }

    /// Marks the request as prefixed with an authentication command, whose reply precedes the
    /// others.
    pub const fn set_with_auth(&mut self, with_auth: bool) {
        self.with_auth = with_auth;
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns outgoing requests of type `Req` into wire bytes.
pub trait RequestSerializer<Req: ?Sized> {
    /// Appends the wire form of `request` to `out` and records in `call` what the response
    /// will look like.
    ///
    /// # Errors
    ///
    /// Fails if the request cannot be expressed on the wire or the buffer cannot grow.
    fn serialize(&self, out: &mut CordBuf, call: &mut CallContext, request: &Req) -> Result<(), SerializeError>;
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use cordbuf::testing::FakeWriter;

    use super::*;

    #[test]
    fn call_context_defaults_to_single_reply() {
        let mut call = CallContext::default();
        assert_eq!(call.pipelined_count(), 1);
        assert!(!call.with_auth());

        call.set_pipelined_count(4);
        call.set_with_auth(true);
        assert_eq!(call.pipelined_count(), 4);
        assert!(call.with_auth());
    }

    #[test]
    fn parse_context_accessors() {
        let connection = Connection::new(9, FakeWriter::new());
        let context = ParseContext::new(&connection, true, 512);

        assert_eq!(context.connection().id(), 9);
        assert!(context.read_eof());
        assert_eq!(context.max_body_size(), 512);
    }
}
