// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Protocol-agnostic message pipeline over [`cordbuf`] receive buffers.
//!
//! The crate is the part of an RPC transport that sits between raw connection bytes and the
//! code waiting for responses:
//!
//! * An [`InputMessenger`] accumulates the bytes of a connection, asks the registered
//!   [`Protocol`]s to cut messages out of them and dispatches every message to its protocol's
//!   process step. Protocols are detected per connection and then locked in.
//! * A [`Connection`] serializes its writers and records, for every request sent, a
//!   [`PipelinedInfo`] describing the response it expects. On protocols without correlation
//!   identifiers, that queue is what ties a response to its request.
//! * A [`CallRegistry`] binds outstanding calls to their responses. A call completes exactly
//!   once, whether by its response, a timeout or a cancellation, and late responses are
//!   dropped without touching the caller.
//!
//! ```
//! use cordbuf::CordBuf;
//! use cordbuf::testing::FakeWriter;
//! use cordpipe::{CallRegistry, Connection, PipelinedInfo, process_response};
//!
//! let registry = CallRegistry::<String>::new();
//! let connection = Connection::new(1, FakeWriter::new());
//!
//! let (id, mut call) = registry.register(1);
//! connection
//!     .write_request(&mut CordBuf::from("GET a\r\n"), PipelinedInfo::new(id, 1))
//!     .unwrap();
//!
//! // The reply carries no identifier; its position on the connection names the call.
//! let info = connection.pop_pipelined_info().unwrap();
//! process_response(&registry, info.id_wait, 1, Ok("1".to_owned()));
//!
//! assert_eq!(call.try_take(), Some(Ok("1".to_owned())));
//! ```

mod client;
mod connection;
mod correlation;
mod envelope;
mod error;
mod messenger;
mod parse;
mod pipelined;
mod protocol;
mod response;

pub use client::{abandon_calls, issue_call};
pub use connection::Connection;
pub use correlation::{CallGuard, CallHandle, CallId, CallPhase, CallRegistry, FinishOutcome, LockError};
pub use envelope::{InputMessage, ParsedMessage};
pub use error::{CallError, MessengerError, MessengerErrorKind, SerializeError};
pub use messenger::{Dispatcher, InlineDispatcher, InputMessenger, InputMessengerBuilder, MessengerOptions, ReadSummary};
pub use parse::{ParseError, ParseResult};
pub use pipelined::{PipelinedInfo, PipelinedQueue};
pub use protocol::{CallContext, ParseContext, Protocol, RequestSerializer};
pub use response::{ResponseOutcome, process_response};

#[cfg(any(test, feature = "test-util"))]
pub mod testing;
