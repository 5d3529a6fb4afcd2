// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A response cut short by a framing break fails its call instead of succeeding partially.

use cordbuf::CordBuf;
use cordbuf::testing::FakeWriter;
use cordpipe::testing::{LineClientProtocol, LineRequest, LineRequestSerializer};
use cordpipe::{CallError, CallRegistry, Connection, InputMessenger, MessengerOptions, ParseError, issue_call};
use futures::executor::block_on;
use tick::Clock;

#[test]
fn two_of_three_replies_before_oversized_reply() {
    let registry = CallRegistry::new();
    let messenger = InputMessenger::builder(Clock::new_frozen())
        .protocol(LineClientProtocol::new(registry.clone()))
        .options(MessengerOptions::new().max_body_size(16))
        .build();
    let connection = Connection::new(1, FakeWriter::new());

    let request = LineRequest::new(["GET a", "GET b", "GET c"]);
    let call = issue_call(&registry, &connection, &LineRequestSerializer, &request).unwrap();
    let sibling = issue_call(&registry, &connection, &LineRequestSerializer, &LineRequest::new(["GET d"])).unwrap();

    let info = connection.pop_pipelined_info().unwrap();
    assert_eq!(info.count, 3);
    connection.giveback_pipelined_info(info);

    let mut input = CordBuf::from("+1\r\n+2\r\n+this reply is far longer than the limit allows\r\n");
    let error = messenger.on_new_bytes(&connection, &mut input, false).unwrap_err();

    assert_eq!(error.parse_error(), Some(ParseError::TooBigData));
    assert!(connection.is_failed());
    assert_eq!(
        block_on(call),
        Err(CallError::PipelinedCountMismatch { expected: 3, actual: 2 })
    );

    // The sibling call is untouched; the connection layer fails it when tearing down.
    assert_eq!(registry.pending(), 1);
    assert_eq!(cordpipe::abandon_calls(&registry, &connection), 1);
    assert_eq!(block_on(sibling), Err(CallError::ConnectionBroken));
}

#[test]
fn oversized_first_reply_is_a_connection_error() {
    let registry = CallRegistry::new();
    let messenger = InputMessenger::builder(Clock::new_frozen())
        .protocol(LineClientProtocol::new(registry.clone()))
        .options(MessengerOptions::new().max_body_size(4))
        .build();
    let connection = Connection::new(1, FakeWriter::new());

    let mut call = issue_call(&registry, &connection, &LineRequestSerializer, &LineRequest::new(["GET a"])).unwrap();

    let error = messenger
        .on_new_bytes(&connection, &mut CordBuf::from("+0123456789"), false)
        .unwrap_err();

    assert_eq!(error.parse_error(), Some(ParseError::TooBigData));
    assert_eq!(call.try_take(), None);

    // The broken response keeps its queue entry, so tearing down the connection fails the call.
    assert_eq!(cordpipe::abandon_calls(&registry, &connection), 1);
    assert_eq!(call.try_take(), Some(Err(CallError::ConnectionBroken)));
}

#[test]
fn extra_replies_are_not_a_match() {
    let registry = CallRegistry::new();
    let messenger = InputMessenger::builder(Clock::new_frozen())
        .protocol(LineClientProtocol::new(registry.clone()))
        .build();
    let connection = Connection::new(1, FakeWriter::new());

    let call = issue_call(&registry, &connection, &LineRequestSerializer, &LineRequest::new(["GET a"])).unwrap();

    // One reply completes the call; the stray second reply has no request to belong to.
    let error = messenger
        .on_new_bytes(&connection, &mut CordBuf::from("+1\r\n+2\r\n"), false)
        .unwrap_err();

    assert_eq!(error.parse_error(), Some(ParseError::TryOthers));
    assert_eq!(block_on(call), Ok(vec!["1".to_owned()]));
}
