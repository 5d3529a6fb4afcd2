// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Responses on a pipelined connection resolve calls in the order the requests were sent.

use std::thread;

use cordbuf::CordBuf;
use cordbuf::testing::FakeWriter;
use cordpipe::testing::{LineClientProtocol, LineRequest, LineRequestSerializer, LineServerProtocol};
use cordpipe::{CallHandle, CallRegistry, Connection, InputMessenger, issue_call};
use futures::executor::block_on;
use tick::Clock;

fn echo_server() -> InputMessenger {
    InputMessenger::builder(Clock::new_frozen())
        .protocol(LineServerProtocol::new(|command| Ok(command.to_owned())))
        .build()
}

// Runs the client's wire bytes through an echo server and returns the server's replies.
fn serve(requests: &[u8]) -> Vec<u8> {
    let replies = FakeWriter::new();
    let server_connection = Connection::new(100, replies.clone());

    echo_server()
        .on_new_bytes(&server_connection, &mut CordBuf::from(requests), true)
        .unwrap();

    replies.contents()
}

#[test]
fn back_to_back_requests_resolve_in_send_order() {
    let registry = CallRegistry::new();
    let client = InputMessenger::builder(Clock::new_frozen())
        .protocol(LineClientProtocol::new(registry.clone()))
        .build();

    let wire = FakeWriter::new();
    let connection = Connection::new(1, wire.clone());

    let handles: Vec<CallHandle<Vec<String>>> = (0..20)
        .map(|i| {
            let commands: Vec<String> = (0..=i % 3).map(|j| format!("GET {i}.{j}")).collect();
            issue_call(&registry, &connection, &LineRequestSerializer, &LineRequest::new(commands)).unwrap()
        })
        .collect();

    assert_eq!(connection.pending_pipelined(), 20);

    // Replies trickle in three bytes at a time, cutting across reply boundaries.
    let replies = serve(&wire.contents());
    let mut input = CordBuf::new();

    for chunk in replies.chunks(3) {
        input.append(chunk).unwrap();
        client.on_new_bytes(&connection, &mut input, false).unwrap();
    }

    assert!(input.is_empty());
    assert_eq!(registry.pending(), 0);

    for (i, handle) in handles.into_iter().enumerate() {
        let expected: Vec<String> = (0..=i % 3).map(|j| format!("GET {i}.{j}")).collect();
        assert_eq!(block_on(handle), Ok(expected));
    }
}

#[test]
fn concurrent_writers_keep_queue_and_wire_in_step() {
    let registry = CallRegistry::new();
    let client = InputMessenger::builder(Clock::new_frozen())
        .protocol(LineClientProtocol::new(registry.clone()))
        .build();

    let wire = FakeWriter::new();
    let connection = Connection::new(1, wire.clone());

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let registry = registry.clone();
            let connection = connection.clone();

            thread::spawn(move || {
                (0..25)
                    .map(|n| {
                        let command = format!("SET {worker}/{n}");
                        let handle = issue_call(&registry, &connection, &LineRequestSerializer, &LineRequest::new([command.clone()])).unwrap();
                        (command, handle)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let calls: Vec<_> = workers.into_iter().flat_map(|worker| worker.join().unwrap()).collect();

    let mut input = CordBuf::from(serve(&wire.contents()));
    assert_eq!(client.on_new_bytes(&connection, &mut input, false).unwrap(), 200);

    // Each call sees the echo of its own command, whatever order the threads wrote in.
    for (command, handle) in calls {
        assert_eq!(block_on(handle), Ok(vec![command]));
    }
}
