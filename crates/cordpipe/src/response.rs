// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use nm::Event;
use tracing::{Level, event};

use crate::correlation::Settle;
use crate::{CallError, CallId, CallRegistry, FinishOutcome, LockError};

/// What happened to a response handed to [`process_response()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// The call completed with the response's result.
    Completed,

    /// The response carried a different number of replies than the call expects. The call
    /// completed with [`CallError::PipelinedCountMismatch`].
    CountMismatch {
        /// Replies recorded when the request was sent.
        expected: u32,
        /// Replies the response carried.
        actual: u32,
    },

    /// The call had already finished, typically by timing out. The response was discarded.
    Dropped,

    /// The response belongs to an attempt that has been retried since. The response was
    /// discarded and the call keeps waiting for the current attempt.
    Stale,

    /// Another response held the call. This one is queued behind it and completes the call
    /// if the holder gives the call back, for example because the holder's attempt was retried.
    Queued,
}

/// Completes the call `id` with a decoded response made of `reply_count` replies.
///
/// A call that already has its final result drops the response without touching the call. A
/// call held by another response gets this one queued behind the holder rather than dropped.
/// A reply count that differs from the one recorded at registration turns into a call error
/// instead of a partial success.
pub fn process_response<R>(registry: &CallRegistry<R>, id: CallId, reply_count: u32, result: Result<R, CallError>) -> ResponseOutcome {
    let mut guard = match registry.lock(id) {
        Ok(guard) => guard,
        Err(LockError::Busy(_)) => return queue_behind_holder(registry, id, reply_count, result),
        Err(error @ LockError::Finished(_)) => return dropped(id, &error),
    };

    let (result, outcome) = judge(guard.expected_count(), reply_count, result);

    match result {
        Ok(response) => guard.set_response(response),
        Err(error) => guard.set_error(error),
    }

    match guard.finish() {
        FinishOutcome::Completed => outcome,
        FinishOutcome::Stale => ResponseOutcome::Stale,
    }
}

fn queue_behind_holder<R>(registry: &CallRegistry<R>, id: CallId, reply_count: u32, result: Result<R, CallError>) -> ResponseOutcome {
    let Some(expected) = registry.expected_count(id) else {
        return dropped(id, &LockError::Finished(id));
    };

    let (result, outcome) = judge(expected, reply_count, result);

    match registry.settle(id, true, result) {
        Settle::Completed => outcome,
        Settle::Queued => {
            event!(Level::DEBUG, message = "queued response behind the response holding the call", call = %id);
            ResponseOutcome::Queued
        }
        Settle::Stale => ResponseOutcome::Stale,
        Settle::Rejected => dropped(id, &LockError::Finished(id)),
    }
}

fn judge<R>(expected: u32, reply_count: u32, result: Result<R, CallError>) -> (Result<R, CallError>, ResponseOutcome) {
    if reply_count == expected {
        (result, ResponseOutcome::Completed)
    } else {
        (
            Err(CallError::PipelinedCountMismatch {
                expected,
                actual: reply_count,
            }),
            ResponseOutcome::CountMismatch {
                expected,
                actual: reply_count,
            },
        )
    }
}

fn dropped(id: CallId, reason: &LockError) -> ResponseOutcome {
    RESPONSE_DROPPED.with(|e| e.observe(1));
    event!(Level::DEBUG, message = "dropping late response", call = %id, reason = %reason);
    ResponseOutcome::Dropped
}

thread_local! {
    static RESPONSE_DROPPED: Event = Event::builder()
        .name("cordpipe_response_dropped")
        .build();
}
