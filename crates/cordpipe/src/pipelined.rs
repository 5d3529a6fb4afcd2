// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;

use crate::CallId;

/// What a connection expects back for one request it sent.
///
/// Recorded when the request is written and consumed in send order as responses arrive. On
/// connections whose wire protocol carries no correlation identifier, the position of an entry
/// in the queue is the only thing tying a response to its call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelinedInfo {
    /// The call waiting for the response.
    pub id_wait: CallId,
    /// How many reply units the response consists of.
    pub count: u32,
    /// Whether an authentication reply precedes the reply units.
    pub with_auth: bool,
}

impl PipelinedInfo {
    /// An entry for a call expecting `count` replies and no authentication reply.
    #[must_use]
    pub const fn new(id_wait: CallId, count: u32) -> Self {
        Self {
            id_wait,
            count,
            with_auth: false,
        }
    }

    /// Marks the response as starting with an authentication reply.
    #[must_use]
    pub const fn with_auth(mut self) -> Self {
        self.with_auth = true;
        self
    }
}

/// First-in, first-out queue of [`PipelinedInfo`] entries for one connection.
///
/// Writers only ever push to the back. The connection's single reader pops from the front and
/// may push an entry back to the front if the response for it is not complete yet, so the next
/// parse attempt resumes with the same entry.
#[derive(Debug, Default)]
pub struct PipelinedQueue {
    infos: VecDeque<PipelinedInfo>,
}

impl PipelinedQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request that was just sent.
    pub fn push(&mut self, info: PipelinedInfo) {
        self.infos.push_back(info);
    }

    /// Takes the entry for the oldest outstanding request.
    pub fn pop(&mut self) -> Option<PipelinedInfo> {
        self.infos.pop_front()
    }

    /// Returns an entry taken by [`pop()`][Self::pop] whose response is not complete yet.
    pub fn giveback(&mut self, info: PipelinedInfo) {
        self.infos.push_front(info);
    }

    /// The entry [`pop()`][Self::pop] would return next.
    #[must_use]
    pub fn front(&self) -> Option<&PipelinedInfo> {
        self.infos.front()
    }

    /// The number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether no request is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Removes every entry, oldest first.
    pub fn drain(&mut self) -> Vec<PipelinedInfo> {
        self.infos.drain(..).collect()
    }
}
