// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Binding outstanding calls to the responses that complete them.
//!
//! Every call moves through three phases. It starts out pending. Whoever wants to complete it
//! (a response, a timeout or a cancellation) must win a compare-and-swap out of the pending
//! phase, which guarantees that each call completes exactly once no matter how those paths race.
//! A response locks the call into the completing phase while it fills in the result, then
//! finishes it; timeouts and cancellations go straight to done.
//!
//! A timeout, cancellation or response that arrives while another response holds the lock is
//! queued on the call. If the holder completes the call, the queued completion is discarded. If
//! the holder gives the call back, because its attempt was retried since or because the guard
//! was dropped, the queued completion finishes the call instead of being lost.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures_channel::oneshot;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{Level, event};

use crate::CallError;

const PENDING: u8 = 0;
const COMPLETING: u8 = 1;
const DONE: u8 = 2;

/// Identifies one attempt of an outstanding call.
///
/// Retrying a call keeps its slot but bumps the attempt, so responses to an earlier attempt
/// can be told apart from the response to the current one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallId {
    slot: u64,
    attempt: u32,
}

impl CallId {
    /// Creates an identifier from its parts.
    #[must_use]
    pub const fn new(slot: u64, attempt: u32) -> Self {
        Self { slot, attempt }
    }

    /// The call this identifier belongs to.
    #[must_use]
    pub const fn slot(self) -> u64 {
        self.slot
    }

    /// Which attempt of the call this identifier refers to.
    #[must_use]
    pub const fn attempt(self) -> u32 {
        self.attempt
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot, self.attempt)
    }
}

/// The lifecycle phase of a registered call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallPhase {
    /// Waiting for a response, timeout or cancellation.
    Pending,
    /// A response holds the call's lock.
    Completing,
    /// The call has its final result.
    Done,
}

impl CallPhase {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            PENDING => Self::Pending,
            COMPLETING => Self::Completing,
            _ => Self::Done,
        }
    }
}

/// Why a call could not be locked.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum LockError {
    /// Another response is completing the call right now.
    #[error("call {0} is being completed by someone else")]
    Busy(CallId),

    /// The call already has its final result (for example it timed out) or never existed.
    #[error("call {0} is already finished")]
    Finished(CallId),
}

/// What became of a completion offered to a call without locking it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Settle {
    /// The completion finished the call.
    Completed,
    /// A response holds the call; the completion applies if the holder gives the call back.
    Queued,
    /// The completion belongs to an attempt that has been retried since.
    Stale,
    /// The call already has its final result, or another completion is queued ahead.
    Rejected,
}

/// How [`CallGuard::finish()`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The result went to the waiting caller.
    Completed,

    /// The guard belonged to an earlier attempt of a call that has been retried since. The
    /// call's previous error was restored and the call is pending again, unless a completion
    /// queued behind the guard finished it.
    Stale,
}

type Completion<R> = Result<R, CallError>;

struct CallSlot<R> {
    phase: AtomicU8,
    attempt: AtomicU32,
    expected_count: u32,
    state: Mutex<SlotState<R>>,
}

struct SlotState<R> {
    error: Option<CallError>,
    response: Option<R>,
    sender: Option<oneshot::Sender<Completion<R>>>,

    // Arrived while a guard held the call. Delivered if the guard gives the call back.
    queued: Option<Completion<R>>,
}

struct RegistryInner<R> {
    next_slot: AtomicU64,
    slots: Mutex<HashMap<u64, Arc<CallSlot<R>>>>,
}

/// Tracks outstanding calls whose result is an `R`.
///
/// Clones are handles to the same registry.
pub struct CallRegistry<R> {
    inner: Arc<RegistryInner<R>>,
}

impl<R> CallRegistry<R> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_slot: AtomicU64::new(1),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers a new call whose response consists of `expected_count` replies.
    ///
    /// Returns the identifier of its first attempt and the handle the caller awaits.
    pub fn register(&self, expected_count: u32) -> (CallId, CallHandle<R>) {
        let slot = self.inner.next_slot.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();

        let call = Arc::new(CallSlot {
            phase: AtomicU8::new(PENDING),
            attempt: AtomicU32::new(0),
            expected_count,
            state: Mutex::new(SlotState {
                error: None,
                response: None,
                sender: Some(sender),
                queued: None,
            }),
        });

        self.inner.slots.lock().insert(slot, call);

        let id = CallId::new(slot, 0);
        (id, CallHandle { id, receiver })
    }

    fn slot(&self, id: CallId) -> Option<Arc<CallSlot<R>>> {
        self.inner.slots.lock().get(&id.slot).map(Arc::clone)
    }

    fn remove(&self, id: CallId) {
        self.inner.slots.lock().remove(&id.slot);
    }

    /// Takes exclusive control of a pending call so a response can complete it.
    ///
    /// # Errors
    ///
    /// Fails if the call is finished already, for example because it timed out, or if another
    /// response holds it. A response that finds its call busy can still be queued behind the
    /// holder, see [`process_response()`][crate::process_response].
    pub fn lock(&self, id: CallId) -> Result<CallGuard<R>, LockError> {
        let slot = self.slot(id).ok_or(LockError::Finished(id))?;

        if let Err(phase) = slot
            .phase
            .compare_exchange(PENDING, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(match phase {
                COMPLETING => LockError::Busy(id),
                _ => LockError::Finished(id),
            });
        }

        let saved_error = slot.state.lock().error.clone();

        Ok(CallGuard {
            registry: self.clone(),
            slot,
            id,
            saved_error,
            finished: false,
        })
    }

    /// Completes a call with `error`.
    ///
    /// If a response holds the call, the error is queued behind it: a response that completes
    /// the call wins, while a holder that gives the call back (a stale attempt or a dropped
    /// guard) leaves the call to the error.
    ///
    /// Returns `false` if the call already has its final result or another completion is
    /// queued ahead of this one.
    pub fn fail(&self, id: CallId, error: CallError) -> bool {
        matches!(self.settle(id, false, Err(error)), Settle::Completed | Settle::Queued)
    }

    /// Completes a call with `result` without locking it, queueing the result if a response
    /// holds the call. With `current_only`, results for a superseded attempt are refused.
    pub(crate) fn settle(&self, id: CallId, current_only: bool, result: Completion<R>) -> Settle {
        let Some(slot) = self.slot(id) else {
            return Settle::Rejected;
        };

        let mut state = slot.state.lock();

        if current_only && slot.attempt.load(Ordering::Acquire) != id.attempt {
            return Settle::Stale;
        }

        // Leaving the completing phase only happens under the state lock, so the phase seen
        // here holds until the lock is released.
        match slot.phase.compare_exchange(PENDING, DONE, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                let sender = state.sender.take();
                drop(state);

                self.remove(id);
                deliver(id, sender, result);
                Settle::Completed
            }
            Err(COMPLETING) if state.queued.is_none() => {
                state.queued = Some(result);
                Settle::Queued
            }
            Err(_) => Settle::Rejected,
        }
    }

    pub(crate) fn expected_count(&self, id: CallId) -> Option<u32> {
        self.slot(id).map(|slot| slot.expected_count)
    }

    /// Fails a call with [`CallError::TimedOut`], as [`fail()`][Self::fail] does.
    pub fn time_out(&self, id: CallId) -> bool {
        self.fail(id, CallError::TimedOut)
    }

    /// Fails a call with [`CallError::Canceled`], as [`fail()`][Self::fail] does.
    pub fn cancel(&self, id: CallId) -> bool {
        self.fail(id, CallError::Canceled)
    }

    /// Records why the current attempt of a pending call failed without completing the call,
    /// typically right before retrying it. A response to a stale attempt restores this error.
    pub fn note_error(&self, id: CallId, error: CallError) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };

        let mut state = slot.state.lock();

        if slot.phase.load(Ordering::Acquire) != PENDING {
            return false;
        }

        state.error = Some(error);
        true
    }

    /// Starts a new attempt of a pending call and returns its identifier.
    ///
    /// Responses to earlier attempts can still lock the call, but their results are discarded
    /// when the guard finishes.
    pub fn retry(&self, id: CallId) -> Option<CallId> {
        let slot = self.slot(id)?;

        if slot.phase.load(Ordering::Acquire) != PENDING {
            return None;
        }

        let attempt = slot.attempt.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        Some(CallId::new(id.slot, attempt))
    }

    /// The phase of a call, or `None` once it has been finished and forgotten.
    #[must_use]
    pub fn phase(&self, id: CallId) -> Option<CallPhase> {
        self.slot(id).map(|slot| CallPhase::from_raw(slot.phase.load(Ordering::Acquire)))
    }

    /// The number of calls that do not have their final result yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.slots.lock().len()
    }
}

impl<R> Clone for CallRegistry<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> Default for CallRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for CallRegistry<R> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRegistry").field("pending", &self.pending()).finish()
    }
}

fn deliver<R>(id: CallId, sender: Option<oneshot::Sender<Completion<R>>>, result: Completion<R>) {
    let Some(sender) = sender else {
        return;
    };

    if sender.send(result).is_err() {
        event!(Level::DEBUG, message = "caller stopped waiting for the result", call = %id);
    }
}

/// Exclusive access to a call that a response is completing.
///
/// Dropping the guard without calling [`finish()`][Self::finish] undoes every change made
/// through it and returns the call to the pending phase. A completion queued while the guard
/// was held finishes the call instead.
#[must_use = "dropping the guard returns the call to the pending phase"]
pub struct CallGuard<R> {
    registry: CallRegistry<R>,
    slot: Arc<CallSlot<R>>,
    id: CallId,

    // The error the call had when it was locked. Restored if this attempt turns out stale.
    saved_error: Option<CallError>,
    finished: bool,
}

impl<R> CallGuard<R> {
    /// The attempt this guard was locked for.
    #[must_use]
    pub fn id(&self) -> CallId {
        self.id
    }

    /// How many replies the caller expects, as recorded at registration.
    #[must_use]
    pub fn expected_count(&self) -> u32 {
        self.slot.expected_count
    }

    /// Whether the guard belongs to the latest attempt of the call.
    #[must_use]
    pub fn is_current_attempt(&self) -> bool {
        self.slot.attempt.load(Ordering::Acquire) == self.id.attempt
    }

    /// Sets the call's result to an error.
    pub fn set_error(&mut self, error: CallError) {
        let mut state = self.slot.state.lock();
        state.error = Some(error);
        state.response = None;
    }

    /// Sets the call's result to a response, replacing any error noted earlier.
    pub fn set_response(&mut self, response: R) {
        let mut state = self.slot.state.lock();
        state.error = None;
        state.response = Some(response);
    }

    /// Hands the result to the waiting caller, unless the call was retried since this guard's
    /// attempt was sent.
    pub fn finish(mut self) -> FinishOutcome {
        self.finished = true;

        if !self.is_current_attempt() {
            self.restore();
            return FinishOutcome::Stale;
        }

        let (sender, result) = {
            let mut state = self.slot.state.lock();
            let result = match (state.error.take(), state.response.take()) {
                (Some(error), _) => Err(error),
                (None, Some(response)) => Ok(response),
                (None, None) => Err(CallError::EmptyResponse),
            };

            if state.queued.take().is_some() {
                event!(Level::DEBUG, message = "discarding completion queued behind the response", call = %self.id);
            }

            self.slot.phase.store(DONE, Ordering::Release);
            (state.sender.take(), result)
        };

        self.registry.remove(self.id);
        deliver(self.id, sender, result);

        FinishOutcome::Completed
    }

    fn restore(&self) {
        let mut state = self.slot.state.lock();
        state.error.clone_from(&self.saved_error);
        state.response = None;

        let Some(result) = state.queued.take() else {
            self.slot.phase.store(PENDING, Ordering::Release);
            return;
        };

        self.slot.phase.store(DONE, Ordering::Release);
        let sender = state.sender.take();
        drop(state);

        self.registry.remove(self.id);
        deliver(self.id, sender, result);
    }
}

impl<R> Drop for CallGuard<R> {
    fn drop(&mut self) {
        if !self.finished {
            self.restore();
        }
    }
}

impl<R> fmt::Debug for CallGuard<R> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallGuard").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Resolves to the result of a registered call.
///
/// The handle is a future; synchronous callers can poll it with
/// [`try_take()`][Self::try_take] instead.
pub struct CallHandle<R> {
    id: CallId,
    receiver: oneshot::Receiver<Completion<R>>,
}

impl<R> CallHandle<R> {
    /// The identifier of the call's first attempt.
    #[must_use]
    pub fn id(&self) -> CallId {
        self.id
    }

    /// The result, if the call has finished.
    ///
    /// A call whose registry went away without finishing it resolves to
    /// [`CallError::Canceled`].
    pub fn try_take(&mut self) -> Option<Completion<R>> {
        match self.receiver.try_recv() {
            Ok(result) => result,
            Err(oneshot::Canceled) => Some(Err(CallError::Canceled)),
        }
    }
}

impl<R> Future for CallHandle<R> {
    type Output = Completion<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(CallError::Canceled)))
    }
}

impl<R> fmt::Debug for CallHandle<R> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle").field("id", &self.id).finish_non_exhaustive()
    }
}
