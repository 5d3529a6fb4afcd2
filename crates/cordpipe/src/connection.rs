// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use cordbuf::CordBuf;
use parking_lot::Mutex;
use tracing::{Level, event};

use crate::{PipelinedInfo, PipelinedQueue};

const NO_PROTOCOL: usize = usize::MAX;

type Sink = Box<dyn Write + Send>;

/// A shared handle to one transport connection.
///
/// The handle owns the write side of the transport and the connection state the pipeline needs:
/// the queue of outstanding pipelined requests, the protocol the connection is locked into and
/// a slot for protocol-specific parsing state. Clones refer to the same connection.
///
/// All writers go through one lock. A request's bytes and its [`PipelinedInfo`] entry are
/// recorded under that lock, so the reader can never see a response to a request whose entry is
/// not queued yet, and entries are queued in the order the requests hit the wire.
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: u64,
    peer: Option<SocketAddr>,
    writer: Mutex<Sink>,
    pipelined: Mutex<PipelinedQueue>,
    failed: AtomicBool,
    preferred_protocol: AtomicUsize,
    parsing_context: Mutex<Option<Box<dyn Any + Send>>>,
    authenticated: AtomicBool,
}

impl Connection {
    /// Creates a connection that writes to `writer`.
    pub fn new(id: u64, writer: impl Write + Send + 'static) -> Self {
        Self::build(id, None, Box::new(writer))
    }

    /// Creates a connection to a known peer that writes to `writer`.
    pub fn with_peer(id: u64, peer: SocketAddr, writer: impl Write + Send + 'static) -> Self {
        Self::build(id, Some(peer), Box::new(writer))
    }

    fn build(id: u64, peer: Option<SocketAddr>, writer: Sink) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                peer,
                writer: Mutex::new(writer),
                pipelined: Mutex::new(PipelinedQueue::new()),
                failed: AtomicBool::new(false),
                preferred_protocol: AtomicUsize::new(NO_PROTOCOL),
                parsing_context: Mutex::new(None),
                authenticated: AtomicBool::new(false),
            }),
        }
    }

    /// The identifier the connection layer assigned to the connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The remote address, if known.
    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Sends a request and records what its response will look like.
    ///
    /// The entry is queued before the first byte is written, while holding the write lock.
    /// Written bytes are removed from `request`.
    ///
    /// # Errors
    ///
    /// Fails with [`io::ErrorKind::NotConnected`] if the connection has failed already, or with
    /// the transport's error if the write fails. A failed write marks the connection as failed;
    /// its queued entries can be collected with [`abandon()`][Self::abandon].
    pub fn write_request(&self, request: &mut CordBuf, info: PipelinedInfo) -> io::Result<()> {
        let mut writer = self.inner.writer.lock();

        if self.is_failed() {
            return Err(io::ErrorKind::NotConnected.into());
        }

        self.inner.pipelined.lock().push(info);
        self.write_locked(&mut writer, request)
    }

    /// Sends bytes that expect no response, such as a server's replies.
    ///
    /// # Errors
    ///
    /// Same as [`write_request()`][Self::write_request].
    pub fn write(&self, bytes: &mut CordBuf) -> io::Result<()> {
        let mut writer = self.inner.writer.lock();

        if self.is_failed() {
            return Err(io::ErrorKind::NotConnected.into());
        }

        self.write_locked(&mut writer, bytes)
    }

    fn write_locked(&self, writer: &mut Sink, bytes: &mut CordBuf) -> io::Result<()> {
        let result = bytes.write_all_to(writer).and_then(|()| writer.flush());

        if let Err(error) = &result {
            event!(Level::WARN, message = "write failed", connection = self.inner.id, error = %error);
            self.set_failed();
        }

        result
    }

    /// Takes the entry for the oldest request still waiting for its response.
    ///
    /// Only the connection's reader may call this.
    pub fn pop_pipelined_info(&self) -> Option<PipelinedInfo> {
        self.inner.pipelined.lock().pop()
    }

    /// Puts back an entry taken by [`pop_pipelined_info()`][Self::pop_pipelined_info] whose
    /// response is not complete yet.
    ///
    /// Writers only append to the queue, so the entry becomes the front again even if requests
    /// were sent in between.
    pub fn giveback_pipelined_info(&self, info: PipelinedInfo) {
        self.inner.pipelined.lock().giveback(info);
    }

    /// The number of requests still waiting for their response.
    #[must_use]
    pub fn pending_pipelined(&self) -> usize {
        self.inner.pipelined.lock().len()
    }

    /// Marks the connection as failed and takes every queued entry, oldest first.
    ///
    /// The calls behind the returned entries will never see their responses.
    pub fn abandon(&self) -> Vec<PipelinedInfo> {
        let _writer = self.inner.writer.lock();
        self.set_failed();
        self.inner.pipelined.lock().drain()
    }

    /// Marks the connection as unusable. Later writes fail.
    pub fn set_failed(&self) {
        self.inner.failed.store(true, Ordering::Release);
    }

    /// Whether the connection can no longer be written to.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::Acquire)
    }

    /// The index of the protocol the connection is locked into, if any.
    #[must_use]
    pub fn preferred_protocol(&self) -> Option<usize> {
        match self.inner.preferred_protocol.load(Ordering::Acquire) {
            NO_PROTOCOL => None,
            index => Some(index),
        }
    }

    /// Locks the connection into the protocol at `index`. `None` clears the choice.
    pub fn set_preferred_protocol(&self, index: Option<usize>) {
        self.inner
            .preferred_protocol
            .store(index.unwrap_or(NO_PROTOCOL), Ordering::Release);
    }

    /// Runs `f` on the connection's parsing state of type `T`, creating a default one first if
    /// the connection has none or has one of a different type.
    ///
    /// The state survives between parse attempts, which lets a protocol resume a message that
    /// spans several reads. `f` must not access the parsing state of the same connection again.
    pub fn with_parsing_context<T, O>(&self, f: impl FnOnce(&mut T) -> O) -> O
    where
        T: Default + Send + 'static,
    {
        let mut slot = self.inner.parsing_context.lock();

        if let Some(context) = slot.as_mut().and_then(|context| context.downcast_mut::<T>()) {
            return f(context);
        }

        let mut fresh = T::default();
        let output = f(&mut fresh);
        *slot = Some(Box::new(fresh));
        output
    }

    /// Drops the connection's parsing state.
    pub fn clear_parsing_context(&self) {
        *self.inner.parsing_context.lock() = None;
    }

    /// Whether the connection has completed authentication.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::Acquire)
    }

    /// Records whether authentication has completed.
    pub fn set_authenticated(&self, authenticated: bool) {
        self.inner.authenticated.store(authenticated, Ordering::Release);
    }
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for Connection {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("failed", &self.is_failed())
            .field("preferred_protocol", &self.preferred_protocol())
            .finish_non_exhaustive()
    }
}
