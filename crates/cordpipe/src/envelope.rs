// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tick::Clock;

use crate::Connection;

type Payload = Box<dyn Any + Send>;
type Arg = Arc<dyn Any + Send + Sync>;

/// A message a protocol cut from the receive buffer, before it is stamped and dispatched.
///
/// The payload is whatever the protocol wants its process step to see: decoded fields, a raw
/// [`CordBuf`][cordbuf::CordBuf] slice to decode later, or both.
pub struct ParsedMessage {
    payload: Payload,
    arg: Option<Arg>,
}

impl ParsedMessage {
    /// Wraps a protocol-specific payload.
    pub fn new<T: Send + 'static>(payload: T) -> Self {
        Self {
            payload: Box::new(payload),
            arg: None,
        }
    }

    /// Attaches state shared by all messages of the protocol, such as the server the message
    /// is addressed to.
    #[must_use]
    pub fn with_arg(mut self, arg: Arc<dyn Any + Send + Sync>) -> Self {
        self.arg = Some(arg);
        self
    }
}

impl fmt::Debug for ParsedMessage {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedMessage")
            .field("has_arg", &self.arg.is_some())
            .finish_non_exhaustive()
    }
}

/// A received message on its way from the parser to the process step.
///
/// The envelope is moved, never shared: the dispatcher owns it until it hands it to the
/// protocol's process step, which consumes it. Whatever path the process step takes, the
/// envelope and its payload are released exactly once when it goes out of scope.
pub struct InputMessage {
    received_at: Instant,
    base_real_time: SystemTime,
    connection: Connection,
    protocol: &'static str,
    arg: Option<Arg>,
    payload: Payload,
}

impl InputMessage {
    /// Stamps a parsed message with the current time of `clock`.
    #[must_use]
    pub fn new(parsed: ParsedMessage, connection: Connection, protocol: &'static str, clock: &Clock) -> Self {
        Self {
            received_at: clock.instant(),
            base_real_time: clock.system_time(),
            connection,
            protocol,
            arg: parsed.arg,
            payload: parsed.payload,
        }
    }

    /// When the message was cut from the receive buffer.
    #[must_use]
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// The wall-clock time matching [`received_at()`][Self::received_at], for turning relative
    /// timings into absolute ones.
    #[must_use]
    pub fn base_real_time(&self) -> SystemTime {
        self.base_real_time
    }

    /// The connection the message arrived on. Replies can be written through it.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The name of the protocol that parsed the message.
    #[must_use]
    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    /// The shared state attached with [`ParsedMessage::with_arg()`], if it is a `T`.
    #[must_use]
    pub fn arg<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.arg.as_deref().and_then(|arg| arg.downcast_ref::<T>())
    }

    /// The payload, if it is a `T`.
    #[must_use]
    pub fn payload_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// The payload for in-place decoding, if it is a `T`.
    pub fn payload_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.downcast_mut::<T>()
    }

    /// Consumes the envelope and returns the payload.
    ///
    /// # Errors
    ///
    /// Returns the envelope unchanged if the payload is not a `T`.
    pub fn into_payload<T: Any>(self) -> Result<T, Self> {
        match self.payload.downcast::<T>() {
            Ok(payload) => Ok(*payload),
            Err(payload) => Err(Self { payload, ..self }),
        }
    }
}

impl fmt::Debug for InputMessage {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputMessage")
            .field("protocol", &self.protocol)
            .field("connection", &self.connection.id())
            .field("received_at", &self.received_at)
            .finish_non_exhaustive()
    }
}
