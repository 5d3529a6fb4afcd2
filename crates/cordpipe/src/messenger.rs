// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::io::{self, Read};
use std::num::NonZero;
use std::sync::Arc;

use cordbuf::{CordBuf, IoPortal};
use nm::{Event, Magnitude};
use tick::Clock;
use tracing::{Level, event};

use crate::{Connection, InputMessage, MessengerError, MessengerErrorKind, ParseContext, ParseError, ParsedMessage, Protocol};

const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

const DEFAULT_READ_CHUNK_BLOCKS: NonZero<usize> = NonZero::new(4).expect("default read chunk is non-zero");

/// Limits and tuning for an [`InputMessenger`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessengerOptions {
    pub(crate) max_body_size: usize,
    pub(crate) read_chunk_blocks: NonZero<usize>,
}

impl MessengerOptions {
    /// Options with a 64 MiB body limit, reading up to four blocks at a time.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            read_chunk_blocks: DEFAULT_READ_CHUNK_BLOCKS,
        }
    }

    /// The largest message body protocols may accept.
    #[must_use]
    pub const fn max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// How many pool blocks a single read from the transport may fill.
    #[must_use]
    pub const fn read_chunk_blocks(mut self, count: NonZero<usize>) -> Self {
        self.read_chunk_blocks = count;
        self
    }
}

impl Default for MessengerOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides where the process step of a parsed message runs.
pub trait Dispatcher: Send + Sync + Debug {
    /// Arranges for `protocol` to process `message`. Must not drop the message unprocessed.
    fn dispatch(&self, protocol: Arc<dyn Protocol>, message: InputMessage);
}

/// Processes every message on the thread that parsed it, in arrival order.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, protocol: Arc<dyn Protocol>, message: InputMessage) {
        protocol.process(message);
    }
}

/// What one [`InputMessenger::on_readable()`] call did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadSummary {
    /// Bytes read from the transport.
    pub bytes: usize,
    /// Messages cut and dispatched.
    pub messages: usize,
    /// Whether the peer closed its side.
    pub closed: bool,
}

/// The receive side of the pipeline: cuts messages from a connection's accumulated bytes and
/// dispatches them to their protocol.
///
/// Protocols are tried in registration order until one recognizes the bytes, after which the
/// connection stays locked into that protocol. One messenger serves any number of connections,
/// but the input of each connection must be handled by one thread at a time.
#[derive(Debug)]
pub struct InputMessenger {
    protocols: Vec<Arc<dyn Protocol>>,
    dispatcher: Arc<dyn Dispatcher>,
    options: MessengerOptions,
    clock: Clock,
}

impl InputMessenger {
    /// Starts building a messenger that stamps messages with times from `clock`.
    #[must_use]
    pub fn builder(clock: Clock) -> InputMessengerBuilder {
        InputMessengerBuilder {
            protocols: Vec::new(),
            dispatcher: None,
            options: MessengerOptions::new(),
            clock,
        }
    }

    /// The options the messenger was built with.
    #[must_use]
    pub fn options(&self) -> &MessengerOptions {
        &self.options
    }

    /// The registered protocols, in the order they are tried.
    pub fn protocols(&self) -> impl Iterator<Item = &(dyn Protocol + 'static)> {
        self.protocols.iter().map(AsRef::as_ref)
    }

    /// Reads everything `reader` has to offer into `portal` and processes the new bytes after
    /// every read.
    ///
    /// Returns once the reader would block or reaches the end of the stream.
    ///
    /// # Errors
    ///
    /// Fails if reading fails or the accumulated bytes cannot be parsed. The connection is
    /// marked as failed in that case and should be torn down.
    pub fn on_readable(
        &self,
        connection: &Connection,
        portal: &mut IoPortal,
        reader: &mut impl Read,
    ) -> Result<ReadSummary, MessengerError> {
        let max = portal.pool().block_size().saturating_mul(self.options.read_chunk_blocks.get());
        let mut summary = ReadSummary::default();

        loop {
            match portal.append_from_reader(reader, max) {
                Ok(0) => {
                    summary.closed = true;
                    summary.messages += self.on_new_bytes(connection, portal, true)?;
                    return Ok(summary);
                }
                Ok(read) => {
                    summary.bytes += read;
                    summary.messages += self.on_new_bytes(connection, portal, false)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(summary),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    let kind = MessengerErrorKind::Io(e.kind());
                    self.report(connection, kind);
                    return Err(MessengerError::caused_by(
                        connection.id(),
                        self.locked_protocol_name(connection),
                        kind,
                        e,
                    ));
                }
            }
        }
    }

    /// Cuts and dispatches every complete message at the front of `source`.
    ///
    /// All messages but the last are dispatched as soon as they are cut; the last one is
    /// dispatched after parsing stops, so it is always processed after the messages before it.
    /// Messages cut before a failure are still dispatched. Returns the number of messages
    /// dispatched.
    ///
    /// # Errors
    ///
    /// Fails if a protocol rejects the bytes, or if `read_eof` is set and a partial message
    /// remains. The connection is marked as failed in that case.
    pub fn on_new_bytes(&self, connection: &Connection, source: &mut CordBuf, read_eof: bool) -> Result<usize, MessengerError> {
        let mut last: Option<(Arc<dyn Protocol>, InputMessage)> = None;
        let mut dispatched = 0;

        let outcome = loop {
            if source.is_empty() {
                break Ok(());
            }

            let before = source.len();

            match self.cut_input_message(connection, source, read_eof) {
                Ok((protocol, parsed)) => {
                    MESSAGE_PARSED_SIZE.with(|e| e.observe(before - source.len()));

                    let message = InputMessage::new(parsed, connection.clone(), protocol.name(), &self.clock);
                    dispatched += 1;

                    if let Some((protocol, previous)) = last.replace((Arc::clone(protocol), message)) {
                        self.dispatch(protocol, previous);
                    }
                }
                Err(ParseError::NotEnoughData) if read_eof => break Err(MessengerErrorKind::TruncatedMessage),
                Err(ParseError::NotEnoughData) => break Ok(()),
                Err(error) => break Err(MessengerErrorKind::Parse(error)),
            }
        };

        if let Some((protocol, message)) = last {
            self.dispatch(protocol, message);
        }

        outcome.map(|()| dispatched).map_err(|kind| {
            self.report(connection, kind);
            MessengerError::new(connection.id(), self.locked_protocol_name(connection), kind)
        })
    }

    fn cut_input_message(
        &self,
        connection: &Connection,
        source: &mut CordBuf,
        read_eof: bool,
    ) -> Result<(&Arc<dyn Protocol>, ParsedMessage), ParseError> {
        let context = ParseContext::new(connection, read_eof, self.options.max_body_size);

        if let Some(protocol) = connection.preferred_protocol().and_then(|index| self.protocols.get(index)) {
            return match protocol.parse(source, &context) {
                Ok(parsed) => Ok((protocol, parsed)),
                Err(ParseError::TryOthers) => {
                    event!(
                        Level::WARN,
                        message = "bytes do not match the protocol the connection is locked into",
                        connection = connection.id(),
                        protocol = protocol.name()
                    );
                    Err(ParseError::TryOthers)
                }
                Err(error) => Err(error),
            };
        }

        for (index, protocol) in self.protocols.iter().enumerate() {
            match protocol.parse(source, &context) {
                Err(ParseError::TryOthers) => {}
                result => {
                    event!(
                        Level::TRACE,
                        message = "connection locked into protocol",
                        connection = connection.id(),
                        protocol = protocol.name()
                    );
                    connection.set_preferred_protocol(Some(index));

                    return result.map(|parsed| (protocol, parsed));
                }
            }
        }

        Err(ParseError::TryOthers)
    }

    fn dispatch(&self, protocol: Arc<dyn Protocol>, message: InputMessage) {
        event!(
            Level::TRACE,
            message = "dispatching message",
            connection = message.connection().id(),
            protocol = protocol.name()
        );

        self.dispatcher.dispatch(protocol, message);
    }

    fn locked_protocol_name(&self, connection: &Connection) -> Option<&'static str> {
        connection
            .preferred_protocol()
            .and_then(|index| self.protocols.get(index))
            .map(|protocol| protocol.name())
    }

    fn report(&self, connection: &Connection, kind: MessengerErrorKind) {
        connection.set_failed();

        if let MessengerErrorKind::Parse(error) = kind {
            PARSE_FAILED.with(|e| e.observe(1));
            event!(
                Level::WARN,
                message = "failed to parse input",
                connection = connection.id(),
                protocol = self.locked_protocol_name(connection),
                error = error.as_str()
            );
        } else {
            event!(
                Level::WARN,
                message = "input failed",
                connection = connection.id(),
                protocol = self.locked_protocol_name(connection),
                error = %kind
            );
        }
    }
}

/// Builds an [`InputMessenger`].
#[derive(Debug)]
pub struct InputMessengerBuilder {
    protocols: Vec<Arc<dyn Protocol>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    options: MessengerOptions,
    clock: Clock,
}

impl InputMessengerBuilder {
    /// Registers a protocol. Protocols are tried in registration order.
    #[must_use]
    pub fn protocol(self, protocol: impl Protocol + 'static) -> Self {
        self.shared_protocol(Arc::new(protocol))
    }

    /// Registers a protocol that is also used elsewhere, for example by a client that shares
    /// its call registry with the protocol.
    #[must_use]
    pub fn shared_protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocols.push(protocol);
        self
    }

    /// Replaces the default [`InlineDispatcher`].
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: impl Dispatcher + 'static) -> Self {
        self.dispatcher = Some(Arc::new(dispatcher));
        self
    }

    /// Replaces the default [`MessengerOptions`].
    #[must_use]
    pub const fn options(mut self, options: MessengerOptions) -> Self {
        self.options = options;
        self
    }

    /// Finishes the messenger.
    #[must_use]
    pub fn build(self) -> InputMessenger {
        InputMessenger {
            protocols: self.protocols,
            dispatcher: self.dispatcher.unwrap_or_else(|| Arc::new(InlineDispatcher)),
            options: self.options,
            clock: self.clock,
        }
    }
}

const MESSAGE_SIZE_BUCKETS: &[Magnitude] = &[16, 128, 1024, 8192, 65_536, 1_048_576];

thread_local! {
    static MESSAGE_PARSED_SIZE: Event = Event::builder()
        .name("cordpipe_message_parsed_size")
        .histogram(MESSAGE_SIZE_BUCKETS)
        .build();

    static PARSE_FAILED: Event = Event::builder()
        .name("cordpipe_parse_failed")
        .build();
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use cordbuf::testing::{FakeReader, FakeWriter};
    use cordbuf::{BlockPool, BlockPoolOptions};
    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(InputMessenger: Send, Sync);

    // Messages are a tag byte, a length byte and that many body bytes. A zero length is corrupt.
    #[derive(Debug)]
    struct TaggedProtocol {
        name: &'static str,
        tag: u8,
        seen: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl TaggedProtocol {
        fn new(name: &'static str, tag: u8) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let protocol = Self {
                name,
                tag,
                seen: Arc::clone(&seen),
            };
            (protocol, seen)
        }
    }

    impl Protocol for TaggedProtocol {
        fn name(&self) -> &'static str {
            self.name
        }

        fn parse(&self, source: &mut CordBuf, context: &ParseContext<'_>) -> crate::ParseResult<ParsedMessage> {
            let mut header = [0; 2];
            let Some(header) = source.fetch(&mut header) else {
                return match source.fetch1() {
                    Some(tag) if tag != self.tag => Err(ParseError::TryOthers),
                    _ => Err(ParseError::NotEnoughData),
                };
            };

            let (tag, len) = (header[0], usize::from(header[1]));

            if tag != self.tag {
                return Err(ParseError::TryOthers);
            }
            if len == 0 {
                return Err(ParseError::AbsolutelyWrong);
            }
            if len > context.max_body_size() {
                return Err(ParseError::TooBigData);
            }
            if source.len() < 2 + len {
                return Err(ParseError::NotEnoughData);
            }

            source.pop_front(2);
            let mut body = CordBuf::new();
            source.cutn(&mut body, len);
            Ok(ParsedMessage::new(body))
        }

        fn process(&self, message: InputMessage) {
            let body = message.into_payload::<CordBuf>().unwrap();
            self.seen.lock().unwrap().push(body.to_vec());
        }
    }

    fn connection() -> Connection {
        Connection::new(1, FakeWriter::new())
    }

    #[test]
    fn detects_and_locks_in_protocol() {
        let (first, first_seen) = TaggedProtocol::new("first", b'a');
        let (second, second_seen) = TaggedProtocol::new("second", b'b');
        let messenger = InputMessenger::builder(Clock::new_frozen())
            .protocol(first)
            .protocol(second)
            .build();

        let connection = connection();
        let mut source = CordBuf::from(&b"b\x02hib\x01!"[..]);

        assert_eq!(messenger.on_new_bytes(&connection, &mut source, false).unwrap(), 2);
        assert!(source.is_empty());
        assert_eq!(connection.preferred_protocol(), Some(1));
        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(*second_seen.lock().unwrap(), [b"hi".to_vec(), b"!".to_vec()]);

        // Once locked in, bytes of another protocol are an error.
        let mut source = CordBuf::from(&b"a\x01x"[..]);
        let error = messenger.on_new_bytes(&connection, &mut source, false).unwrap_err();
        assert_eq!(error.parse_error(), Some(ParseError::TryOthers));
        assert_eq!(error.protocol, Some("second"));
        assert!(connection.is_failed());
    }

    #[test]
    fn incomplete_message_waits_for_more_bytes() {
        let (protocol, seen) = TaggedProtocol::new("tagged", b't');
        let messenger = InputMessenger::builder(Clock::new_frozen()).protocol(protocol).build();
        let connection = connection();

        let mut source = CordBuf::from(&b"t\x03ab"[..]);
        assert_eq!(messenger.on_new_bytes(&connection, &mut source, false).unwrap(), 0);
        assert_eq!(source, &b"t\x03ab"[..]);

        source.append(b"c").unwrap();
        assert_eq!(messenger.on_new_bytes(&connection, &mut source, false).unwrap(), 1);
        assert_eq!(*seen.lock().unwrap(), [b"abc".to_vec()]);
        assert!(!connection.is_failed());
    }

    #[test]
    fn messages_before_failure_are_dispatched() {
        let (protocol, seen) = TaggedProtocol::new("tagged", b't');
        let messenger = InputMessenger::builder(Clock::new_frozen()).protocol(protocol).build();
        let connection = connection();

        let mut source = CordBuf::from(&b"t\x01at\x01bt\x00"[..]);
        let error = messenger.on_new_bytes(&connection, &mut source, false).unwrap_err();

        assert_eq!(error.parse_error(), Some(ParseError::AbsolutelyWrong));
        assert_eq!(*seen.lock().unwrap(), [b"a".to_vec(), b"b".to_vec()]);
        assert!(connection.is_failed());
    }

    #[test]
    fn body_limit_applies() {
        let (protocol, _seen) = TaggedProtocol::new("tagged", b't');
        let messenger = InputMessenger::builder(Clock::new_frozen())
            .protocol(protocol)
            .options(MessengerOptions::new().max_body_size(4))
            .build();

        let mut source = CordBuf::from(&b"t\x05hello"[..]);
        let error = messenger.on_new_bytes(&connection(), &mut source, false).unwrap_err();
        assert_eq!(error.parse_error(), Some(ParseError::TooBigData));
    }

    #[test]
    fn unknown_bytes_fail_detection() {
        let (protocol, _seen) = TaggedProtocol::new("tagged", b't');
        let messenger = InputMessenger::builder(Clock::new_frozen()).protocol(protocol).build();
        let connection = connection();

        let error = messenger
            .on_new_bytes(&connection, &mut CordBuf::from("zz"), false)
            .unwrap_err();

        assert_eq!(error.parse_error(), Some(ParseError::TryOthers));
        assert_eq!(error.protocol, None);
        assert_eq!(connection.preferred_protocol(), None);
    }

    #[test]
    fn eof_with_partial_message_is_truncation() {
        let (protocol, _seen) = TaggedProtocol::new("tagged", b't');
        let messenger = InputMessenger::builder(Clock::new_frozen()).protocol(protocol).build();

        let error = messenger
            .on_new_bytes(&connection(), &mut CordBuf::from(&b"t\x04ab"[..]), true)
            .unwrap_err();

        assert_eq!(error.kind, MessengerErrorKind::TruncatedMessage);
        assert_eq!(error.parse_error(), None);
    }

    #[test]
    fn reads_until_would_block() {
        let (protocol, seen) = TaggedProtocol::new("tagged", b't');
        let messenger = InputMessenger::builder(Clock::new_frozen()).protocol(protocol).build();
        let connection = connection();

        let pool = BlockPool::with_options(BlockPoolOptions::new().block_size(nz!(4)));
        let mut portal = IoPortal::new(pool);
        let mut reader = FakeReader::builder()
            .chunk(b"t\x02")
            .chunk(b"hit\x05wor")
            .would_block()
            .chunk(b"ld")
            .build();

        let summary = messenger.on_readable(&connection, &mut portal, &mut reader).unwrap();
        assert_eq!(
            summary,
            ReadSummary {
                bytes: 10,
                messages: 1,
                closed: false
            }
        );
        assert_eq!(portal.len(), 5);

        let summary = messenger.on_readable(&connection, &mut portal, &mut reader).unwrap();
        assert_eq!(summary.messages, 1);
        assert!(summary.closed);
        assert!(portal.is_empty());
        assert_eq!(*seen.lock().unwrap(), [b"hi".to_vec(), b"world".to_vec()]);
    }

    #[test]
    fn read_failure_is_reported() {
        let (protocol, _seen) = TaggedProtocol::new("tagged", b't');
        let messenger = InputMessenger::builder(Clock::new_frozen()).protocol(protocol).build();
        let connection = connection();

        let mut portal = IoPortal::new(BlockPool::new());
        let mut reader = FakeReader::builder().fail(io::ErrorKind::ConnectionReset).build();

        let error = messenger.on_readable(&connection, &mut portal, &mut reader).unwrap_err();
        assert_eq!(error.kind, MessengerErrorKind::Io(io::ErrorKind::ConnectionReset));
        assert!(connection.is_failed());
    }

    #[test]
    fn custom_dispatcher_receives_messages() {
        #[derive(Debug, Default)]
        struct Collecting {
            messages: Arc<Mutex<Vec<&'static str>>>,
        }

        impl Dispatcher for Collecting {
            fn dispatch(&self, protocol: Arc<dyn Protocol>, message: InputMessage) {
                self.messages.lock().unwrap().push(message.protocol());
                protocol.process(message);
            }
        }

        let dispatcher = Collecting::default();
        let messages = Arc::clone(&dispatcher.messages);
        let (protocol, seen) = TaggedProtocol::new("tagged", b't');
        let messenger = InputMessenger::builder(Clock::new_frozen())
            .protocol(protocol)
            .dispatcher(dispatcher)
            .build();

        messenger
            .on_new_bytes(&connection(), &mut CordBuf::from(&b"t\x01x"[..]), false)
            .unwrap();

        assert_eq!(*messages.lock().unwrap(), ["tagged"]);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(messenger.protocols().map(Protocol::name).collect::<Vec<_>>(), ["tagged"]);
    }
}
