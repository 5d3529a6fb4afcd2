// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use cordbuf::CordBuf;
use parking_lot::Mutex;
use tracing::{Level, event};

use crate::{
    CallContext, CallError, CallId, CallRegistry, InputMessage, ParseContext, ParseError, ParseResult, ParsedMessage, PipelinedInfo,
    Protocol, RequestSerializer, SerializeError, process_response,
};

const DELIMITER: &[u8] = b"\r\n";

/// A batch of command lines sent as one call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineRequest {
    commands: Vec<String>,
    auth: Option<String>,
}

impl LineRequest {
    /// A request made of `commands`, answered by one reply each.
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
            auth: None,
        }
    }

    /// Prefixes the commands with `AUTH token`.
    #[must_use]
    pub fn with_auth(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(token.into());
        self
    }
}

/// Writes a [`LineRequest`] as `\r\n`-terminated lines.
#[derive(Clone, Copy, Debug, Default)]
pub struct LineRequestSerializer;

impl RequestSerializer<LineRequest> for LineRequestSerializer {
    fn serialize(&self, out: &mut CordBuf, call: &mut CallContext, request: &LineRequest) -> Result<(), SerializeError> {
        if request.commands.is_empty() {
            return Err(SerializeError::InvalidRequest("request has no commands".to_owned()));
        }

        let lines = request.auth.iter().chain(&request.commands);

        if lines.clone().any(|line| line.contains(['\r', '\n'])) {
            return Err(SerializeError::InvalidRequest("commands must be single lines".to_owned()));
        }

        if let Some(token) = &request.auth {
            out.append(b"AUTH ")?;
            out.append(token.as_bytes())?;
            out.append(DELIMITER)?;
            call.set_with_auth(true);
        }

        for command in &request.commands {
            out.append(command.as_bytes())?;
            out.append(DELIMITER)?;
        }

        let count = u32::try_from(request.commands.len())
            .map_err(|_overflow| SerializeError::InvalidRequest("too many commands".to_owned()))?;
        call.set_pipelined_count(count);

        Ok(())
    }
}

type Reply = Result<String, String>;

// What a client connection has decoded of the response at the front of its queue.
#[derive(Debug, Default)]
struct ClientParseState {
    replies: Vec<Reply>,
    auth_done: bool,
    deferred: Option<ParseError>,
}

#[derive(Debug)]
struct LineResponse {
    id: CallId,
    replies: Vec<Reply>,
}

/// The client half: decodes replies and completes the calls waiting for them.
///
/// Calls are issued with [`issue_call()`][crate::issue_call] and [`LineRequestSerializer`]
/// against the same registry.
#[derive(Debug)]
pub struct LineClientProtocol {
    registry: CallRegistry<Vec<String>>,
}

impl LineClientProtocol {
    /// Creates a client protocol that completes calls tracked by `registry`.
    #[must_use]
    pub fn new(registry: CallRegistry<Vec<String>>) -> Self {
        Self { registry }
    }

    /// The registry the protocol completes calls in.
    #[must_use]
    pub fn registry(&self) -> &CallRegistry<Vec<String>> {
        &self.registry
    }

    fn collect_replies(
        source: &mut CordBuf,
        context: &ParseContext<'_>,
        state: &mut ClientParseState,
        info: PipelinedInfo,
    ) -> ParseResult<ParsedMessage> {
        loop {
            let line = match cut_line(source, context.max_body_size()) {
                Ok(Some(line)) => line,
                Ok(None) => return Err(ParseError::NotEnoughData),
                // The replies decoded so far still reach their call, which sees how many are
                // missing.
                Err(error) if !state.replies.is_empty() => {
                    state.deferred = Some(error);
                    return Ok(Self::emit(info, state));
                }
                Err(error) => return Err(error),
            };

            let reply = decode_reply(&line)?;

            if info.with_auth && !state.auth_done {
                if reply.is_err() {
                    return Err(ParseError::NoResource);
                }

                state.auth_done = true;
                context.connection().set_authenticated(true);
                continue;
            }

            state.replies.push(reply);

            if state.replies.len() >= info.count as usize {
                return Ok(Self::emit(info, state));
            }
        }
    }

    fn emit(info: PipelinedInfo, state: &mut ClientParseState) -> ParsedMessage {
        state.auth_done = false;

        ParsedMessage::new(LineResponse {
            id: info.id_wait,
            replies: std::mem::take(&mut state.replies),
        })
    }
}

impl Protocol for LineClientProtocol {
    fn name(&self) -> &'static str {
        "line-client"
    }

    fn parse(&self, source: &mut CordBuf, context: &ParseContext<'_>) -> ParseResult<ParsedMessage> {
        let connection = context.connection();

        connection.with_parsing_context(|state: &mut ClientParseState| {
            if let Some(error) = state.deferred.take() {
                return Err(error);
            }

            let Some(info) = connection.pop_pipelined_info() else {
                event!(
                    Level::DEBUG,
                    message = "reply arrived with no request outstanding",
                    connection = connection.id()
                );
                return Err(ParseError::TryOthers);
            };

            // Replies already decoded stay in the state; a failed or incomplete response keeps
            // its entry at the front of the queue.
            let result = Self::collect_replies(source, context, state, info);

            if result.is_err() {
                connection.giveback_pipelined_info(info);
            }

            result
        })
    }

    fn process(&self, message: InputMessage) {
        let response = match message.into_payload::<LineResponse>() {
            Ok(response) => response,
            Err(message) => {
                event!(Level::WARN, message = "unexpected payload", protocol = message.protocol());
                return;
            }
        };

        let count = u32::try_from(response.replies.len()).unwrap_or(u32::MAX);
        let result = response
            .replies
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(CallError::Protocol);

        process_response(&self.registry, response.id, count, result);
    }
}

type Handler = dyn Fn(&str) -> Result<String, String> + Send + Sync;

/// The server half: answers every command line with the reply of a handler function.
///
/// All replies to the commands cut in one parse step go out in a single write, before the
/// parse step returns.
pub struct LineServerProtocol {
    handler: Box<Handler>,
    handled: Arc<Mutex<Vec<String>>>,
}

impl LineServerProtocol {
    /// Creates a server that answers a command with `+value` if `handler` returns `Ok(value)`
    /// and with `-error` otherwise.
    pub fn new(handler: impl Fn(&str) -> Result<String, String> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            handled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A shared log of every command processed so far, in order.
    #[must_use]
    pub fn handled(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.handled)
    }
}

impl fmt::Debug for LineServerProtocol {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineServerProtocol")
            .field("handled", &self.handled.lock().len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct LineCommands(Vec<String>);

impl Protocol for LineServerProtocol {
    fn name(&self) -> &'static str {
        "line-server"
    }

    fn parse(&self, source: &mut CordBuf, context: &ParseContext<'_>) -> ParseResult<ParsedMessage> {
        match source.fetch1() {
            None => return Err(ParseError::NotEnoughData),
            Some(first) if !first.is_ascii_alphabetic() => return Err(ParseError::TryOthers),
            Some(_) => {}
        }

        let mut commands = Vec::new();

        while let Some(command) = cut_line(source, context.max_body_size())? {
            commands.push(command);
        }

        if commands.is_empty() {
            return Err(ParseError::NotEnoughData);
        }

        let mut replies = CordBuf::new();

        for command in &commands {
            let reply = match (self.handler)(command) {
                Ok(value) => format!("+{value}\r\n"),
                Err(error) => format!("-{error}\r\n"),
            };

            replies.append(reply.as_bytes()).map_err(|_alloc_error| ParseError::NoResource)?;
        }

        if let Err(error) = context.connection().write(&mut replies) {
            event!(
                Level::WARN,
                message = "failed to send replies",
                connection = context.connection().id(),
                error = %error
            );
        }

        Ok(ParsedMessage::new(LineCommands(commands)))
    }

    fn process(&self, message: InputMessage) {
        if let Ok(LineCommands(commands)) = message.into_payload::<LineCommands>() {
            self.handled.lock().extend(commands);
        }
    }
}

// Cuts one complete line. Lines longer than `max` are rejected even before their end arrives.
fn cut_line(source: &mut CordBuf, max: usize) -> ParseResult<Option<String>> {
    let Some(position) = source.find(DELIMITER) else {
        return if source.len() > max.saturating_add(DELIMITER.len()) {
            Err(ParseError::TooBigData)
        } else {
            Ok(None)
        };
    };

    if position > max {
        return Err(ParseError::TooBigData);
    }

    let mut line = CordBuf::new();
    source.cutn(&mut line, position);
    source.pop_front(DELIMITER.len());

    String::from_utf8(line.to_vec())
        .map(Some)
        .map_err(|_invalid| ParseError::AbsolutelyWrong)
}

fn decode_reply(line: &str) -> ParseResult<Reply> {
    if let Some(value) = line.strip_prefix('+') {
        Ok(Ok(value.to_owned()))
    } else if let Some(error) = line.strip_prefix('-') {
        Ok(Err(error.to_owned()))
    } else {
        Err(ParseError::AbsolutelyWrong)
    }
}
