// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A minimal line-framed request/reply protocol for exercising the pipeline end to end.
//!
//! Requests are one or more command lines, optionally preceded by an `AUTH` line. The server
//! answers every line with `+value` or `-error`, in order, and the client matches the replies
//! to calls purely by their position on the connection.

mod line;

pub use line::*;
