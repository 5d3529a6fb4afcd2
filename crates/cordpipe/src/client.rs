// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use cordbuf::CordBuf;
use tracing::{Level, event};

use crate::{CallContext, CallError, CallHandle, CallRegistry, Connection, PipelinedInfo, RequestSerializer};

/// Sends `request` on `connection` as a new call tracked by `registry`.
///
/// The request is serialized first, so a request that cannot be serialized never registers a
/// call or touches the connection. The call's [`PipelinedInfo`] is queued together with the
/// write, so the response can be matched to the call by position even on protocols without
/// correlation identifiers.
///
/// # Errors
///
/// Fails with [`CallError::InvalidRequest`] if serialization fails, or with
/// [`CallError::ConnectionBroken`] if the request could not be written. In the latter case the
/// call is registered and failed, so nothing is left pending.
pub fn issue_call<R, Req>(
    registry: &CallRegistry<R>,
    connection: &Connection,
    serializer: &impl RequestSerializer<Req>,
    request: &Req,
) -> Result<CallHandle<R>, CallError>
where
    Req: ?Sized,
{
    let mut call = CallContext::new();
    let mut wire = CordBuf::new();
    serializer.serialize(&mut wire, &mut call, request)?;

    let (id, handle) = registry.register(call.pipelined_count());

    let mut info = PipelinedInfo::new(id, call.pipelined_count());
    if call.with_auth() {
        info = info.with_auth();
    }

    if let Err(error) = connection.write_request(&mut wire, info) {
        event!(
            Level::DEBUG,
            message = "request could not be sent",
            call = %id,
            connection = connection.id(),
            error = %error
        );
        registry.fail(id, CallError::ConnectionBroken);
        return Err(CallError::ConnectionBroken);
    }

    Ok(handle)
}

/// Fails every call still waiting on `connection` with [`CallError::ConnectionBroken`] and
/// marks the connection as failed. Returns how many calls were failed.
pub fn abandon_calls<R>(registry: &CallRegistry<R>, connection: &Connection) -> usize {
    connection
        .abandon()
        .into_iter()
        .filter(|info| registry.fail(info.id_wait, CallError::ConnectionBroken))
        .count()
}
