//! Request handler hook for the runtime.
//!
//! The runtime is parsing-agnostic: after a read completes it hands the
//! received bytes to a `RequestHandler` and writes back whatever the handler
//! returns. Handlers run inline on a worker thread while the connection is
//! in its Processing state, so they must not block.

use bytes::Bytes;
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

/// Result of processing one received buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Write these bytes back, then wait for the next request.
    Respond(Bytes),
    /// No response can be produced; close the connection.
    Close,
}

/// Turns received bytes into a response.
///
/// Implementations must tolerate partial or malformed input: a request that
/// cannot be understood should get an error response, not a panic. `Close` is
/// reserved for the case where no response at all can be framed.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &[u8]) -> Reply;
}

impl<F> RequestHandler for F
where
    F: Fn(&[u8]) -> Reply + Send + Sync,
{
    fn handle(&self, request: &[u8]) -> Reply {
        self(request)
    }
}

/// Outcome of invoking a handler at the runtime boundary.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessResult {
    Reply(Reply),
    /// The handler panicked; only its connection is affected.
    Panicked,
}

/// Invoke `handler`, containing any panic to the calling connection.
pub fn process(handler: &dyn RequestHandler, request: &[u8]) -> ProcessResult {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
        Ok(reply) => ProcessResult::Reply(reply),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            error!(panic = message, request_len = request.len(), "Request handler panicked");
            ProcessResult::Panicked
        }
    }
}
