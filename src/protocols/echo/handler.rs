//! Echo request handler.

use crate::protocols::http::{error_response, response};
use crate::runtime::protocol::{Reply, RequestHandler};

/// Echoes each request back as the response body.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl RequestHandler for Echo {
    fn handle(&self, request: &[u8]) -> Reply {
        if request.trim_ascii().eq_ignore_ascii_case(b"QUIT") {
            return Reply::Close;
        }
        if request.is_empty() {
            return Reply::Respond(error_response(400, "Bad Request"));
        }
        Reply::Respond(response(200, "OK", "text/plain", request))
    }
}
