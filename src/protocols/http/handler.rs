//! Static page handler.

use super::response::response;
use crate::runtime::protocol::{Reply, RequestHandler};
use bytes::Bytes;

/// The page served for every request.
pub const STATIC_BODY: &str = "<html><body><h1>Hello from Async C++ Server!</h1></body></html>";

/// Answers every request with the same prebuilt page.
///
/// The response is framed once; each request gets a cheap clone of it.
#[derive(Debug, Clone)]
pub struct StaticPage {
    response: Bytes,
}

impl StaticPage {
    pub fn new() -> Self {
        Self {
            response: response(200, "OK", "text/html", STATIC_BODY.as_bytes()),
        }
    }
}

impl Default for StaticPage {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestHandler for StaticPage {
    fn handle(&self, _request: &[u8]) -> Reply {
        Reply::Respond(self.response.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPECTED: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/html\r\n\
Content-Length: 63\r\n\
Connection: keep-alive\r\n\
\r\n\
<html><body><h1>Hello from Async C++ Server!</h1></body></html>";

    #[test]
    fn test_body_length() {
        assert_eq!(STATIC_BODY.len(), 63);
    }

    #[test]
    fn test_same_page_for_any_request() {
        let page = StaticPage::new();
        for request in [&b"GET / HTTP/1.1\r\n\r\n"[..], &b"garbage"[..], &b"\x00\xff"[..]] {
            assert_eq!(
                page.handle(request),
                Reply::Respond(Bytes::from_static(EXPECTED))
            );
        }
    }
}
