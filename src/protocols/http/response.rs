//! Response framing.

use bytes::{BufMut, Bytes, BytesMut};

/// Frame a complete response with a `Content-Length` matching `body`.
pub fn response(status: u16, reason: &str, content_type: &str, body: &[u8]) -> Bytes {
    let length = body.len().to_string();
    let mut buf = BytesMut::with_capacity(128 + body.len());

    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.to_string().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(reason.as_bytes());
    buf.put_slice(b"\r\nContent-Type: ");
    buf.put_slice(content_type.as_bytes());
    buf.put_slice(b"\r\nContent-Length: ");
    buf.put_slice(length.as_bytes());
    buf.put_slice(b"\r\nConnection: keep-alive\r\n\r\n");
    buf.put_slice(body);

    buf.freeze()
}

/// Plain-text error response, e.g. `400 Bad Request`.
pub fn error_response(status: u16, reason: &str) -> Bytes {
    let body = format!("{status} {reason}\n");
    response(status, reason, "text/plain", body.as_bytes())
}
