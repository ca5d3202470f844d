//! Minimal HTTP/1.1 responses.
//!
//! Requests are not parsed: whatever arrives is treated as one complete
//! request. Every response is framed with `Content-Length` and
//! `Connection: keep-alive`, so the client can find its end and reuse the
//! connection.
//!
//! ## Response Format
//!
//! ```text
//! HTTP/1.1 200 OK\r\n
//! Content-Type: text/html\r\n
//! Content-Length: 63\r\n
//! Connection: keep-alive\r\n
//! \r\n
//! <html><body><h1>Hello from Async C++ Server!</h1></body></html>
//! ```

pub mod handler;
pub mod response;

pub use handler::StaticPage;
pub use response::{error_response, response};
