//! Echo handler.
//!
//! Sends the received bytes back as the body of a `text/plain` response.
//! Useful for checking that request bytes reach the handler intact and for
//! pushing responses of arbitrary size through the write path.
//!
//! ```text
//! Request:  hello
//! Response: HTTP/1.1 200 OK ... Content-Length: 5 ... \r\n\r\nhello
//! ```
//!
//! Special commands (line-based):
//! - `QUIT\r\n` - Close the connection without a response

pub mod handler;

pub use handler::Echo;
