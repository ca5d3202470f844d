//! Request handlers.
//!
//! The runtime only knows the `RequestHandler` hook; everything about the
//! bytes on the wire lives here.
//!
//! - `http`: minimal HTTP/1.1 response framing and the static page handler
//! - `echo`: echoes the request back as a `text/plain` body

pub mod echo;
pub mod http;

use crate::config::HandlerType;
use crate::runtime::protocol::RequestHandler;
use std::sync::Arc;

/// Build the handler selected in configuration.
pub fn handler_for(handler: HandlerType) -> Arc<dyn RequestHandler> {
    match handler {
        HandlerType::Static => Arc::new(http::StaticPage::new()),
        HandlerType::Echo => Arc::new(echo::Echo),
    }
}
