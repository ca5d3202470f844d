//! Custom runtime for readiness-based networking.
//!
//! One `mio::Poll` (epoll on Linux, kqueue on macOS) is shared by a fixed
//! pool of worker threads; any worker may drive any connection.
//!
//! - `Listener`: the bound socket and its accept loop
//! - `Connection`: per-socket state machine, always behind an `Arc`
//! - `EventLoopPool`: the workers and the shared poller
//! - `RequestHandler`: the hook that turns request bytes into a response

mod buffer;
pub mod connection;
mod event_loop;
mod listener;
pub mod protocol;
pub mod stats;
mod token;

pub use event_loop::{EventLoopPool, LoopSettings, ShutdownHandle};
pub use listener::Listener;
pub use protocol::RequestHandler;
pub use stats::ServerStats;
