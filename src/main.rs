//! loopshare: a multi-threaded TCP server core
//!
//! A fixed pool of worker threads shares one readiness queue; any idle
//! worker drives whichever connection becomes ready next.
//!
//! Features:
//! - Keep-alive request/response cycles per connection
//! - Pluggable request handlers (static page, echo)
//! - Idle connection timeouts
//! - Graceful shutdown on Ctrl-C / SIGTERM
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod runtime;
mod server;

use config::Config;
use server::Server;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        workers = config.worker_count(),
        handler = ?config.handler,
        buffer_size = config.buffer_size,
        max_connections = config.max_connections,
        "Starting loopshare server"
    );

    let handler = protocols::handler_for(config.handler);
    let server = match Server::bind(&config, handler) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start server");
            return Err(e.into());
        }
    };

    let shutdown = server.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || shutdown.shutdown()) {
        warn!(error = %e, "Failed to install signal handler");
    }

    let stats = server.stats();
    server.run()?;

    let snap = stats.snapshot();
    info!(
        accepted = snap.connections_accepted,
        active = snap.active_connections(),
        rejected = snap.connections_rejected,
        requests = snap.requests_served,
        bytes_read = snap.bytes_read,
        bytes_written = snap.bytes_written,
        "Server stopped"
    );
    Ok(())
}
