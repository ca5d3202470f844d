//! Server-wide counters.
//!
//! Updated with relaxed atomics from whichever worker happens to run the
//! continuation; read as a point-in-time `StatsSnapshot`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Zero-length read: the peer closed its side.
    PeerClosed,
    /// Read, write or registration error.
    Error,
    /// The request handler asked for the connection to be closed.
    HandlerClosed,
    /// The request handler panicked.
    HandlerPanicked,
    /// No activity within the idle timeout.
    IdleTimeout,
    /// Closed after its last response because the server is draining.
    Drained,
    /// Force-closed when the server stopped.
    Shutdown,
}

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ServerStats {
    connections_accepted: AtomicU64,
    connections_closed: AtomicU64,
    connections_rejected: AtomicU64,
    idle_timeouts: AtomicU64,
    handler_failures: AtomicU64,
    requests_served: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

/// Point-in-time copy of `ServerStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub idle_timeouts: u64,
    pub handler_failures: u64,
    pub requests_served: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl StatsSnapshot {
    /// Connections accepted and not yet closed.
    pub fn active_connections(&self) -> u64 {
        self.connections_accepted
            .saturating_sub(self.connections_closed)
    }
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self, reason: CloseReason) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        match reason {
            CloseReason::IdleTimeout => {
                self.idle_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            CloseReason::HandlerPanicked => {
                self.handler_failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn request_served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            idle_timeouts: self.idle_timeouts.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counting() {
        let stats = ServerStats::new();
        stats.connection_accepted();
        stats.connection_accepted();
        stats.request_served();
        stats.bytes_read(18);
        stats.bytes_written(130);
        stats.connection_closed(CloseReason::IdleTimeout);

        let snap = stats.snapshot();
        assert_eq!(snap.connections_accepted, 2);
        assert_eq!(snap.connections_closed, 1);
        assert_eq!(snap.active_connections(), 1);
        assert_eq!(snap.idle_timeouts, 1);
        assert_eq!(snap.requests_served, 1);
        assert_eq!(snap.bytes_read, 18);
        assert_eq!(snap.bytes_written, 130);
    }

    #[test]
    fn test_handler_panics_counted_as_failures() {
        let stats = ServerStats::new();
        stats.connection_accepted();
        stats.connection_closed(CloseReason::HandlerPanicked);
        stats.connection_closed(CloseReason::PeerClosed);

        let snap = stats.snapshot();
        assert_eq!(snap.handler_failures, 1);
        assert_eq!(snap.idle_timeouts, 0);
        assert_eq!(snap.active_connections(), 0);
    }
}
