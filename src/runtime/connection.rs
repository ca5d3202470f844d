//! Connection state machine for managing TCP connections.
//!
//! ```text
//! Idle ──start──> Reading ──bytes──> Processing ──reply──> Writing
//!                    ^                    │                   │
//!                    └────── written ─────┼───────────────────┘
//!                                         │
//!  any error / EOF / handler close ───────┴──────────────> Closed
//! ```
//!
//! ## Ownership
//!
//! A connection is only ever handled through `Arc<Connection>`. The
//! connection table holds one reference; a worker running a continuation
//! clones it out of the table first, so the connection outlives the
//! continuation even if another worker removes it from the table meanwhile.
//! Removal from the table plus the `Closed` state act as the tombstone:
//! late events find nothing to drive, and a continuation that still holds a
//! clone sees `Closed` and issues nothing.
//!
//! ## Exclusivity
//!
//! All mutable state sits behind one mutex per connection. Only one
//! operation (a read or a write) is ever outstanding, and the next one is
//! issued from inside the continuation of the previous one, while that lock
//! is held.

use crate::runtime::buffer::{ReadBuffer, WriteBuffer};
use crate::runtime::protocol::{self, ProcessResult, Reply, RequestHandler};
use crate::runtime::stats::{CloseReason, ServerStats};
use crate::runtime::token::{next_generation, ConnToken, OpType, MAX_INDEX};
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Interest, Registry};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Constructed, not yet started.
    Idle,
    /// A read is outstanding.
    Reading,
    /// The handler is running on the received bytes.
    Processing,
    /// A write of the current response is outstanding.
    Writing,
    /// Terminal. No operation will be issued again.
    Closed,
}

/// Readiness flags copied out of a poller event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub write_closed: bool,
    pub error: bool,
}

impl Readiness {
    fn wants_read(&self) -> bool {
        self.readable || self.read_closed || self.error
    }

    fn wants_write(&self) -> bool {
        self.writable || self.write_closed || self.error
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// What the scheduler should do after a continuation ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The next operation is issued (or the current one is still pending).
    Continue,
    /// Remove the connection from the table and close it.
    Close(CloseReason),
}

/// Everything a continuation needs besides the connection itself.
pub struct Driver<'a> {
    pub registry: &'a Registry,
    pub handler: &'a dyn RequestHandler,
    pub stats: &'a ServerStats,
    /// Close after the current response instead of re-arming the read.
    pub draining: bool,
}

/// A single client connection.
pub struct Connection {
    token: ConnToken,
    peer: SocketAddr,
    inner: Mutex<Inner>,
}

struct Inner {
    stream: TcpStream,
    state: ConnState,
    /// The single outstanding operation, if any.
    pending: Option<OpType>,
    read_buf: ReadBuffer,
    write_buf: WriteBuffer,
    /// Peer sent EOF after a request; close once its response is written.
    peer_eof: bool,
    last_active: Instant,
    requests: u64,
}

impl Connection {
    /// Create a connection in the `Idle` state.
    ///
    /// The only way to construct one: a connection always lives behind an
    /// `Arc` so in-flight continuations can keep it alive.
    pub fn create(
        stream: TcpStream,
        peer: SocketAddr,
        token: ConnToken,
        buffer_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            token,
            peer,
            inner: Mutex::new(Inner {
                stream,
                state: ConnState::Idle,
                pending: None,
                read_buf: ReadBuffer::with_capacity(buffer_size),
                write_buf: WriteBuffer::new(),
                peer_eof: false,
                last_active: Instant::now(),
                requests: 0,
            }),
        })
    }

    pub fn token(&self) -> ConnToken {
        self.token
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.lock().state
    }

    /// The operation currently outstanding, if any.
    #[cfg(test)]
    pub fn outstanding(&self) -> Option<OpType> {
        self.lock().pending
    }

    /// Completed request/response cycles.
    #[cfg(test)]
    pub fn requests(&self) -> u64 {
        self.lock().requests
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Handler panics are caught before they can unwind through the lock.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idle -> Reading: issue the first read.
    pub fn start(&self, registry: &Registry) -> io::Result<()> {
        let mut inner = self.lock();
        if inner.state != ConnState::Idle {
            return Ok(());
        }
        inner.last_active = Instant::now();
        inner.issue(registry, self.token, OpType::Read, false)?;
        inner.state = ConnState::Reading;
        trace!(conn = %self.token, peer = %self.peer, "Connection started");
        Ok(())
    }

    /// Run the continuation for a readiness event.
    pub fn on_ready(&self, ready: Readiness, driver: &Driver<'_>) -> Step {
        let mut inner = self.lock();
        match inner.state {
            ConnState::Reading if ready.wants_read() => inner.on_readable(self.token, driver),
            ConnState::Writing if ready.wants_write() => inner.on_writable(self.token, driver),
            // Closed is a tombstone; Idle has nothing registered yet.
            _ => Step::Continue,
        }
    }

    /// Transition to `Closed`, deregistering the socket and shutting it down.
    ///
    /// Returns `false` if the connection was already closed.
    pub fn close(&self, registry: &Registry, reason: CloseReason) -> bool {
        let mut inner = self.lock();
        self.close_locked(&mut inner, registry, reason)
    }

    /// Close the connection if it saw no activity for `timeout`.
    ///
    /// Never waits: a connection whose lock is held is being driven right
    /// now and is by definition not idle.
    pub fn close_if_idle(&self, registry: &Registry, timeout: Duration, now: Instant) -> bool {
        let Ok(mut inner) = self.inner.try_lock() else {
            return false;
        };
        let waiting = matches!(inner.state, ConnState::Reading | ConnState::Writing);
        if waiting && now.saturating_duration_since(inner.last_active) >= timeout {
            return self.close_locked(&mut inner, registry, CloseReason::IdleTimeout);
        }
        false
    }

    /// Close the connection if it is between requests (a read outstanding,
    /// nothing received). Used when the server starts draining.
    ///
    /// A request already queued in the socket counts as in flight: the
    /// connection stays open so its pending readiness event gets a response.
    pub fn close_if_quiescent(&self, registry: &Registry) -> bool {
        let mut inner = self.lock();
        if inner.state != ConnState::Reading || !inner.read_buf.is_empty() {
            return false;
        }
        if inner.has_pending_input() {
            trace!(conn = %self.token, "Request pending, left to finish");
            return false;
        }
        self.close_locked(&mut inner, registry, CloseReason::Drained)
    }

    fn close_locked(&self, inner: &mut Inner, registry: &Registry, reason: CloseReason) -> bool {
        if inner.state == ConnState::Closed {
            return false;
        }
        if inner.state != ConnState::Idle {
            let _ = registry.deregister(&mut inner.stream);
        }
        let _ = inner.stream.shutdown(Shutdown::Both);
        inner.state = ConnState::Closed;
        inner.pending = None;
        inner.read_buf.clear();
        inner.write_buf.clear();
        debug!(
            conn = %self.token,
            peer = %self.peer,
            requests = inner.requests,
            reason = ?reason,
            "Connection closed"
        );
        true
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Request bytes are waiting in the socket. EOF and errors count as
    /// nothing to answer.
    fn has_pending_input(&self) -> bool {
        let mut peeked = [0u8; 1];
        loop {
            match self.stream.peek(&mut peeked) {
                Ok(n) => return n > 0,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }

    /// Issue `op`: point the socket's interest at it.
    fn issue(
        &mut self,
        registry: &Registry,
        token: ConnToken,
        op: OpType,
        registered: bool,
    ) -> io::Result<()> {
        debug_assert!(self.pending.is_none(), "second operation issued while one is pending");
        let interest = match op {
            OpType::Read => Interest::READABLE,
            OpType::Write => Interest::WRITABLE,
        };
        if registered {
            registry.reregister(&mut self.stream, token.to_token(), interest)?;
        } else {
            registry.register(&mut self.stream, token.to_token(), interest)?;
        }
        self.pending = Some(op);
        Ok(())
    }

    /// Read completion: drain the socket, then process what arrived.
    fn on_readable(&mut self, token: ConnToken, driver: &Driver<'_>) -> Step {
        let mut eof = false;
        while !self.read_buf.is_full() {
            match self.stream.read(self.read_buf.spare_mut()) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    self.read_buf.advance(n);
                    driver.stats.bytes_read(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn = %token, error = %e, "Read failed");
                    return Step::Close(CloseReason::Error);
                }
            }
        }

        if self.read_buf.is_empty() {
            return if eof {
                Step::Close(CloseReason::PeerClosed)
            } else {
                // Spurious wakeup; the read stays outstanding.
                Step::Continue
            };
        }

        trace!(conn = %token, bytes = self.read_buf.len(), "Read complete");
        self.pending = None;
        self.peer_eof = eof;
        self.last_active = Instant::now();
        self.state = ConnState::Processing;

        let result = protocol::process(driver.handler, self.read_buf.filled());
        self.read_buf.clear();

        let response = match result {
            ProcessResult::Reply(Reply::Respond(response)) => response,
            ProcessResult::Reply(Reply::Close) => return Step::Close(CloseReason::HandlerClosed),
            ProcessResult::Panicked => return Step::Close(CloseReason::HandlerPanicked),
        };

        self.write_buf.load(response);
        if let Err(e) = self.issue(driver.registry, token, OpType::Write, true) {
            debug!(conn = %token, error = %e, "Failed to arm write");
            return Step::Close(CloseReason::Error);
        }
        self.state = ConnState::Writing;
        Step::Continue
    }

    /// Write completion: push out as much of the response as the socket
    /// takes; once it is all out, re-arm the read (keep-alive).
    fn on_writable(&mut self, token: ConnToken, driver: &Driver<'_>) -> Step {
        while !self.write_buf.is_done() {
            match self.stream.write(self.write_buf.remaining()) {
                Ok(0) => {
                    debug!(conn = %token, "Write returned 0");
                    return Step::Close(CloseReason::Error);
                }
                Ok(n) => {
                    self.write_buf.consume(n);
                    self.last_active = Instant::now();
                    driver.stats.bytes_written(n);
                }
                // Partial write; the write stays outstanding.
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Continue,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn = %token, error = %e, "Write failed");
                    return Step::Close(CloseReason::Error);
                }
            }
        }

        trace!(conn = %token, bytes = self.write_buf.total(), "Write complete");
        self.pending = None;
        self.write_buf.clear();
        self.requests += 1;
        driver.stats.request_served();

        if self.peer_eof {
            return Step::Close(CloseReason::PeerClosed);
        }
        if driver.draining {
            return Step::Close(CloseReason::Drained);
        }

        if let Err(e) = self.issue(driver.registry, token, OpType::Read, true) {
            debug!(conn = %token, error = %e, "Failed to re-arm read");
            return Step::Close(CloseReason::Error);
        }
        self.state = ConnState::Reading;
        Step::Continue
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. Lookups are by
/// generation-tagged token, so a token from a removed connection never
/// resolves to the connection that later reuses its slot.
pub struct ConnectionRegistry {
    connections: Slab<Entry>,
    max_connections: usize,
    generation: usize,
}

struct Entry {
    generation: usize,
    conn: Arc<Connection>,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        let max_connections = max_connections.min(MAX_INDEX + 1);
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
            generation: 0,
        }
    }

    /// Insert the connection built by `make` for the next free token.
    ///
    /// Returns `None` (without calling `make`) if the registry is at capacity.
    pub fn insert_with(
        &mut self,
        make: impl FnOnce(ConnToken) -> Arc<Connection>,
    ) -> Option<Arc<Connection>> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        self.generation = next_generation(self.generation);
        let entry = self.connections.vacant_entry();
        let token = ConnToken::new(entry.key(), self.generation);
        let conn = make(token);
        entry.insert(Entry {
            generation: token.generation(),
            conn: Arc::clone(&conn),
        });
        Some(conn)
    }

    /// Clone out the connection for `token`, if it is still registered.
    pub fn get(&self, token: ConnToken) -> Option<Arc<Connection>> {
        self.connections
            .get(token.index())
            .filter(|entry| entry.generation == token.generation())
            .map(|entry| Arc::clone(&entry.conn))
    }

    /// Remove the connection for `token`.
    pub fn remove(&mut self, token: ConnToken) -> Option<Arc<Connection>> {
        match self.connections.get(token.index()) {
            Some(entry) if entry.generation == token.generation() => {
                Some(self.connections.remove(token.index()).conn)
            }
            _ => None,
        }
    }

    /// Remove every connection.
    pub fn drain(&mut self) -> Vec<Arc<Connection>> {
        self.connections.drain().map(|entry| entry.conn).collect()
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Iterate over all connections.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.connections.iter().map(|(_, entry)| &entry.conn)
    }
}
