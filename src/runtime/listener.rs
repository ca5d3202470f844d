//! The listening socket and its accept loop.
//!
//! Exactly one accept is outstanding at a time: the socket sits behind a
//! mutex, and whichever worker observes listener readiness drains the
//! backlog while holding it. Accept errors never stop the loop.

use crate::runtime::token::LISTENER;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Bound server endpoint.
pub struct Listener {
    socket: Mutex<TcpListener>,
    local_addr: SocketAddr,
    /// Set when accepting stopped early on an error; the next maintenance
    /// pass re-registers the socket so pending connections get retried.
    needs_rearm: AtomicBool,
    stopped: AtomicBool,
}

impl Listener {
    /// Bind a non-blocking listening socket.
    pub fn bind(addr: SocketAddr, backlog: u32) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog.min(i32::MAX as u32) as i32)?;

        let listener = TcpListener::from_std(socket.into());
        let local_addr = listener.local_addr()?;

        Ok(Self {
            socket: Mutex::new(listener),
            local_addr,
            needs_rearm: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// The bound address (with the real port when bound to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn lock(&self) -> MutexGuard<'_, TcpListener> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start delivering accept readiness to the shared poller.
    pub fn register(&self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut *self.lock(), LISTENER, Interest::READABLE)
    }

    /// Accept every pending connection, handing each to `on_accept`.
    pub fn accept_ready(&self, worker_id: usize, mut on_accept: impl FnMut(TcpStream, SocketAddr)) {
        let listener = self.lock();
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        loop {
            match listener.accept() {
                Ok((stream, peer)) => on_accept(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if is_connection_error(e) => {
                    debug!(worker = worker_id, error = %e, "Connection failed during accept");
                }
                Err(e) if is_resource_exhaustion(&e) => {
                    warn!(worker = worker_id, error = %e, "Accept deferred: out of resources");
                    self.needs_rearm.store(true, Ordering::Release);
                    break;
                }
                Err(e) => {
                    error!(worker = worker_id, error = %e, "Accept error");
                    self.needs_rearm.store(true, Ordering::Release);
                    break;
                }
            }
        }
    }

    /// Re-register the socket if accepting stopped on an error.
    pub fn rearm_if_needed(&self, registry: &Registry) {
        if !self.needs_rearm.swap(false, Ordering::AcqRel) || self.stopped.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = registry.reregister(&mut *self.lock(), LISTENER, Interest::READABLE) {
            warn!(error = %e, "Failed to re-arm listener");
            self.needs_rearm.store(true, Ordering::Release);
        }
    }

    /// Stop accepting. Idempotent.
    pub fn stop(&self, registry: &Registry) {
        let mut listener = self.lock();
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = registry.deregister(&mut *listener);
        info!(addr = %self.local_addr, "Listener stopped accepting");
    }

    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// The handshake failed on the peer's side; only that connection is lost.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

/// Transient exhaustion of descriptors or kernel memory.
fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}
