//! Shared-queue event loop.
//!
//! Readiness-based model: one `mio::Poll` (epoll on Linux, kqueue on macOS)
//! is shared by every worker. Workers take turns waiting on it: the worker
//! holding the poller waits for events, copies the ready set out, hands the
//! poller to the next idle worker and then runs the continuations it
//! collected. Any worker may run any connection's continuation, so a slow
//! handler on one connection never holds up events for the others.
//!
//! Besides continuations, workers take turns running a maintenance pass:
//! idle-deadline sweeps, listener re-arming after accept errors, and
//! shutdown drain progress.

use crate::runtime::connection::{Connection, ConnectionRegistry, Driver, Readiness, Step};
use crate::runtime::listener::Listener;
use crate::runtime::protocol::RequestHandler;
use crate::runtime::stats::{CloseReason, ServerStats};
use crate::runtime::token::{ConnToken, LISTENER, WAKER};
use mio::net::TcpStream;
use mio::{Events, Poll, Registry, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Maximum events taken from the poller per turn.
const EVENTS_CAPACITY: usize = 1024;

/// Upper bound on one wait, so maintenance runs even when no I/O happens.
const POLL_TICK: Duration = Duration::from_millis(100);

/// Longest interval between idle sweeps.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const STOPPED: u8 = 2;

/// Tunables for the pool, resolved from configuration.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Read buffer capacity of each connection.
    pub buffer_size: usize,
    pub max_connections: usize,
    /// `None` disables the idle deadline.
    pub idle_timeout: Option<Duration>,
    /// How long draining waits for in-flight connections.
    pub shutdown_timeout: Duration,
}

/// The poller and its event storage travel together between workers.
struct Poller {
    poll: Poll,
    events: Events,
}

struct Schedule {
    next_tick: Instant,
    next_sweep: Instant,
    drain_deadline: Option<Instant>,
}

struct Shared {
    poller: Mutex<Poller>,
    registry: Registry,
    waker: Waker,
    listener: Listener,
    connections: Mutex<ConnectionRegistry>,
    handler: Arc<dyn RequestHandler>,
    stats: Arc<ServerStats>,
    settings: LoopSettings,
    phase: AtomicU8,
    drain_started: AtomicBool,
    schedule: Mutex<Schedule>,
}

/// A fixed pool of workers racing for events from one shared poller.
pub struct EventLoopPool {
    shared: Arc<Shared>,
}

/// Cloneable handle that starts a graceful shutdown of the pool.
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventLoopPool {
    /// Create the shared poller and register the listener with it.
    pub fn new(
        listener: Listener,
        handler: Arc<dyn RequestHandler>,
        stats: Arc<ServerStats>,
        settings: LoopSettings,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        listener.register(&registry)?;

        let now = Instant::now();
        let shared = Shared {
            poller: Mutex::new(Poller {
                poll,
                events: Events::with_capacity(EVENTS_CAPACITY),
            }),
            registry,
            waker,
            listener,
            connections: Mutex::new(ConnectionRegistry::new(settings.max_connections)),
            handler,
            stats,
            schedule: Mutex::new(Schedule {
                next_tick: now,
                next_sweep: now,
                drain_deadline: None,
            }),
            settings,
            phase: AtomicU8::new(RUNNING),
            drain_started: AtomicBool::new(false),
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of connections currently in the table.
    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        lock(&self.shared.connections).len()
    }

    /// Run `num_workers` workers until the pool stops. Returns once every
    /// worker has been joined.
    pub fn run(&self, num_workers: usize) -> io::Result<()> {
        let num_workers = num_workers.max(1);
        info!(
            workers = num_workers,
            addr = %self.local_addr(),
            "Starting event loop pool"
        );

        let mut handles = Vec::with_capacity(num_workers);
        let mut spawn_error = None;

        for worker_id in 0..num_workers {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || {
                    if let Err(e) = worker_loop(worker_id, &shared) {
                        error!(worker = worker_id, error = %e, "Worker failed");
                    }
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(worker = worker_id, error = %e, "Failed to spawn worker");
                    self.shared.stop();
                    spawn_error = Some(e);
                    break;
                }
            }
        }

        // Wait for all workers
        for handle in handles {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }

        // Whatever survived the workers is closed here.
        self.shared.close_all(CloseReason::Shutdown);

        let stats = self.shared.stats.snapshot();
        info!(
            accepted = stats.connections_accepted,
            requests = stats.requests_served,
            idle_timeouts = stats.idle_timeouts,
            "Event loop pool stopped"
        );

        match spawn_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl ShutdownHandle {
    /// Begin a graceful shutdown: stop accepting, let in-flight responses
    /// finish, close the rest at the shutdown deadline. Idempotent.
    pub fn shutdown(&self) {
        self.shared.begin_shutdown();
    }

    /// Stop immediately, without draining.
    #[cfg(test)]
    pub fn stop(&self) {
        self.shared.stop();
    }
}

fn worker_loop(worker_id: usize, shared: &Shared) -> io::Result<()> {
    let mut ready: Vec<(Token, Readiness)> = Vec::with_capacity(EVENTS_CAPACITY);
    debug!(worker = worker_id, "Worker started");

    loop {
        if shared.phase() == STOPPED {
            break;
        }

        {
            let mut poller = lock(&shared.poller);
            // Another worker may have stopped the pool while we queued.
            if shared.phase() == STOPPED {
                break;
            }
            let Poller { poll, events } = &mut *poller;
            match poll.poll(events, Some(POLL_TICK)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
            ready.extend(events.iter().map(|event| (event.token(), Readiness::from(event))));
        }

        for (token, readiness) in ready.drain(..) {
            shared.dispatch(worker_id, token, readiness);
        }

        shared.maintain(worker_id);
    }

    debug!(worker = worker_id, "Worker exiting");
    Ok(())
}

impl Shared {
    fn phase(&self) -> u8 {
        self.phase.load(Ordering::Acquire)
    }

    fn dispatch(&self, worker_id: usize, token: Token, readiness: Readiness) {
        match token {
            LISTENER => self.accept(worker_id),
            WAKER => {
                if self.phase() == DRAINING {
                    self.start_drain();
                }
            }
            token => match ConnToken::from_token(token) {
                Some(conn_token) => self.drive(worker_id, conn_token, readiness),
                None => warn!(worker = worker_id, token = token.0, "Unknown token"),
            },
        }
    }

    fn accept(&self, worker_id: usize) {
        if self.phase() != RUNNING {
            return;
        }
        self.listener
            .accept_ready(worker_id, |stream, peer| self.admit(worker_id, stream, peer));
    }

    /// Wrap an accepted socket in a connection and start it.
    fn admit(&self, worker_id: usize, stream: TcpStream, peer: SocketAddr) {
        let buffer_size = self.settings.buffer_size;
        let conn = lock(&self.connections)
            .insert_with(|token| Connection::create(stream, peer, token, buffer_size));

        let Some(conn) = conn else {
            warn!(worker = worker_id, peer = %peer, "Connection limit reached");
            self.stats.connection_rejected();
            return;
        };

        self.stats.connection_accepted();
        debug!(
            worker = worker_id,
            conn = %conn.token(),
            peer = %peer,
            "Accepted connection"
        );

        if let Err(e) = conn.start(&self.registry) {
            warn!(conn = %conn.token(), error = %e, "Failed to start connection");
            self.release(conn.token(), CloseReason::Error);
        }
    }

    /// Run one continuation of a connection.
    fn drive(&self, worker_id: usize, token: ConnToken, readiness: Readiness) {
        // Clone out of the table so the connection stays alive for the whole
        // continuation, whatever other workers do to the table meanwhile.
        let Some(conn) = lock(&self.connections).get(token) else {
            trace!(worker = worker_id, conn = %token, "Event for a released connection");
            return;
        };

        let driver = Driver {
            registry: &self.registry,
            handler: &*self.handler,
            stats: &self.stats,
            draining: self.phase() != RUNNING,
        };

        trace!(worker = worker_id, conn = %token, "Driving connection");
        if let Step::Close(reason) = conn.on_ready(readiness, &driver) {
            self.release(token, reason);
        }
    }

    /// Remove a connection from the table and close it.
    fn release(&self, token: ConnToken, reason: CloseReason) {
        let conn = lock(&self.connections).remove(token);
        if let Some(conn) = conn {
            if conn.close(&self.registry, reason) {
                self.stats.connection_closed(reason);
                trace!(conn = %token, peer = %conn.peer(), "Released connection");
            }
        }
    }

    /// Run the periodic work if it is due and no other worker is on it.
    fn maintain(&self, worker_id: usize) {
        let now = Instant::now();
        let Ok(mut schedule) = self.schedule.try_lock() else {
            return;
        };
        if now < schedule.next_tick {
            return;
        }
        schedule.next_tick = now + POLL_TICK;

        let sweep_due = match self.settings.idle_timeout {
            Some(timeout) if now >= schedule.next_sweep => {
                schedule.next_sweep = now + (timeout / 2).min(MAX_SWEEP_INTERVAL);
                Some(timeout)
            }
            _ => None,
        };
        let drain_deadline = schedule.drain_deadline;
        drop(schedule);

        self.listener.rearm_if_needed(&self.registry);

        if let Some(timeout) = sweep_due {
            self.sweep_idle(worker_id, timeout, now);
        }

        if self.phase() == DRAINING {
            // Covers a shutdown requested before any worker saw the waker.
            self.start_drain();
            self.drain_progress(drain_deadline, now);
        }
    }

    /// Close every connection idle for longer than `timeout`.
    fn sweep_idle(&self, worker_id: usize, timeout: Duration, now: Instant) {
        let candidates: Vec<Arc<Connection>> = lock(&self.connections).iter().cloned().collect();

        let mut expired = 0;
        for conn in candidates {
            if conn.close_if_idle(&self.registry, timeout, now) {
                lock(&self.connections).remove(conn.token());
                self.stats.connection_closed(CloseReason::IdleTimeout);
                expired += 1;
            }
        }

        if expired > 0 {
            debug!(worker = worker_id, expired, "Closed idle connections");
        }
    }

    fn begin_shutdown(&self) {
        if self
            .phase
            .compare_exchange(RUNNING, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        lock(&self.schedule).drain_deadline = Some(Instant::now() + self.settings.shutdown_timeout);
        info!(
            timeout_secs = self.settings.shutdown_timeout.as_secs_f64(),
            "Graceful shutdown requested"
        );
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake poller");
        }
    }

    /// First step of draining: stop accepting and close connections that
    /// sit between requests. Runs once.
    fn start_drain(&self) {
        if self.drain_started.swap(true, Ordering::AcqRel) {
            return;
        }

        self.listener.stop(&self.registry);

        let conns: Vec<Arc<Connection>> = lock(&self.connections).iter().cloned().collect();
        for conn in conns {
            if conn.close_if_quiescent(&self.registry) {
                lock(&self.connections).remove(conn.token());
                self.stats.connection_closed(CloseReason::Drained);
            }
        }

        let remaining = lock(&self.connections).len();
        info!(in_flight = remaining, "Draining connections");
    }

    /// Stop once every connection is gone or the deadline passes.
    fn drain_progress(&self, deadline: Option<Instant>, now: Instant) {
        let remaining = lock(&self.connections).len();
        let expired = deadline.is_some_and(|deadline| now >= deadline);

        if remaining > 0 && !expired {
            return;
        }
        if remaining > 0 {
            warn!(remaining, "Shutdown deadline reached, closing connections");
        }
        self.close_all(CloseReason::Shutdown);
        self.stop();
    }

    fn close_all(&self, reason: CloseReason) {
        let conns = lock(&self.connections).drain();
        for conn in conns {
            if conn.close(&self.registry, reason) {
                self.stats.connection_closed(reason);
            }
        }
    }

    fn stop(&self) {
        if self.phase.swap(STOPPED, Ordering::AcqRel) == STOPPED {
            return;
        }
        self.listener.stop(&self.registry);
        // Release whichever worker is waiting in the poller; the others
        // check the phase before they wait.
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake poller");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::protocol::Reply;
    use bytes::Bytes;
    use std::io::{Read, Write};

    fn settings() -> LoopSettings {
        LoopSettings {
            buffer_size: 64,
            max_connections: 16,
            idle_timeout: None,
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    fn pool(settings: LoopSettings) -> EventLoopPool {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 64).unwrap();
        let handler = Arc::new(|_: &[u8]| Reply::Respond(Bytes::from_static(b"pong")));
        EventLoopPool::new(listener, handler, Arc::new(ServerStats::new()), settings).unwrap()
    }

    #[test]
    fn test_shutdown_before_run_returns() {
        let pool = pool(settings());
        pool.shutdown_handle().shutdown();
        pool.run(2).unwrap();
        assert_eq!(pool.connection_count(), 0);
    }

    #[test]
    fn test_stop_joins_all_workers() {
        let pool = Arc::new(pool(settings()));
        let handle = pool.shutdown_handle();

        let runner = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.run(4))
        };
        thread::sleep(Duration::from_millis(100));
        handle.stop();

        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_single_worker_serves_requests() {
        let pool = Arc::new(pool(settings()));
        let addr = pool.local_addr();
        let handle = pool.shutdown_handle();

        let runner = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.run(1))
        };

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        for _ in 0..3 {
            client.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"pong");
        }

        handle.shutdown();
        runner.join().unwrap().unwrap();
    }
}
