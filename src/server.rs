//! TCP server: binds the listener and runs the event loop pool.

use crate::config::Config;
use crate::runtime::{
    EventLoopPool, Listener, LoopSettings, RequestHandler, ServerStats, ShutdownHandle,
};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Server startup and run errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("failed to create poller: {0}")]
    Poller(#[source] io::Error),

    #[error("failed to start workers: {0}")]
    Workers(#[source] io::Error),
}

/// Server instance
pub struct Server {
    pool: EventLoopPool,
    stats: Arc<ServerStats>,
    workers: usize,
}

impl Server {
    /// Bind the listening socket and set up the worker pool.
    ///
    /// Nothing is accepted until `run` is called, but connections already
    /// queue in the backlog.
    pub fn bind(config: &Config, handler: Arc<dyn RequestHandler>) -> Result<Self, ServerError> {
        let addr = resolve(&config.host, config.port)?;
        let listener =
            Listener::bind(addr, config.backlog).map_err(|source| ServerError::Bind { addr, source })?;

        let stats = Arc::new(ServerStats::new());
        let settings = LoopSettings {
            buffer_size: config.buffer_size,
            max_connections: config.max_connections,
            idle_timeout: config.idle_timeout,
            shutdown_timeout: config.shutdown_timeout,
        };
        let pool = EventLoopPool::new(listener, handler, Arc::clone(&stats), settings)
            .map_err(ServerError::Poller)?;

        info!(address = %pool.local_addr(), "Server listening");

        Ok(Self {
            pool,
            stats,
            workers: config.worker_count(),
        })
    }

    /// The bound address (with the real port when bound to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.pool.local_addr()
    }

    /// Handle for stopping the server from another thread or a signal.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.pool.shutdown_handle()
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Serve until shut down. Blocks the calling thread.
    pub fn run(self) -> Result<(), ServerError> {
        self.pool.run(self.workers).map_err(ServerError::Workers)
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    let invalid = |reason: String| ServerError::InvalidAddress {
        addr: format!("{host}:{port}"),
        reason,
    };

    (host, port)
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("no addresses found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::http::handler::STATIC_BODY;
    use crate::protocols::http::{self, StaticPage};
    use crate::runtime::protocol::Reply;
    use crate::runtime::stats::StatsSnapshot;
    use bytes::Bytes;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";

    struct Running {
        addr: SocketAddr,
        handle: ShutdownHandle,
        stats: Arc<ServerStats>,
        thread: JoinHandle<Result<(), ServerError>>,
    }

    impl Running {
        fn stop(self) {
            self.handle.shutdown();
            self.thread.join().unwrap().unwrap();
        }
    }

    fn test_config(workers: usize) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            workers: Some(workers),
            ..Config::default()
        }
    }

    fn start(config: Config, handler: Arc<dyn RequestHandler>) -> Running {
        let server = Server::bind(&config, handler).unwrap();
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let stats = server.stats();
        let thread = thread::spawn(move || server.run());
        Running {
            addr,
            handle,
            stats,
            thread,
        }
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Read one response framed by `Content-Length`; returns (head, body).
    fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();

        let length: usize = head
            .lines()
            .find_map(|line| line.strip_prefix("Content-Length: "))
            .expect("Content-Length header")
            .trim()
            .parse()
            .unwrap();

        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).unwrap();
        (head, body)
    }

    /// True once the server closed its side.
    fn is_closed_by_server(stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; 16];
        matches!(stream.read(&mut buf), Ok(0))
    }

    fn wait_for(stats: &ServerStats, done: impl Fn(&StatsSnapshot) -> bool) -> StatsSnapshot {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snap = stats.snapshot();
            if done(&snap) || Instant::now() >= deadline {
                return snap;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_static_page_keep_alive() {
        let server = start(test_config(2), Arc::new(StaticPage::new()));
        let mut client = connect(server.addr);

        client.write_all(REQUEST).unwrap();
        let (head, body) = read_response(&mut client);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/html\r\n"));
        assert!(head.contains("Content-Length: 63\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert_eq!(body, STATIC_BODY.as_bytes());

        // Same connection, identical response.
        client.write_all(REQUEST).unwrap();
        let (head2, body2) = read_response(&mut client);
        assert_eq!(head2, head);
        assert_eq!(body2, body);

        let snap = wait_for(&server.stats, |s| s.requests_served == 2);
        assert_eq!(snap.requests_served, 2);
        assert_eq!(snap.connections_accepted, 1);
        server.stop();
    }

    #[test]
    fn test_connect_and_close_writes_nothing() {
        let server = start(test_config(2), Arc::new(StaticPage::new()));
        drop(connect(server.addr));

        let snap = wait_for(&server.stats, |s| s.connections_closed == 1);
        assert_eq!(snap.connections_accepted, 1);
        assert_eq!(snap.connections_closed, 1);
        assert_eq!(snap.requests_served, 0);
        assert_eq!(snap.bytes_written, 0);
        server.stop();
    }

    #[test]
    fn test_single_worker_concurrent_clients() {
        let server = start(test_config(1), Arc::new(StaticPage::new()));
        let addr = server.addr;

        let clients: Vec<_> = (0..16)
            .map(|_| {
                thread::spawn(move || {
                    let mut client = connect(addr);
                    for _ in 0..3 {
                        client.write_all(REQUEST).unwrap();
                        let (_, body) = read_response(&mut client);
                        assert_eq!(body, STATIC_BODY.as_bytes());
                    }
                })
            })
            .collect();
        for client in clients {
            client.join().unwrap();
        }

        let snap = wait_for(&server.stats, |s| s.requests_served == 48);
        assert_eq!(snap.requests_served, 48);
        assert_eq!(snap.connections_accepted, 16);
        server.stop();
    }

    #[test]
    fn test_idle_connection_times_out() {
        let config = Config {
            idle_timeout: Some(Duration::from_millis(300)),
            ..test_config(2)
        };
        let server = start(config, Arc::new(StaticPage::new()));
        let mut client = connect(server.addr);

        client.write_all(REQUEST).unwrap();
        read_response(&mut client);

        assert!(is_closed_by_server(&mut client));
        let snap = wait_for(&server.stats, |s| s.idle_timeouts == 1);
        assert_eq!(snap.idle_timeouts, 1);
        assert_eq!(snap.active_connections(), 0);
        server.stop();
    }

    #[test]
    fn test_response_larger_than_buffer() {
        let body: Bytes = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = body.clone();
        let handler = move |_: &[u8]| Reply::Respond(http::response(200, "OK", "application/octet-stream", &body));

        let config = Config {
            buffer_size: 1024,
            ..test_config(2)
        };
        let server = start(config, Arc::new(handler));
        let mut client = connect(server.addr);

        for _ in 0..2 {
            client.write_all(REQUEST).unwrap();
            let (_, received) = read_response(&mut client);
            assert_eq!(received.len(), expected.len());
            assert!(received == expected[..]);
        }
        server.stop();
    }

    #[test]
    fn test_handler_panic_closes_only_its_connection() {
        let handler = |request: &[u8]| -> Reply {
            if request.starts_with(b"boom") {
                panic!("handler failure");
            }
            StaticPage::new().handle(request)
        };
        let server = start(test_config(2), Arc::new(handler));

        let mut bad = connect(server.addr);
        let mut good = connect(server.addr);

        bad.write_all(b"boom").unwrap();
        assert!(is_closed_by_server(&mut bad));

        good.write_all(REQUEST).unwrap();
        let (_, body) = read_response(&mut good);
        assert_eq!(body, STATIC_BODY.as_bytes());

        let snap = wait_for(&server.stats, |s| s.handler_failures == 1);
        assert_eq!(snap.handler_failures, 1);
        server.stop();
    }

    #[test]
    fn test_graceful_shutdown_closes_idle_clients() {
        let server = start(test_config(4), Arc::new(StaticPage::new()));
        let mut client = connect(server.addr);
        client.write_all(REQUEST).unwrap();
        read_response(&mut client);

        let stats = Arc::clone(&server.stats);
        let addr = server.addr;
        server.stop();

        assert!(is_closed_by_server(&mut client));
        let snap = stats.snapshot();
        assert_eq!(snap.active_connections(), 0);
        assert_eq!(snap.requests_served, 1);

        // The listener is gone with the pool.
        let refused = TcpStream::connect(addr)
            .and_then(|mut s| {
                s.set_read_timeout(Some(Duration::from_secs(1)))?;
                s.write_all(REQUEST)?;
                let mut buf = [0u8; 1];
                s.read(&mut buf)
            })
            .map_or(true, |n| n == 0);
        assert!(refused);
    }

    #[test]
    fn test_shutdown_answers_requests_already_received() {
        let handler = |request: &[u8]| -> Reply {
            if request.starts_with(b"slow") {
                thread::sleep(Duration::from_millis(500));
            }
            StaticPage::new().handle(request)
        };
        let server = start(test_config(1), Arc::new(handler));

        let mut busy = connect(server.addr);
        let mut waiting = connect(server.addr);
        let snap = wait_for(&server.stats, |s| s.connections_accepted == 2);
        assert_eq!(snap.connections_accepted, 2);

        // The only worker is inside the slow handler while the second
        // request lands in the kernel and shutdown begins.
        busy.write_all(b"slow").unwrap();
        thread::sleep(Duration::from_millis(100));
        waiting.write_all(REQUEST).unwrap();
        thread::sleep(Duration::from_millis(50));
        server.handle.shutdown();

        let (_, body) = read_response(&mut waiting);
        assert_eq!(body, STATIC_BODY.as_bytes());
        assert!(is_closed_by_server(&mut waiting));

        let (_, body) = read_response(&mut busy);
        assert_eq!(body, STATIC_BODY.as_bytes());
        assert!(is_closed_by_server(&mut busy));

        server.thread.join().unwrap().unwrap();
        assert_eq!(server.stats.snapshot().requests_served, 2);
    }

    #[test]
    fn test_bind_conflict() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = Config {
            port: taken.local_addr().unwrap().port(),
            ..test_config(1)
        };

        let err = Server::bind(&config, Arc::new(StaticPage::new()))
            .err()
            .expect("bind must fail");
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[test]
    fn test_invalid_host() {
        let config = Config {
            host: "not a valid host".to_string(),
            ..test_config(1)
        };

        let err = Server::bind(&config, Arc::new(StaticPage::new()))
            .err()
            .expect("resolution must fail");
        assert!(matches!(err, ServerError::InvalidAddress { .. }));
    }
}
