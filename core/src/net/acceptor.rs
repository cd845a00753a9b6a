use crate::net::config::NetworkConfig;
use crate::net::connection::Connection;
use crate::net::job::Job;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use slog::{debug, info, o, Logger};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const ACCEPT_BACKLOG: i32 = 100;

/// Owns the listen socket and the tracking table of live connections. Runs
/// on a single dedicated thread; see the module-level acceptor tick
/// algorithm for the per-`getJobs` call contract.
pub struct Acceptor {
    poll: Poll,
    listener: Option<TcpListener>,
    config: NetworkConfig,
    logger: Logger,
    discovery_url: String,
    connections: Vec<Arc<Connection>>,
    token_index: HashMap<Token, usize>,
    next_token: usize,
    events: Events,
}

impl Acceptor {
    /// Opens the listen socket: `SO_REUSEADDR`, wildcard bind on
    /// `config.port`, non-blocking, backlog 100. Derives the discovery URL
    /// from the local hostname.
    pub fn start(logger: Logger, config: NetworkConfig) -> io::Result<Acceptor> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
        socket.bind(&addr.into())?;
        socket.listen(ACCEPT_BACKLOG)?;
        socket.set_nonblocking(true)?;

        let std_listener: std::net::TcpListener = socket.into();
        let mut listener = TcpListener::from_std(std_listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        let discovery_url = format!("opc.tcp://{}:{}", host, config.port);

        info!(logger, "acceptor listening"; "discovery_url" => discovery_url.as_str());

        Ok(Acceptor {
            poll,
            listener: Some(listener),
            config,
            logger,
            discovery_url,
            connections: Vec::new(),
            token_index: HashMap::new(),
            next_token: 0,
            events: Events::with_capacity(1024),
        })
    }

    pub fn discovery_url(&self) -> &str {
        &self.discovery_url
    }

    pub fn tracked_connections(&self) -> usize {
        self.connections.len()
    }

    /// One scheduling tick: wait up to `timeout` for readiness, accept at
    /// most one new connection, read once from every readable tracked
    /// connection, and return the resulting job batch.
    pub fn get_jobs(&mut self, timeout: Duration) -> Vec<Job> {
        let mut jobs = Vec::new();

        if self.listener.is_none() {
            return jobs;
        }

        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            debug!(self.logger, "poll error, skipping tick"; "error" => %e);
            return jobs;
        }

        let mut readable_tokens = Vec::new();
        let mut listener_readable = false;
        for event in self.events.iter() {
            if event.token() == LISTENER_TOKEN {
                listener_readable = true;
            } else {
                readable_tokens.push(event.token());
            }
        }

        if listener_readable {
            self.accept_one();
        }

        for token in readable_tokens {
            let Some(&idx) = self.token_index.get(&token) else {
                continue;
            };
            self.service_connection(idx, token, &mut jobs);
        }

        jobs
    }

    fn accept_one(&mut self) {
        let listener = self.listener.as_ref().expect("listener present");
        match listener.accept() {
            Ok((mut stream, peer_addr)) => {
                let _ = stream.set_nodelay(true);
                let token = self.allocate_token();
                let conn = Arc::new(Connection::new(stream, peer_addr, self.config));
                if conn.register(self.poll.registry(), token).is_ok() {
                    let idx = self.connections.len();
                    self.connections.push(conn);
                    self.token_index.insert(token, idx);
                    debug!(self.logger, "connection accepted"; "peer_addr" => %peer_addr);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!(self.logger, "accept error"; "error" => %e);
            }
        }
    }

    fn service_connection(&mut self, idx: usize, token: Token, jobs: &mut Vec<Job>) {
        let conn = Arc::clone(&self.connections[idx]);
        let mut buf = vec![0u8; self.config.recv_buffer_size];
        match conn.try_recv(&mut buf) {
            Ok(0) => self.detach(idx, token, jobs),
            Ok(n) => {
                buf.truncate(n);
                jobs.push(Job::BinaryMessage {
                    connection: conn,
                    bytes: buf,
                });
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                // no data yet; nothing to do this tick
            }
            Err(e) => {
                debug!(self.logger, "recv error, detaching"; "peer_addr" => %conn.peer_addr(), "error" => %e);
                self.detach(idx, token, jobs);
            }
        }
    }

    /// Unlink the connection at `idx`/`token` (swap-with-last) and emit its
    /// detach/delayed-free pair.
    fn detach(&mut self, idx: usize, token: Token, jobs: &mut Vec<Job>) {
        let conn = self.connections.swap_remove(idx);
        self.token_index.remove(&token);
        if idx < self.connections.len() {
            // The connection swapped into `idx` keeps its own token, but
            // its index in `connections` moved - fix up the map.
            let moved_token = self
                .token_index
                .iter()
                .find(|(_, &i)| i == self.connections.len())
                .map(|(&t, _)| t);
            if let Some(t) = moved_token {
                self.token_index.insert(t, idx);
            }
        }

        let _ = conn.deregister(self.poll.registry());
        conn.close();

        jobs.push(Job::DetachConnection {
            connection: Arc::clone(&conn),
        });
        jobs.push(Job::DelayedFree { connection: conn });
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Close the listen socket and emit a DETACH/DELAYED-FREE pair for
    /// every still-tracked connection.
    pub fn stop(&mut self) -> Vec<Job> {
        let mut jobs = Vec::new();

        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }

        for conn in self.connections.drain(..) {
            let _ = conn.deregister(self.poll.registry());
            conn.close();
            jobs.push(Job::DetachConnection {
                connection: Arc::clone(&conn),
            });
            jobs.push(Job::DelayedFree { connection: conn });
        }
        self.token_index.clear();

        info!(self.logger, "acceptor stopped");
        jobs
    }

    /// Release the tracking table. Only valid after `stop` and after every
    /// emitted `DelayedFree` has been processed by the dispatcher; consuming
    /// `self` makes that ordering a compile-time fact for the caller.
    pub fn delete_members(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use sloggers::Build;
    use std::io::Write;
    use std::net::TcpStream as StdStream;

    fn test_logger() -> Logger {
        sloggers::terminal::TerminalLoggerBuilder::new()
            .build()
            .unwrap()
    }

    fn start_acceptor() -> Acceptor {
        let config = NetworkConfig {
            port: 0,
            ..NetworkConfig::default()
        };
        Acceptor::start(test_logger(), config).unwrap()
    }

    #[test]
    fn accept_plus_read_produces_binary_message() {
        let mut acceptor = start_acceptor();
        let port = local_port(&acceptor);

        let mut client = StdStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        // First tick: accept only (listener readiness and connection
        // readiness may not coincide within one poll call).
        let _ = acceptor.get_jobs(Duration::from_millis(200));
        let jobs = acceptor.get_jobs(Duration::from_millis(200));

        let found = jobs.iter().any(|job| match job {
            Job::BinaryMessage { bytes, .. } => bytes.as_slice() == [1, 2, 3, 4, 5, 6, 7, 8],
            _ => false,
        });
        assert!(found, "expected a BinaryMessage job with the sent bytes");
    }

    #[test]
    fn client_close_emits_detach_then_delayed_free() {
        let mut acceptor = start_acceptor();
        let port = local_port(&acceptor);

        let client = StdStream::connect(("127.0.0.1", port)).unwrap();
        let _ = acceptor.get_jobs(Duration::from_millis(200));
        drop(client);

        let jobs = acceptor.get_jobs(Duration::from_millis(200));
        let mut saw_detach = false;
        let mut saw_free = false;
        for job in &jobs {
            match job {
                Job::DetachConnection { .. } => saw_detach = true,
                Job::DelayedFree { .. } => saw_free = true,
                _ => {}
            }
        }
        assert!(saw_detach && saw_free);
    }

    #[test]
    fn stop_emits_two_jobs_per_tracked_connection() {
        let mut acceptor = start_acceptor();
        let port = local_port(&acceptor);

        let _c1 = StdStream::connect(("127.0.0.1", port)).unwrap();
        let _c2 = StdStream::connect(("127.0.0.1", port)).unwrap();
        let _ = acceptor.get_jobs(Duration::from_millis(200));
        let _ = acceptor.get_jobs(Duration::from_millis(200));

        let tracked = acceptor.tracked_connections();
        let jobs = acceptor.stop();
        assert_eq!(jobs.len(), tracked * 2);
    }

    fn local_port(acceptor: &Acceptor) -> u16 {
        acceptor
            .listener
            .as_ref()
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }
}
