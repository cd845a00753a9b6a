use crate::error::{Error, Result};
use crate::net::buffer::BufferPool;
use crate::net::config::NetworkConfig;
use mio::net::TcpStream;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};

const OPENING: u8 = 0;
const ESTABLISHED: u8 = 1;
const CLOSED: u8 = 2;

/// Per-socket state, shared between the acceptor thread (which owns reads
/// and lifecycle) and worker threads (which call `send`/`close`). Only
/// `state` and the send path are touched from worker threads; everything
/// else belongs to the acceptor.
pub struct Connection {
    stream: Mutex<TcpStream>,
    peer_addr: SocketAddr,
    state: AtomicU8,
    pub local_config: NetworkConfig,
    /// Filled in by an upstream protocol layer after the Hello exchange;
    /// the core here only ever reads it to size `getSendBuffer` requests.
    pub remote_config: Mutex<Option<NetworkConfig>>,
    send_pool: Mutex<BufferPool>,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, peer_addr: SocketAddr, local_config: NetworkConfig) -> Connection {
        Connection {
            stream: Mutex::new(stream),
            peer_addr,
            state: AtomicU8::new(OPENING),
            local_config,
            remote_config: Mutex::new(None),
            send_pool: Mutex::new(BufferPool::new()),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    /// Called by upstream protocol code once the Hello/Ack handshake on
    /// this connection completes. The acceptor itself never calls this -
    /// it is agnostic to protocol framing, per the state machine's
    /// "Transition to Established is not performed by the acceptor" rule.
    pub fn mark_established(&self) {
        let _ = self
            .state
            .compare_exchange(OPENING, ESTABLISHED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Write `bytes` in full, looping across short writes and retrying on
    /// `WouldBlock`/`Interrupted`. Any other I/O error closes the
    /// connection and is reported as [`Error::ConnectionClosed`].
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let mut stream = self.stream.lock();
        let mut written = 0;
        while written < bytes.len() {
            match stream.write(&bytes[written..]) {
                Ok(0) => {
                    drop(stream);
                    self.close();
                    return Err(Error::ConnectionClosed);
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::yield_now();
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    drop(stream);
                    self.close();
                    return Err(Error::ConnectionClosed);
                }
            }
        }
        Ok(())
    }

    /// Idempotent shutdown. Only the caller that actually flips the state
    /// performs `shutdown(2)` - concurrent callers just observe `Closed`.
    pub fn close(&self) {
        if self.state.swap(CLOSED, Ordering::AcqRel) != CLOSED {
            let stream = self.stream.lock();
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    /// Allocate a send buffer no larger than the peer's advertised receive
    /// size, recorded in `remote_config` after the Hello handshake.
    pub fn get_send_buffer(&self, len: usize) -> Result<Vec<u8>> {
        if let Some(remote) = *self.remote_config.lock() {
            if len > remote.recv_buffer_size {
                return Err(Error::CommunicationError(
                    "requested send buffer exceeds peer's advertised recv_buffer_size",
                ));
            }
        }
        Ok(self.send_pool.lock().acquire(len))
    }

    pub fn release_send_buffer(&self, buf: Vec<u8>) {
        self.send_pool.lock().release(buf);
    }

    /// Non-blocking read of whatever is currently available, used only by
    /// the acceptor thread on its own tracked sockets. Never touches
    /// `send_pool` - recv buffers are owned by the acceptor's tick loop,
    /// not this connection, matching the "freshly allocated buffer" recv
    /// path in the tick algorithm.
    pub(crate) fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self.stream.lock();
        stream.read(buf)
    }

    /// Register this connection's socket with `registry` under `token` for
    /// readability events. Called once by the acceptor right after accept.
    pub(crate) fn register(
        &self,
        registry: &mio::Registry,
        token: mio::Token,
    ) -> io::Result<()> {
        let mut stream = self.stream.lock();
        registry.register(&mut *stream, token, mio::Interest::READABLE)
    }

    pub(crate) fn deregister(&self, registry: &mio::Registry) -> io::Result<()> {
        let mut stream = self.stream.lock();
        registry.deregister(&mut *stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};

    fn pair() -> (Connection, StdStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let mio_stream = TcpStream::from_std(server);
        (
            Connection::new(mio_stream, peer, NetworkConfig::default()),
            client,
        )
    }

    #[test]
    fn fresh_connection_is_opening_and_not_closed() {
        let (conn, _client) = pair();
        assert!(!conn.is_closed());
    }

    #[test]
    fn close_is_idempotent() {
        let (conn, _client) = pair();
        conn.close();
        conn.close();
        assert!(conn.is_closed());
    }

    #[test]
    fn send_after_close_fails() {
        let (conn, _client) = pair();
        conn.close();
        assert!(matches!(conn.send(b"hi"), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn oversized_send_buffer_request_is_rejected() {
        let (conn, _client) = pair();
        let mut remote = NetworkConfig::default();
        remote.recv_buffer_size = 16;
        *conn.remote_config.lock() = Some(remote);

        let err = conn.get_send_buffer(17).unwrap_err();
        assert!(matches!(err, Error::CommunicationError(_)));
    }

    #[test]
    fn send_buffer_within_bound_succeeds() {
        let (conn, _client) = pair();
        let mut remote = NetworkConfig::default();
        remote.recv_buffer_size = 16;
        *conn.remote_config.lock() = Some(remote);

        let buf = conn.get_send_buffer(16).unwrap();
        assert_eq!(buf.len(), 16);
        conn.release_send_buffer(buf);
    }
}
