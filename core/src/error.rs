use std::io;
use thiserror::Error;

/// Crate-wide error taxonomy. Variants name failure *kinds*, not call sites -
/// the same variant is returned whether the NodeStore or the network layer
/// raised it.
#[derive(Debug, Error)]
pub enum Error {
    /// Peer closed, an unrecoverable read/write error occurred, or upstream
    /// requested the connection be closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A buffer-size or protocol-boundary violation (e.g. a send buffer
    /// request larger than the peer's advertised receive size).
    #[error("communication error: {0}")]
    CommunicationError(&'static str),

    /// Allocation failed. Caller should retry or degrade.
    #[error("out of memory")]
    OutOfMemory,

    /// `insert` was given a non-null `NodeId` that already names a reachable
    /// entry.
    #[error("node id already exists")]
    NodeIdExists,

    /// `replace`/`remove`/`get` was given a `NodeId` with no reachable entry.
    #[error("node id unknown")]
    NodeIdUnknown,

    /// An OS call failed in a way the caller cannot recover from locally
    /// (socket, fcntl, select/poll setup). The affected connection, if any,
    /// is detached; the failure is otherwise only logged.
    #[error("internal error: {0}")]
    InternalError(String),

    /// Wraps a transient OS error surfaced through an `io::Error` at a
    /// boundary that itself has no more specific variant to report.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
