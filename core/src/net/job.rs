use crate::net::connection::Connection;
use std::sync::Arc;

/// Work item the Acceptor hands to the worker dispatcher. See the acceptor
/// tick algorithm for how each variant is produced.
pub enum Job {
    /// Bytes read from one connection. Upstream releases `bytes` back to
    /// that connection's recv buffer pool when done with it.
    BinaryMessage {
        connection: Arc<Connection>,
        bytes: Vec<u8>,
    },
    /// The connection has been unlinked from the tracking table; upstream
    /// should tear down any semantic state (secure channel, session) tied
    /// to it.
    DetachConnection { connection: Arc<Connection> },
    /// Emitted strictly after every job referencing `connection` that was
    /// enqueued before it. Once processed, the connection has no more
    /// readers anywhere in the system.
    DelayedFree { connection: Arc<Connection> },
}
