//! Raw connections handed out by acceptors and connectors

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Process-unique identifier of a connection, used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Simple session ID generator for logging
#[derive(Clone, Debug)]
pub struct SessionIdGenerator {
    next_session_id: Arc<AtomicU64>,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_session_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn generate(&self) -> SessionId {
        SessionId(self.next_session_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A connected TCP stream bound to the channel group that produced it.
///
/// `shutdown` fires when the owning service closes; long-running protocol
/// loops should select on it.
#[derive(Debug)]
pub struct IoSession {
    pub id: SessionId,
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub shutdown: CancellationToken,
}

impl IoSession {
    pub(crate) fn new(
        id: SessionId,
        stream: TcpStream,
        shutdown: CancellationToken,
    ) -> std::io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        Ok(Self {
            id,
            stream,
            peer_addr,
            local_addr,
            shutdown,
        })
    }

    /// Give up the session wrapper and keep only the stream.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}
