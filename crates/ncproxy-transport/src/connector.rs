//! Outbound side of the I/O service

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::session::IoSession;
use crate::{AsyncIoService, TransportError, TransportResult};

/// Upper bound on a single outbound connect unless configured otherwise.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens outbound TCP connections tied to the shared channel group.
///
/// Connections attempted after the group shut down fail with
/// [`TransportError::GroupShutdown`]; a connect in flight when the group shuts
/// down is abandoned the same way. A peer that does not complete the
/// handshake within the connect timeout fails with
/// [`TransportError::Connect`] and an `io::ErrorKind::TimedOut` source.
#[derive(Clone, Debug)]
pub struct Connector {
    service: AsyncIoService,
    connect_timeout: Duration,
}

impl Connector {
    pub(crate) fn new(service: AsyncIoService) -> Self {
        Self {
            service,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub async fn connect(&self, addr: SocketAddr) -> TransportResult<IoSession> {
        let group = self.service.group();
        if group.is_shutdown() {
            return Err(TransportError::GroupShutdown);
        }

        let token = group.token();
        let stream = tokio::select! {
            _ = token.cancelled() => return Err(TransportError::GroupShutdown),
            connected = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)) => {
                let connected = connected.unwrap_or_else(|_| {
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no answer within {:?}", self.connect_timeout),
                    ))
                });
                connected.map_err(|source| TransportError::Connect { address: addr, source })?
            }
        };
        stream.set_nodelay(true)?;

        let session = IoSession::new(self.service.next_session_id(), stream, token)?;
        debug!(session = %session.id, %addr, "Connected");
        Ok(session)
    }
}
