//! Relays a subsystem channel to the backend service
//!
//! One [`SessionBridge`] exists per requested `netconf` channel. It dials the
//! backend only once the channel is requested, then copies bytes both ways
//! until one side reaches end-of-stream:
//!
//! ```text
//! Requested ──► BackendConnecting ──► Bridging ──► Closed
//!                      │                              ▲
//!                      └──────── backend refused ─────┘
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use ncproxy_transport::{Connector, SessionId, TransportError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::transport::{ClientChannel, SessionContext, SubsystemCommand, SubsystemFactory};
use crate::NETCONF_SUBSYSTEM;

const RELAY_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Backend {address} unavailable: {source}")]
    BackendUnavailable {
        address: SocketAddr,
        #[source]
        source: TransportError,
    },

    #[error("Relay failed: {0}")]
    Relay(#[from] std::io::Error),

    #[error("Backend connection not established")]
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Requested,
    BackendConnecting,
    Bridging,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    ClientToBackend,
    BackendToClient,
}

/// Outcome of a finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
    /// Direction whose source finished first.
    pub ended_by: RelayDirection,
}

/// Registers the `netconf` subsystem and bridges each channel to one fixed
/// backend address.
#[derive(Debug, Clone)]
pub struct SessionBridgeFactory {
    backend_address: SocketAddr,
    connector: Connector,
}

impl SessionBridgeFactory {
    pub fn new(backend_address: SocketAddr, connector: Connector) -> Self {
        Self {
            backend_address,
            connector,
        }
    }

    pub fn backend_address(&self) -> SocketAddr {
        self.backend_address
    }
}

#[async_trait]
impl SubsystemFactory for SessionBridgeFactory {
    fn name(&self) -> &str {
        NETCONF_SUBSYSTEM
    }

    async fn create(
        &self,
        context: &SessionContext,
    ) -> Result<Box<dyn SubsystemCommand>, BridgeError> {
        let mut bridge = SessionBridge::new(context.session_id, self.backend_address);
        bridge.connect(&self.connector).await?;
        Ok(Box::new(bridge))
    }
}

/// Bridge between one client channel and one backend connection.
#[derive(Debug)]
pub struct SessionBridge {
    session_id: SessionId,
    backend_address: SocketAddr,
    state: BridgeState,
    backend: Option<TcpStream>,
}

impl SessionBridge {
    pub fn new(session_id: SessionId, backend_address: SocketAddr) -> Self {
        Self {
            session_id,
            backend_address,
            state: BridgeState::Requested,
            backend: None,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Open the backend connection. Not retried.
    pub async fn connect(&mut self, connector: &Connector) -> Result<(), BridgeError> {
        self.state = BridgeState::BackendConnecting;
        debug!(
            session = %self.session_id,
            backend = %self.backend_address,
            "Connecting to backend"
        );

        match connector.connect(self.backend_address).await {
            Ok(session) => {
                self.backend = Some(session.into_stream());
                self.state = BridgeState::Bridging;
                Ok(())
            }
            Err(source) => {
                self.state = BridgeState::Closed;
                warn!(
                    session = %self.session_id,
                    backend = %self.backend_address,
                    "Backend unavailable: {}",
                    source
                );
                Err(BridgeError::BackendUnavailable {
                    address: self.backend_address,
                    source,
                })
            }
        }
    }

    /// Relay until either direction finishes, then shut down both sides.
    pub async fn bridge<C>(&mut self, channel: C) -> Result<RelaySummary, BridgeError>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let backend = self.backend.take().ok_or(BridgeError::NotConnected)?;
        info!(
            session = %self.session_id,
            backend = %self.backend_address,
            "Bridging subsystem channel"
        );

        let (mut client_read, mut client_write) = tokio::io::split(channel);
        let (mut backend_read, mut backend_write) = backend.into_split();

        let client_to_backend = AtomicU64::new(0);
        let backend_to_client = AtomicU64::new(0);

        let (ended_by, result) = tokio::select! {
            r = pump(&mut client_read, &mut backend_write, &client_to_backend) => {
                (RelayDirection::ClientToBackend, r)
            }
            r = pump(&mut backend_read, &mut client_write, &backend_to_client) => {
                (RelayDirection::BackendToClient, r)
            }
        };

        // Peers may already be gone; nothing useful to do with these errors
        let _ = backend_write.shutdown().await;
        let _ = client_write.shutdown().await;
        self.state = BridgeState::Closed;

        let summary = RelaySummary {
            client_to_backend: client_to_backend.load(Ordering::Relaxed),
            backend_to_client: backend_to_client.load(Ordering::Relaxed),
            ended_by,
        };

        match result {
            Ok(()) => {
                debug!(
                    session = %self.session_id,
                    ?ended_by,
                    sent = summary.client_to_backend,
                    received = summary.backend_to_client,
                    "Bridge closed"
                );
                Ok(summary)
            }
            Err(e) => {
                warn!(session = %self.session_id, ?ended_by, "Relay error: {}", e);
                Err(BridgeError::Relay(e))
            }
        }
    }
}

#[async_trait]
impl SubsystemCommand for SessionBridge {
    async fn run(mut self: Box<Self>, channel: ClientChannel) -> Result<RelaySummary, BridgeError> {
        self.bridge(channel).await
    }
}

/// Copy `reader` into `writer` until end-of-stream.
async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
    }
}
