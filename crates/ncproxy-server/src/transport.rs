//! Seam between the proxy lifecycle and the secure transport library
//!
//! The lifecycle code in [`crate::server`] never touches SSH types beyond host
//! keys. It hands a [`TransportSettings`] to a [`SecureTransport`] and gets
//! back an [`IoHandler`] that the acceptor feeds with raw TCP sessions.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ncproxy_transport::{AsyncIoService, IoHandler, SessionId, TransportError};
use russh::keys::PrivateKey;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::auth::AuthenticationAdapter;
use crate::bridge::{BridgeError, RelaySummary};
use crate::config::TransportProperties;

/// Byte stream of an opened subsystem channel.
pub trait ChannelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ChannelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type ClientChannel = Box<dyn ChannelIo>;

/// Who is on the other end of a transport session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub peer_addr: SocketAddr,
    /// Set once the client authenticated.
    pub username: Option<String>,
}

impl SessionContext {
    pub fn new(session_id: SessionId, peer_addr: SocketAddr) -> Self {
        Self {
            session_id,
            peer_addr,
            username: None,
        }
    }
}

/// Creates the command that serves one named subsystem channel.
#[async_trait]
pub trait SubsystemFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Prepare a command for a freshly requested channel.
    ///
    /// An error here is reported to the client as a failed subsystem request.
    async fn create(&self, context: &SessionContext)
        -> Result<Box<dyn SubsystemCommand>, BridgeError>;
}

/// Serves one subsystem channel until either side is done.
#[async_trait]
pub trait SubsystemCommand: Send {
    async fn run(self: Box<Self>, channel: ClientChannel) -> Result<RelaySummary, BridgeError>;
}

/// What the proxy hands a transport when it binds.
#[derive(Clone)]
pub struct TransportSettings {
    /// Cipher names left after the cipher policy ran, in preference order.
    pub ciphers: Vec<String>,
    pub authenticator: AuthenticationAdapter,
    pub host_keys: Vec<PrivateKey>,
    pub properties: TransportProperties,
    pub subsystems: Vec<Arc<dyn SubsystemFactory>>,
    /// Service the transport runs its per-session work on.
    pub io: AsyncIoService,
}

impl TransportSettings {
    pub fn subsystem(&self, name: &str) -> Option<Arc<dyn SubsystemFactory>> {
        self.subsystems.iter().find(|s| s.name() == name).cloned()
    }
}

impl std::fmt::Debug for TransportSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSettings")
            .field("ciphers", &self.ciphers)
            .field("host_keys", &self.host_keys.len())
            .field("properties", &self.properties)
            .field(
                "subsystems",
                &self.subsystems.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// A secure transport server implementation.
pub trait SecureTransport: Send + Sync + 'static {
    /// Cipher names the transport offers before any policy is applied.
    fn cipher_names(&self) -> Vec<String>;

    /// Build the handler that runs the transport over accepted connections.
    fn session_handler(
        &self,
        settings: TransportSettings,
    ) -> Result<Arc<dyn IoHandler>, TransportError>;
}
