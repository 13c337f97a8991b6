//! Proxy server lifecycle

use std::net::SocketAddr;
use std::sync::Arc;

use ncproxy_transport::{Acceptor, AsyncIoService, CloseMode, TransportError};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::auth::AuthenticationAdapter;
use crate::bridge::SessionBridgeFactory;
use crate::cipher::CipherPolicy;
use crate::config::{ConfigError, ProxyConfiguration, TransportProperties};
use crate::keys::KeyError;
use crate::ssh::RusshTransport;
use crate::transport::{SecureTransport, TransportSettings};

/// Proxy server errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Host key error: {0}")]
    HostKey(#[from] KeyError),

    #[error("Failed to create I/O resources: {0}")]
    ResourceCreation(#[source] TransportError),

    #[error("{0}")]
    Bind(#[source] TransportError),

    #[error("Transport setup failed: {0}")]
    Transport(#[source] TransportError),

    #[error("Proxy server is already bound to {0}")]
    AlreadyBound(SocketAddr),

    #[error("Proxy server is closed")]
    Closed,

    #[error("Shutdown interrupted: {0}")]
    ShutdownInterrupted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Bound,
    Closed,
}

enum Lifecycle {
    Created,
    Bound(BoundServer),
    Closed,
}

struct BoundServer {
    io: AsyncIoService,
    acceptor: Acceptor,
    local_addr: SocketAddr,
}

/// SSH-terminating proxy that bridges `netconf` subsystem channels to a
/// backend.
///
/// The worker pool is supplied by the caller and is never shut down by the
/// proxy. A server binds at most once; after [`close`](Self::close) it stays
/// closed.
pub struct ProxyServer<T: SecureTransport = RusshTransport> {
    transport: T,
    worker_pool: Handle,
    cipher_policy: CipherPolicy,
    lifecycle: Mutex<Lifecycle>,
}

impl<T: SecureTransport> ProxyServer<T> {
    pub fn new(transport: T, worker_pool: Handle) -> Self {
        Self {
            transport,
            worker_pool,
            cipher_policy: CipherPolicy::default(),
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    pub fn with_cipher_policy(mut self, policy: CipherPolicy) -> Self {
        self.cipher_policy = policy;
        self
    }

    pub async fn state(&self) -> ServerState {
        match &*self.lifecycle.lock().await {
            Lifecycle::Created => ServerState::Created,
            Lifecycle::Bound(_) => ServerState::Bound,
            Lifecycle::Closed => ServerState::Closed,
        }
    }

    /// Actual listening address while bound.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lifecycle.lock().await {
            Lifecycle::Bound(bound) => Some(bound.local_addr),
            _ => None,
        }
    }

    /// Configure the transport and start listening.
    ///
    /// On failure nothing stays allocated and the server remains `Created`.
    pub async fn bind(&self, config: &ProxyConfiguration) -> Result<(), ProxyError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match &*lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Bound(bound) => return Err(ProxyError::AlreadyBound(bound.local_addr)),
            Lifecycle::Closed => return Err(ProxyError::Closed),
        }

        let properties = TransportProperties::from_config(config)?;
        let ciphers = self.cipher_policy.filtered(self.transport.cipher_names());
        let host_keys = config.key_pair_provider.load_keys()?;

        let io = AsyncIoService::new(self.worker_pool.clone()).map_err(ProxyError::ResourceCreation)?;
        let connector = io
            .create_connector()
            .with_connect_timeout(properties.connect_timeout);
        let bridge = SessionBridgeFactory::new(config.backend_address, connector);

        let settings = TransportSettings {
            ciphers,
            authenticator: AuthenticationAdapter::new(Arc::clone(&config.authenticator)),
            host_keys,
            properties,
            subsystems: vec![Arc::new(bridge)],
            io: io.clone(),
        };
        debug!(?settings, "Configuring secure transport");

        let handler = match self.transport.session_handler(settings) {
            Ok(handler) => handler,
            Err(e) => {
                io.close(CloseMode::Immediate).await;
                return Err(ProxyError::Transport(e));
            }
        };

        let acceptor = io.create_acceptor(handler);
        let local_addr = match acceptor.bind(config.binding_address).await {
            Ok(addr) => addr,
            Err(e) => {
                io.close(CloseMode::Immediate).await;
                return Err(ProxyError::Bind(e));
            }
        };

        info!(
            %local_addr,
            backend = %config.backend_address,
            "Proxy server bound"
        );
        *lifecycle = Lifecycle::Bound(BoundServer {
            io,
            acceptor,
            local_addr,
        });
        Ok(())
    }

    /// Stop listening, end every session and release the I/O service.
    ///
    /// Closing an unbound or already closed server is a no-op.
    pub async fn close(&self) -> Result<(), ProxyError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let previous = std::mem::replace(&mut *lifecycle, Lifecycle::Closed);
        let Lifecycle::Bound(bound) = previous else {
            debug!("Proxy server not bound, nothing to release");
            return Ok(());
        };

        info!(local_addr = %bound.local_addr, "Closing proxy server");
        let unbound = bound.acceptor.unbind().await;
        bound.io.close(CloseMode::Immediate).await;

        unbound.map_err(|e| ProxyError::ShutdownInterrupted(e.to_string()))
    }
}

impl<T: SecureTransport> Drop for ProxyServer<T> {
    fn drop(&mut self) {
        if let Lifecycle::Bound(bound) = self.lifecycle.get_mut() {
            debug!(local_addr = %bound.local_addr, "Proxy server dropped while bound");
            bound.io.group().shutdown_now();
        }
    }
}
