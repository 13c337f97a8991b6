//! SSH-terminating NETCONF proxy
//!
//! [`ProxyServer`] listens for SSH clients, checks their passwords through a
//! caller-supplied [`PasswordAuthenticator`](ncproxy_auth::PasswordAuthenticator)
//! and bridges every `netconf` subsystem channel byte-for-byte to a backend
//! TCP address.
//!
//! ```text
//!  SSH client ──► Acceptor ──► RusshTransport ──► SessionBridge ──► backend
//!                    │              │                   │
//!                    └──────── AsyncIoService (caller's worker pool) ─┘
//! ```
//!
//! The proxy never builds its own runtime. The composition root passes a
//! `tokio::runtime::Handle` to [`ProxyServer::new`] and keeps ownership of it.

pub mod auth;
pub mod bridge;
pub mod cipher;
pub mod config;
pub mod keys;
pub mod server;
pub mod ssh;
pub mod transport;

pub use auth::AuthenticationAdapter;
pub use bridge::{
    BridgeError, BridgeState, RelayDirection, RelaySummary, SessionBridge, SessionBridgeFactory,
};
pub use cipher::CipherPolicy;
pub use config::{
    ConfigError, ProxyConfiguration, ProxyConfigurationBuilder, TransportProperties,
    DEFAULT_IDLE_TIMEOUT,
};
pub use keys::{FileKeyPairProvider, KeyError, KeyPairProvider, StaticKeyPairProvider};
pub use server::{ProxyError, ProxyServer, ServerState};
pub use ssh::{RusshTransport, SessionError};
pub use transport::{
    ChannelIo, ClientChannel, SecureTransport, SessionContext, SubsystemCommand,
    SubsystemFactory, TransportSettings,
};

/// Name of the only subsystem the proxy serves.
pub const NETCONF_SUBSYSTEM: &str = "netconf";
