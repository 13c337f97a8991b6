//! Shared asynchronous I/O service for the proxy
//!
//! This crate owns the plumbing between a caller-supplied worker pool and every
//! socket the proxy touches. Acceptors and connectors never build their own
//! runtime: they all hang off a single [`ChannelGroup`] that wraps the injected
//! `tokio::runtime::Handle`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Caller (composition root)                │
//! │        builds the runtime, owns its lifetime             │
//! └─────────────────────────────────────────────────────────┘
//!                           │ Handle
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │                AsyncIoService (this crate)               │
//! │   ChannelGroup = TaskTracker + CancellationToken         │
//! └─────────────────────────────────────────────────────────┘
//!             │                               │
//!             ↓                               ↓
//!   ┌──────────────────┐            ┌──────────────────┐
//!   │ Acceptor         │            │ Connector        │
//!   │ (listen + accept)│            │ (backend dial)   │
//!   └──────────────────┘            └──────────────────┘
//! ```
//!
//! Closing the service cancels every tracked task and waits a bounded amount
//! of time for them to finish. The runtime itself is never shut down here.

mod acceptor;
mod connector;
mod group;
mod service;
mod session;

pub use acceptor::Acceptor;
pub use connector::{Connector, DEFAULT_CONNECT_TIMEOUT};
pub use group::ChannelGroup;
pub use service::{AsyncIoService, CloseMode, CLOSE_TIMEOUT};
pub use session::{IoSession, SessionId, SessionIdGenerator};

use async_trait::async_trait;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Channel group could not be created: {0}")]
    ChannelGroup(String),

    #[error("Channel group has been shut down")]
    GroupShutdown,

    #[error("Acceptor is already bound to {0}")]
    AlreadyBound(std::net::SocketAddr),

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Receives every connection produced by an [`Acceptor`].
///
/// The handler runs inside a task tracked by the channel group, so it is
/// cancelled when the service closes. Implementations that run their own
/// protocol on top of the raw stream (an SSH server, a test double) live
/// behind this trait.
#[async_trait]
pub trait IoHandler: Send + Sync + 'static {
    /// Drive one accepted connection until it ends.
    async fn session_created(&self, session: IoSession) -> TransportResult<()>;
}
