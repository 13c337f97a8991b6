//! Listening side of the I/O service

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::session::IoSession;
use crate::{AsyncIoService, IoHandler, TransportError, TransportResult};

const BIND_ATTEMPTS: u32 = 3;

/// Pause after a failed `accept()` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts TCP connections on the shared channel group and hands each one to
/// an [`IoHandler`].
pub struct Acceptor {
    service: AsyncIoService,
    handler: Arc<dyn IoHandler>,
    bound: Mutex<Option<BoundListener>>,
}

struct BoundListener {
    local_addr: SocketAddr,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Acceptor {
    pub(crate) fn new(service: AsyncIoService, handler: Arc<dyn IoHandler>) -> Self {
        Self {
            service,
            handler,
            bound: Mutex::new(None),
        }
    }

    fn bound(&self) -> MutexGuard<'_, Option<BoundListener>> {
        self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Address the acceptor is listening on, if bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound().as_ref().map(|b| b.local_addr)
    }

    pub fn is_bound(&self) -> bool {
        self.bound().is_some()
    }

    /// Open the listening socket and start accepting.
    ///
    /// Returns the actual bound address (meaningful when `addr` uses port 0).
    pub async fn bind(&self, addr: SocketAddr) -> TransportResult<SocketAddr> {
        if let Some(existing) = self.local_addr() {
            return Err(TransportError::AlreadyBound(existing));
        }

        let listener = self.bind_with_retry(addr).await?;
        let local_addr = listener.local_addr()?;

        let stop = self.service.group().drain_token().child_token();
        let task = self.service.spawn(accept_loop(
            listener,
            self.service.clone(),
            Arc::clone(&self.handler),
            stop.clone(),
        ))?;

        let mut bound = self.bound();
        if let Some(existing) = bound.as_ref() {
            // Lost a race with a concurrent bind
            stop.cancel();
            return Err(TransportError::AlreadyBound(existing.local_addr));
        }
        *bound = Some(BoundListener {
            local_addr,
            stop,
            task,
        });

        info!(%local_addr, "Listening for connections");
        Ok(local_addr)
    }

    /// Stop accepting and close the listening socket.
    ///
    /// Connections already handed to the handler are left alone; they end with
    /// the channel group. Unbinding an unbound acceptor is a no-op.
    pub async fn unbind(&self) -> TransportResult<()> {
        let Some(bound) = self.bound().take() else {
            return Ok(());
        };

        bound.stop.cancel();
        match bound.task.await {
            Ok(()) => {
                info!(local_addr = %bound.local_addr, "Stopped listening");
                Ok(())
            }
            Err(e) => Err(TransportError::Interrupted(format!(
                "accept loop on {} did not stop cleanly: {}",
                bound.local_addr, e
            ))),
        }
    }

    async fn bind_with_retry(&self, addr: SocketAddr) -> TransportResult<TcpListener> {
        // Retry bind logic to handle TIME_WAIT state gracefully
        for attempt in 1..=BIND_ATTEMPTS {
            match self.bind_on_pool(addr) {
                Ok(listener) => {
                    if attempt > 1 {
                        info!(
                            "Successfully bound to {} on attempt {}/{}",
                            addr, attempt, BIND_ATTEMPTS
                        );
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                    warn!(
                        "Port {} is in use (attempt {}/{}, may be in TIME_WAIT state), retrying in 1 second...",
                        addr.port(),
                        attempt,
                        BIND_ATTEMPTS
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    return Err(TransportError::Bind {
                        address: addr.ip().to_string(),
                        port: addr.port(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(TransportError::Bind {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: format!("Address in use after {} attempts", BIND_ATTEMPTS),
        })
    }

    /// Bind so the listener is registered with the pool's reactor rather than
    /// whichever runtime the caller happens to be on.
    fn bind_on_pool(&self, addr: SocketAddr) -> std::io::Result<TcpListener> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let _guard = self.service.group().handle().enter();
        TcpListener::from_std(listener)
    }
}

/// Source of inbound connections for the accept loop.
#[async_trait]
trait ConnectionSource: Send + Sync + 'static {
    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl ConnectionSource for TcpListener {
    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

async fn accept_loop<L: ConnectionSource>(
    listener: L,
    service: AsyncIoService,
    handler: Arc<dyn IoHandler>,
    stop: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                // Errors such as EMFILE persist until something is released
                error!("Failed to accept connection: {}", e);
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => continue,
                }
            }
        };

        let id = service.next_session_id();
        debug!(session = %id, %peer_addr, "Accepted connection");

        let session = match IoSession::new(id, stream, service.group().token()) {
            Ok(session) => session,
            Err(e) => {
                warn!(session = %id, %peer_addr, "Dropping connection: {}", e);
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        let spawned = service.spawn(async move {
            match handler.session_created(session).await {
                Ok(()) => debug!(session = %id, %peer_addr, "Session closed"),
                Err(e) => warn!(session = %id, %peer_addr, "Session ended with error: {}", e),
            }
        });
        if let Err(e) = spawned {
            debug!(session = %id, %peer_addr, "Dropping connection: {}", e);
        }
    }

    debug!("Accept loop stopped");
}
