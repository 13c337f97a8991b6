//! AsyncIoService: acceptor/connector factory sharing one channel group

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::session::{SessionId, SessionIdGenerator};
use crate::{Acceptor, ChannelGroup, Connector, IoHandler, TransportResult};

/// Upper bound on how long [`AsyncIoService::close`] waits for the channel
/// group to terminate.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How [`AsyncIoService::close`] treats in-flight work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Stop taking new work and let running tasks drain, escalating to
    /// `Immediate` after [`CLOSE_TIMEOUT`].
    Graceful,
    /// Cancel every running task now.
    Immediate,
}

/// Produces acceptors and connectors that all run on one injected worker pool.
///
/// Cheap to clone; every clone refers to the same channel group.
#[derive(Clone, Debug)]
pub struct AsyncIoService {
    inner: Arc<ServiceInner>,
}

#[derive(Debug)]
struct ServiceInner {
    group: ChannelGroup,
    session_ids: SessionIdGenerator,
    closed: AtomicBool,
}

impl AsyncIoService {
    /// Wrap the caller's worker pool in a fresh channel group.
    ///
    /// The pool stays owned by the caller and outlives this service.
    pub fn new(pool: Handle) -> TransportResult<Self> {
        let group = ChannelGroup::with_runtime(pool)?;
        Ok(Self {
            inner: Arc::new(ServiceInner {
                group,
                session_ids: SessionIdGenerator::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Create an acceptor that hands every accepted connection to `handler`.
    pub fn create_acceptor(&self, handler: Arc<dyn IoHandler>) -> Acceptor {
        Acceptor::new(self.clone(), handler)
    }

    /// Create a connector for outbound connections.
    pub fn create_connector(&self) -> Connector {
        Connector::new(self.clone())
    }

    /// Spawn a task tracked by the channel group.
    pub fn spawn<F>(&self, task: F) -> TransportResult<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.group.spawn(task)
    }

    pub fn group(&self) -> &ChannelGroup {
        &self.inner.group
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        self.inner.session_ids.generate()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Release the channel group.
    ///
    /// Terminal and idempotent: only the first call does any work, and a
    /// group that fails to terminate within [`CLOSE_TIMEOUT`] is logged and
    /// abandoned rather than reported.
    pub async fn close(&self, mode: CloseMode) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("I/O service already closed");
            return;
        }

        let group = &self.inner.group;

        if mode == CloseMode::Graceful {
            group.shutdown();
            if group.await_termination(CLOSE_TIMEOUT).await {
                debug!("Channel group drained");
                return;
            }
            debug!(
                active = group.active_tasks(),
                "Channel group did not drain within {:?}, forcing shutdown", CLOSE_TIMEOUT
            );
        }

        group.shutdown_now();
        if group.await_termination(CLOSE_TIMEOUT).await {
            debug!("Channel group terminated");
        } else {
            debug!(
                active = group.active_tasks(),
                "Channel group did not terminate within {:?}", CLOSE_TIMEOUT
            );
        }
    }
}
