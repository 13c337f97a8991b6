//! The channel group: one shared resource binding the worker pool to every
//! acceptor, connector and relay task of a proxy instance.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::{TransportError, TransportResult};

/// Tracks all tasks spawned on the injected worker pool and cancels them
/// together.
///
/// The group never owns the runtime behind `handle`; shutting the group down
/// only cancels and waits for the tasks it spawned.
#[derive(Debug)]
pub struct ChannelGroup {
    handle: Handle,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    draining: CancellationToken,
}

impl ChannelGroup {
    /// Bind a new group to an existing worker pool.
    ///
    /// Only multi-threaded runtimes qualify: a current-thread runtime makes
    /// progress only while its owner is blocked on it, which cannot back a
    /// pool shared by every connection.
    pub fn with_runtime(handle: Handle) -> TransportResult<Self> {
        match handle.runtime_flavor() {
            RuntimeFlavor::MultiThread => {}
            flavor => {
                return Err(TransportError::ChannelGroup(format!(
                    "worker pool must be a multi-threaded runtime (got {:?})",
                    flavor
                )));
            }
        }

        Ok(Self {
            handle,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            draining: CancellationToken::new(),
        })
    }

    /// Runtime handle the group spawns onto.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Token cancelled when the group is shut down immediately.
    pub fn token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Token cancelled as soon as the group stops taking new work, graceful
    /// or not. Accept loops stop on it.
    pub fn drain_token(&self) -> CancellationToken {
        self.draining.clone()
    }

    /// Spawn a task tracked by this group.
    ///
    /// The task is dropped at its next suspension point once
    /// [`shutdown_now`](Self::shutdown_now) runs.
    pub fn spawn<F>(&self, task: F) -> TransportResult<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(TransportError::GroupShutdown);
        }

        let shutdown = self.shutdown.clone();
        Ok(self.tracker.spawn_on(
            async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = task => {}
                }
            },
            &self.handle,
        ))
    }

    /// Refuse new tasks; running ones continue.
    pub fn shutdown(&self) {
        self.draining.cancel();
        self.tracker.close();
    }

    /// Refuse new tasks and cancel every running one.
    pub fn shutdown_now(&self) {
        self.shutdown();
        if !self.shutdown.is_cancelled() {
            debug!(active = self.tracker.len(), "Cancelling channel group tasks");
        }
        self.shutdown.cancel();
    }

    /// Wait for every tracked task to finish, up to `timeout`.
    ///
    /// Returns `true` when the group terminated in time.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }

    pub fn is_shutdown(&self) -> bool {
        self.draining.is_cancelled()
    }

    pub fn is_terminated(&self) -> bool {
        self.tracker.is_closed() && self.tracker.is_empty()
    }

    /// Number of tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_group_runs_tasks_on_pool() {
        let group = ChannelGroup::with_runtime(Handle::current()).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        let handle = group
            .spawn(async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        handle.await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!group.is_shutdown());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_group_rejects_current_thread_runtime() {
        let result = ChannelGroup::with_runtime(Handle::current());
        assert!(matches!(result, Err(TransportError::ChannelGroup(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_now_cancels_pending_tasks() {
        let group = ChannelGroup::with_runtime(Handle::current()).unwrap();

        group
            .spawn(std::future::pending::<()>())
            .expect("spawn before shutdown");
        assert_eq!(group.active_tasks(), 1);

        group.shutdown_now();
        assert!(group.await_termination(Duration::from_secs(5)).await);
        assert!(group.is_terminated());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawn_after_shutdown_fails() {
        let group = ChannelGroup::with_runtime(Handle::current()).unwrap();
        group.shutdown();

        let result = group.spawn(async {});
        assert!(matches!(result, Err(TransportError::GroupShutdown)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_graceful_shutdown_lets_tasks_finish() {
        let group = ChannelGroup::with_runtime(Handle::current()).unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let d = done.clone();
        group
            .spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                d.store(true, Ordering::SeqCst);
            })
            .unwrap();

        group.shutdown();
        assert!(group.await_termination(Duration::from_secs(5)).await);
        assert!(done.load(Ordering::SeqCst));
    }
}
