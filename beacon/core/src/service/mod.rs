use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Long-running background services that support graceful shutdown.
pub trait Daemon: Send {
    fn shutdown_handle(&self) -> ShutdownHandle;

    fn start(self);
}

/// A type for background running services to detect cancellation requests made to them via
/// [`ShutdownHandle`], and for them to signal they've ended execution, either through such a
/// requested shutdown, voluntary exit or an unrecoverable failure.
#[derive(Debug, Default)]
pub struct FinishHandle {
    cancellation: CancellationToken,
    finish: CancellationToken,
    failure: Arc<OnceLock<String>>,
}

/// A type for requesting cancellation of background running services and waiting for them to have
/// ended execution.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    cancellation: CancellationToken,
    finish: CancellationToken,
    failure: Arc<OnceLock<String>>,
}

impl FinishHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            cancellation: self.cancellation.clone(),
            finish: self.finish.clone(),
            failure: self.failure.clone(),
        }
    }

    /// Token cancelled once shutdown is requested. Handed to sub-tasks that need to stop at their
    /// next safe point.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Signals that the service has finish executing.
    pub fn finish(&self) {
        self.finish.cancel();
    }

    /// Records an unrecoverable failure and signals that the service has finished.
    pub fn fail<S: Into<String>>(&self, reason: S) {
        let _ = self.failure.set(reason.into());
        self.finish.cancel();
    }

    /// Checks whether any shutdown request has been made via [`ShutdownHandle::shutdown`].
    pub fn is_shutdown_requested(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Waits asynchronously for a shutdown request to be made via [`ShutdownHandle::shutdown`].
    pub async fn shutdown_requested(&self) {
        self.cancellation.cancelled().await
    }
}

impl ShutdownHandle {
    /// Request a shutdown without waiting for the process to finish.
    ///
    /// Call [`ShutdownHandle::finished`] to wait for the process to finish.
    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }

    /// Waits asynchronously for the service to finish execution, either through a requested
    /// shutdown or voluntary exit.
    pub async fn finished(&self) {
        self.finish.cancelled().await
    }

    /// The reason the service stopped on its own, if it did so because of a fatal error.
    pub fn failure(&self) -> Option<&str> {
        self.failure.get().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_and_finish_roundtrip() {
        let finish = FinishHandle::new();
        let handle = finish.shutdown_handle();
        assert!(!finish.is_shutdown_requested());

        handle.shutdown();
        finish.shutdown_requested().await;
        assert!(finish.cancellation_token().is_cancelled());

        finish.finish();
        handle.finished().await;
        assert!(handle.failure().is_none());
    }

    #[tokio::test]
    async fn failure_is_visible_to_handles() {
        let finish = FinishHandle::new();
        let handle = finish.shutdown_handle();

        finish.fail("rpc endpoints unreachable");
        handle.finished().await;
        assert_eq!(handle.failure(), Some("rpc endpoints unreachable"));
    }
}
