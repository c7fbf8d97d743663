//! Run scope for background tasks
//!
//! A [`RunScope`] owns the lifetime of every background task spawned through
//! it. Shutdown cancels the scope's token and then waits for all tasks to
//! finish, periodically warning if quiescence takes longer than expected.
//! Every long-lived task in the gateway and agent is spawned through a scope
//! so that process shutdown can join them deterministically.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

/// Owns cancellation and join handles for a group of background tasks
#[derive(Clone, Debug)]
pub struct RunScope {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl RunScope {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// The cancellation token observed by tasks in this scope
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether shutdown has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Spawn a task tracked by this scope
    pub fn spawn<F>(&self, fut: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(fut)
    }

    /// Cancel the scope and wait for every tracked task to finish
    ///
    /// When `warn_after` is set, a warning is logged each time that duration
    /// elapses without the scope reaching quiescence.
    pub async fn shutdown(&self, warn_after: Option<Duration>) {
        self.cancel.cancel();
        self.tracker.close();

        match warn_after {
            None => self.tracker.wait().await,
            Some(period) => loop {
                tokio::select! {
                    _ = self.tracker.wait() => break,
                    _ = tokio::time::sleep(period) => {
                        warn!(
                            pending_tasks = self.tracker.len(),
                            "waiting longer than expected for background tasks to stop"
                        );
                    }
                }
            },
        }
    }
}

impl Default for RunScope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn shutdown_waits_for_spawned_tasks() {
        let scope = RunScope::new();
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        let cancel = scope.cancellation_token();
        scope.spawn(async move {
            cancel.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        });

        scope.shutdown(None).await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(scope.is_cancelled());
    }

    #[tokio::test]
    async fn tasks_observe_cancellation_promptly() {
        let scope = RunScope::new();
        let cancel = scope.cancellation_token();
        let handle = scope.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => "cancelled",
                _ = tokio::time::sleep(Duration::from_secs(60)) => "timed out",
            }
        });

        scope.shutdown(Some(Duration::from_secs(5))).await;
        assert_eq!(handle.await.unwrap(), "cancelled");
    }

    #[tokio::test]
    async fn shutdown_with_no_tasks_returns_immediately() {
        let scope = RunScope::new();
        scope.shutdown(Some(Duration::from_millis(10))).await;
    }
}
