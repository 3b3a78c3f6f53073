//! Operator interrupt handling for a single run.

use crate::error::RunError;
use crate::handle::ContainerRemover;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Source of operator interrupts. Each call to `listen` yields a fresh
/// future that resolves when the operator asks to stop.
pub trait InterruptSource: Send + Sync {
    fn listen(&self) -> BoxFuture<'static, ()>;
}

/// SIGINT (Ctrl+C) and, on unix, SIGTERM.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSignals;

impl InterruptSource for OsSignals {
    fn listen(&self) -> BoxFuture<'static, ()> {
        Box::pin(shutdown_signal())
    }
}

/// Never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInterrupts;

impl InterruptSource for NoInterrupts {
    fn listen(&self) -> BoxFuture<'static, ()> {
        Box::pin(std::future::pending())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Single-shot listener active for the duration of one run.
///
/// On the first interrupt it cancels the run token and force-removes the
/// container. It fires at most once and stops listening as soon as the run
/// calls [`CancellationWatcher::stop`] or drops the watcher.
pub struct CancellationWatcher {
    cancelled: CancellationToken,
    finished: CancellationToken,
    task: JoinHandle<()>,
}

impl CancellationWatcher {
    pub fn spawn(interrupt: BoxFuture<'static, ()>, container: ContainerRemover) -> Self {
        let cancelled = CancellationToken::new();
        let finished = CancellationToken::new();

        let task = tokio::spawn({
            let cancelled = cancelled.clone();
            let finished = finished.clone();
            async move {
                tokio::select! {
                    _ = interrupt => {
                        warn!(container = %container.id().short(), "interrupt received; removing container");
                        cancelled.cancel();
                        container.remove().await;
                    }
                    _ = finished.cancelled() => {
                        debug!(container = %container.id().short(), "run finished; interrupt watcher stopped");
                    }
                }
            }
        });

        Self {
            cancelled,
            finished,
            task,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// Await `fut`, bailing out with [`RunError::Cancelled`] as soon as the
    /// run is cancelled.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T, RunError>
    where
        F: Future<Output = Result<T, RunError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled.cancelled() => Err(RunError::Cancelled),
            res = fut => res,
        }
    }

    /// Stop listening. An interrupt already being handled runs to completion.
    pub fn stop(&self) {
        self.finished.cancel();
    }

    /// Give an in-flight interrupt handler up to `grace` to finish its removal.
    pub async fn wait_for_cleanup(&mut self, grace: Duration) {
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "interrupt handler did not finish within the grace window"
            );
        }
    }
}

impl Drop for CancellationWatcher {
    fn drop(&mut self) {
        self.finished.cancel();
    }
}
