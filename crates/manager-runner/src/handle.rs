//! Scoped ownership of a created container.

use crate::engine::{ContainerEngine, ContainerId, RemoveOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

struct Inner {
    engine: Arc<dyn ContainerEngine>,
    id: ContainerId,
    removed: AtomicBool,
}

impl Inner {
    async fn remove(&self) -> bool {
        if self.removed.swap(true, Ordering::SeqCst) {
            return false;
        }

        // Best-effort: a failed removal must never mask the run's own error.
        match self
            .engine
            .remove_container(&self.id, RemoveOptions::forced())
            .await
        {
            Ok(()) => debug!(container = %self.id.short(), "container removed"),
            Err(err) => warn!(
                container = %self.id.short(),
                error = %err,
                "failed to remove container"
            ),
        }
        true
    }
}

/// Owns a created container until it has been force-removed exactly once.
///
/// Removal happens through [`ContainerHandle::remove`] or any
/// [`ContainerRemover`] obtained from the handle; whichever runs first wins
/// and later calls are no-ops. If the handle is dropped without removal (for
/// example when the run future is abandoned) the removal is spawned on the
/// current tokio runtime.
pub struct ContainerHandle {
    inner: Arc<Inner>,
}

impl ContainerHandle {
    pub fn new(engine: Arc<dyn ContainerEngine>, id: ContainerId) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                id,
                removed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &ContainerId {
        &self.inner.id
    }

    pub fn engine(&self) -> &dyn ContainerEngine {
        self.inner.engine.as_ref()
    }

    pub fn is_removed(&self) -> bool {
        self.inner.removed.load(Ordering::SeqCst)
    }

    pub fn remover(&self) -> ContainerRemover {
        ContainerRemover {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Force-remove the container (with volumes). Returns `true` if this call
    /// performed the removal.
    pub async fn remove(&self) -> bool {
        self.inner.remove().await
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.is_removed() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            runtime.spawn(async move {
                inner.remove().await;
            });
        } else {
            warn!(
                container = %self.inner.id.short(),
                "container handle dropped outside a runtime; container was not removed"
            );
        }
    }
}

/// Shared removal capability handed to the cancellation watcher.
#[derive(Clone)]
pub struct ContainerRemover {
    inner: Arc<Inner>,
}

impl ContainerRemover {
    pub fn id(&self) -> &ContainerId {
        &self.inner.id
    }

    pub async fn remove(&self) -> bool {
        self.inner.remove().await
    }
}
