//! Cooperative cancellation shared by every stage of a run.

use std::sync::Arc;

use tokio::sync::watch;

/// A cloneable cancellation flag.
///
/// Stages stop pulling new input once [`cancel`](RunControl::cancel) is
/// called; in-flight work gets a grace period before it is aborted.
#[derive(Clone, Debug)]
pub struct RunControl {
    tx: Arc<watch::Sender<bool>>,
}

impl RunControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the run is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// A control that is cancelled whenever `self` is, and can also be
    /// cancelled on its own. The returned handle stops forwarding when
    /// dropped.
    pub fn child(&self) -> (RunControl, ChildLink) {
        let child = RunControl::new();
        let parent = self.clone();
        let forward = child.clone();
        let task = tokio::spawn(async move {
            parent.cancelled().await;
            forward.cancel();
        });
        (child, ChildLink { task })
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a parent-to-child cancellation link alive.
pub struct ChildLink {
    task: tokio::task::JoinHandle<()>,
}

impl Drop for ChildLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}
