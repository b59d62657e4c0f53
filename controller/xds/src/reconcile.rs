//! Applies desired-state revisions to the snapshot caches.

use crate::listener::{self, ListenerCache, ListenerPolicy};
use parapet_controller_core::Vertex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Runs the reconciliation loop.
///
/// Each revision is synthesized and installed with one atomic replace.
/// Synthesis runs strictly one at a time; a burst of revisions coalesces to
/// the latest, since a superseded intermediate need never reach the cache.
/// Returns when the producer side of the revision channel closes.
pub async fn run(
    policy: ListenerPolicy,
    listeners: Arc<ListenerCache>,
    mut revisions: watch::Receiver<Arc<Vertex>>,
) {
    loop {
        let root = revisions.borrow_and_update().clone();
        let resources = listener::synthesize(&root, &policy);
        debug!(listeners = resources.len(), "installing snapshot");
        listeners.replace(resources);

        if revisions.changed().await.is_err() {
            debug!("desired-state producer closed; reconciliation stopping");
            return;
        }
    }
}
