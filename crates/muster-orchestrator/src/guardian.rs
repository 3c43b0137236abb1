use muster_mcp::ToolProvider;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Identifies one tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "res-{}", self.0)
    }
}

struct Tracked {
    id: ResourceId,
    name: String,
    handle: Weak<dyn ToolProvider>,
}

/// Tracks every provider handle opened during a run and closes them on
/// request, newest first.
///
/// Holds weak references only: connections own their handles, the guardian
/// merely guarantees nothing that is still alive is left open.
pub struct ResourceGuardian {
    entries: parking_lot::Mutex<Vec<Tracked>>,
    next_id: AtomicU64,
    shutdown_timeout: Duration,
}

impl ResourceGuardian {
    /// `shutdown_timeout` bounds each individual close.
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            entries: parking_lot::Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            shutdown_timeout,
        }
    }

    /// Start tracking `handle`.
    pub fn track(&self, handle: &Arc<dyn ToolProvider>) -> ResourceId {
        let id = ResourceId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.entries.lock().push(Tracked {
            id,
            name: handle.name().to_string(),
            handle: Arc::downgrade(handle),
        });
        debug!(server = %handle.name(), resource = %id, "Tracking provider resource");
        id
    }

    /// Close and forget one resource. Returns whether it was still tracked.
    pub async fn release_one(&self, id: ResourceId) -> bool {
        let tracked = {
            let mut entries = self.entries.lock();
            entries
                .iter()
                .position(|t| t.id == id)
                .map(|pos| entries.remove(pos))
        };
        match tracked {
            Some(tracked) => {
                self.close_tracked(tracked).await;
                true
            }
            None => false,
        }
    }

    /// Close every tracked resource in reverse acquisition order.
    ///
    /// Returns how many entries were released; a second call returns 0.
    pub async fn release_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.entries.lock());
        let count = drained.len();
        if count > 0 {
            info!(resources = count, "Releasing provider resources");
        }
        for tracked in drained.into_iter().rev() {
            self.close_tracked(tracked).await;
        }
        count
    }

    /// Number of resources currently tracked.
    pub fn tracked_count(&self) -> usize {
        self.entries.lock().len()
    }

    async fn close_tracked(&self, tracked: Tracked) {
        let Some(handle) = tracked.handle.upgrade() else {
            debug!(server = %tracked.name, resource = %tracked.id, "Resource already dropped");
            return;
        };
        if handle.is_closed() {
            return;
        }
        match tokio::time::timeout(self.shutdown_timeout, handle.close()).await {
            Ok(Ok(())) => debug!(server = %tracked.name, resource = %tracked.id, "Resource released"),
            Ok(Err(e)) => warn!(server = %tracked.name, error = %e, "Error closing provider"),
            Err(_) => warn!(
                server = %tracked.name,
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "Timed out closing provider"
            ),
        }
    }
}

impl std::fmt::Debug for ResourceGuardian {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuardian")
            .field("tracked", &self.tracked_count())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}
