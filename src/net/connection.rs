//! Context identity and live connection tracking.
//!
//! # Responsibilities
//! - Generate unique context IDs for log correlation
//! - Count accepted client connections for graceful shutdown
//! - Mirror the count into the `proxy_active_connections` gauge

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::observability::metrics;

/// Relaxed ordering is enough: only uniqueness matters.
static CONTEXT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connection context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub fn next() -> Self {
        Self(CONTEXT_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Counts client connections currently being served.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection. The returned guard decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        let now = self.active_count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_connections(now);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Waits until every tracked connection is gone or `deadline` elapses.
    /// Returns whether the drain completed.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let wait = async {
            while self.active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(deadline, wait).await.is_ok()
    }
}

#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let now = self.active_count.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_active_connections(now);
    }
}
