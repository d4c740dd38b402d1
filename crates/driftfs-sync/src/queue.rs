//! Bounded two-level work queue
//!
//! Feeds the transfer pipelines: foreground entries (a user is waiting)
//! always pop before background entries, the total is bounded, and a node
//! is never queued twice.

use std::collections::VecDeque;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use driftfs_core::domain::{DriftError, NodeId};

use crate::scheduler::Priority;

#[derive(Debug, Default)]
struct QueueInner {
    high: VecDeque<NodeId>,
    low: VecDeque<NodeId>,
}

/// Bounded priority queue of node ids
pub struct WorkQueue {
    inner: std::sync::Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: std::sync::Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueues a node; re-queueing a pending node is a no-op, overflow is
    /// an error
    pub fn push(&self, node: NodeId, priority: Priority) -> Result<(), DriftError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.high.contains(&node) || inner.low.contains(&node) {
            return Ok(());
        }
        if inner.high.len() + inner.low.len() >= self.capacity {
            return Err(DriftError::Validation(format!(
                "work queue full ({} pending)",
                self.capacity
            )));
        }
        match priority {
            Priority::Foreground => inner.high.push_back(node),
            Priority::Background => inner.low.push_back(node),
        }
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Pops the next node, foreground first; `None` once `shutdown` fires
    pub async fn pop(&self, shutdown: &CancellationToken) -> Option<NodeId> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(node) = inner.high.pop_front().or_else(|| inner.low.pop_front()) {
                    return Some(node);
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.high.len() + inner.low.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
