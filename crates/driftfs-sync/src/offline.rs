//! Offline operation
//!
//! Connectivity is watched two ways: passively, by classifying remote-call
//! failures against known offline patterns, and actively, by a periodic
//! lightweight probe. The filesystem stays read-write while OFFLINE; every
//! mutation lands in the persisted offline change queue (coalescing repeat
//! modifies), and the recovery driver replays the queue oldest-first once
//! the store is reachable again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driftfs_core::domain::{
    DriftError, ETag, ItemState, NodeId, OfflineChange, OfflineOpKind,
};
use driftfs_core::ports::graph::GraphClient;
use driftfs_graph::items;
use driftfs_store::{records, Store};

use crate::resolve;
use crate::upload::UploadPipeline;
use crate::SyncDeps;

/// How recent the last success must be for DEGRADED instead of OFFLINE
const DEGRADED_GRACE: std::time::Duration = std::time::Duration::from_secs(60);

/// Connectivity state of the mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// All pipelines run normally
    Online,
    /// Probes failing but the last success is recent; background work
    /// pauses, in-flight operations continue
    Degraded,
    /// Remote store unreachable; mutations queue as offline changes
    Offline,
}

// ============================================================================
// Connectivity monitor
// ============================================================================

/// Passive + active connectivity detection
pub struct ConnectivityMonitor {
    client: Arc<dyn GraphClient>,
    probe_interval: std::time::Duration,
    probe_timeout: std::time::Duration,
    state: watch::Sender<ConnState>,
    last_success: std::sync::Mutex<Option<Instant>>,
}

impl ConnectivityMonitor {
    pub fn new(
        client: Arc<dyn GraphClient>,
        probe_interval: std::time::Duration,
        probe_timeout: std::time::Duration,
    ) -> (Arc<Self>, watch::Receiver<ConnState>) {
        let (state, rx) = watch::channel(ConnState::Online);
        (
            Arc::new(Self {
                client,
                probe_interval,
                probe_timeout,
                state,
                last_success: std::sync::Mutex::new(None),
            }),
            rx,
        )
    }

    #[must_use]
    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    /// Matches an error against the known offline patterns
    ///
    /// Returns the pattern name for logging, or `None` when the failure
    /// does not look like lost connectivity.
    #[must_use]
    pub fn classify_offline(err: &DriftError) -> Option<&'static str> {
        let DriftError::Network(message) = err else {
            return None;
        };
        let message = message.to_ascii_lowercase();

        if message.contains("tls") && message.contains("timed out") {
            Some("tls-handshake-timeout")
        } else if message.contains("unreachable") {
            Some("host-unreachable")
        } else if message.contains("dns")
            || message.contains("name resolution")
            || message.contains("failed to lookup")
        {
            Some("name-resolution-failure")
        } else if message.contains("connection refused") {
            Some("connection-refused")
        } else if message.contains("timed out") || message.contains("timeout") {
            Some("connection-timeout")
        } else if message.contains("no route") {
            Some("route-unavailable")
        } else {
            None
        }
    }

    /// Passive signal: a remote call failed
    pub fn note_failure(&self, err: &DriftError) {
        let Some(pattern) = Self::classify_offline(err) else {
            return;
        };
        info!(pattern, error = %err, "Offline pattern matched");
        self.transition_failed();
    }

    /// Passive signal: a remote call succeeded
    pub fn note_success(&self) {
        *self.last_success.lock().unwrap() = Some(Instant::now());
        if self.state() != ConnState::Online {
            info!("Connectivity restored");
            let _ = self.state.send(ConnState::Online);
        }
    }

    fn transition_failed(&self) {
        let recent_success = self
            .last_success
            .lock()
            .unwrap()
            .map(|at| at.elapsed() < DEGRADED_GRACE)
            .unwrap_or(false);

        // First failure with a recent success degrades; a failure on top of
        // DEGRADED, or with no recent success, goes fully offline.
        let next = match self.state() {
            ConnState::Online if recent_success => ConnState::Degraded,
            _ => ConnState::Offline,
        };

        if self.state() != next {
            warn!(state = ?next, "Connectivity state changed");
            let _ = self.state.send(next);
        }
    }

    /// Active probe loop; runs until cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut timer = tokio::time::interval(self.probe_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {
                    let probe = self.client.get("/me/drive", &[]);
                    match tokio::time::timeout(self.probe_timeout, probe).await {
                        Ok(Ok(response)) if response.status < 500 => self.note_success(),
                        Ok(Ok(response)) => {
                            debug!(status = response.status, "Probe answered with server error");
                            self.transition_failed();
                        }
                        Ok(Err(e)) => self.note_failure(&e),
                        Err(_) => {
                            self.note_failure(&DriftError::Network(
                                "probe timed out".into(),
                            ));
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// Offline change queue
// ============================================================================

/// The persisted queue of mutations made while offline
pub struct OfflineQueue {
    store: Arc<Store>,
    next_id: AtomicU64,
    /// Live records by node, for coalescing
    by_node: DashMap<NodeId, OfflineChange>,
    max_changes: u64,
}

impl OfflineQueue {
    /// Restores the queue from the store
    pub async fn load(store: Arc<Store>, max_changes: u64) -> Result<Arc<Self>, DriftError> {
        let changes = store.load_offline_changes().await?;
        let max_seen = changes.iter().map(|c| c.change_id).max().unwrap_or(0);
        let counter = store
            .get_counter(records::NEXT_CHANGE_ID_KEY, max_seen + 1)
            .await?;

        let queue = Self {
            store,
            next_id: AtomicU64::new(counter.max(max_seen + 1)),
            by_node: DashMap::new(),
            max_changes,
        };
        for change in changes {
            queue.by_node.insert(change.node, change);
        }

        if !queue.by_node.is_empty() {
            info!(pending = queue.by_node.len(), "Offline change queue restored");
        }
        Ok(Arc::new(queue))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }

    /// Records a mutation, coalescing with any pending change for the node
    ///
    /// Fails once the queue reaches its high-water mark: further mutations
    /// are rejected until recovery drains the backlog.
    pub async fn record(
        &self,
        node: NodeId,
        op: OfflineOpKind,
        base_etag: Option<ETag>,
    ) -> Result<(), DriftError> {
        if let Some(mut existing) = self.by_node.get_mut(&node) {
            // Create followed by delete cancels out entirely.
            if existing.op == OfflineOpKind::Create && op == OfflineOpKind::Delete {
                let change_id = existing.change_id;
                drop(existing);
                self.by_node.remove(&node);
                self.store
                    .batch(vec![records::offline_change_delete(change_id)])
                    .await?;
                return Ok(());
            }
            if existing.can_coalesce(&op) {
                existing.coalesce(op);
                let updated = existing.clone();
                drop(existing);
                self.store
                    .batch(vec![records::offline_change_put(&updated)?])
                    .await?;
                debug!(node = %node, "Offline change coalesced");
                return Ok(());
            }
        }

        if self.by_node.len() as u64 >= self.max_changes {
            return Err(DriftError::Validation(format!(
                "offline change queue full ({} pending)",
                self.max_changes
            )));
        }

        let change_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let change = OfflineChange::new(change_id, node, op, base_etag);
        self.store
            .batch(vec![
                records::offline_change_put(&change)?,
                records::counter_put(
                    records::NEXT_CHANGE_ID_KEY,
                    self.next_id.load(Ordering::SeqCst),
                )?,
            ])
            .await?;
        self.by_node.insert(node, change);
        Ok(())
    }

    /// Pending changes, oldest first
    #[must_use]
    pub fn pending(&self) -> Vec<OfflineChange> {
        let mut changes: Vec<OfflineChange> =
            self.by_node.iter().map(|e| e.value().clone()).collect();
        changes.sort_by_key(|c| c.change_id);
        changes
    }

    /// Removes a confirmed change
    pub async fn remove(&self, change: &OfflineChange) -> Result<(), DriftError> {
        self.by_node
            .remove_if(&change.node, |_, c| c.change_id == change.change_id);
        self.store
            .batch(vec![records::offline_change_delete(change.change_id)])
            .await
    }

    /// Records a replay failure for backoff accounting
    pub async fn record_failure(&self, change: &OfflineChange) -> Result<(), DriftError> {
        if let Some(mut existing) = self.by_node.get_mut(&change.node) {
            existing.record_failure();
            let updated = existing.clone();
            drop(existing);
            self.store
                .batch(vec![records::offline_change_put(&updated)?])
                .await?;
        }
        Ok(())
    }
}

// ============================================================================
// Recovery driver
// ============================================================================

/// Outcome of one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub dropped: usize,
}

/// Replays the offline queue after reconnection
pub struct RecoveryDriver {
    deps: Arc<SyncDeps>,
    uploads: Arc<UploadPipeline>,
}

impl RecoveryDriver {
    pub fn new(deps: Arc<SyncDeps>, uploads: Arc<UploadPipeline>) -> Self {
        Self { deps, uploads }
    }

    /// Watches connectivity and replays whenever the mount comes back online
    pub async fn run(
        &self,
        mut conn: watch::Receiver<ConnState>,
        shutdown: CancellationToken,
    ) {
        let mut previous = *conn.borrow();

        // Changes queued by a previous run replay right away when the
        // mount starts out online.
        if previous == ConnState::Online && !self.deps.offline.is_empty() {
            match self.replay(&shutdown).await {
                Ok(report) => info!(
                    replayed = report.replayed,
                    conflicts = report.conflicts,
                    failed = report.failed,
                    "Startup offline recovery completed"
                ),
                Err(e) => warn!(error = %e, "Startup offline recovery failed"),
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = conn.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *conn.borrow();
                    if current == ConnState::Online && previous != ConnState::Online {
                        match self.replay(&shutdown).await {
                            Ok(report) => info!(
                                replayed = report.replayed,
                                conflicts = report.conflicts,
                                failed = report.failed,
                                "Offline recovery completed"
                            ),
                            Err(e) => warn!(error = %e, "Offline recovery failed"),
                        }
                    }
                    previous = current;
                }
            }
        }
    }

    /// Replays pending changes oldest-first
    ///
    /// Each change is verified against the current remote ETag before it
    /// is applied; divergence goes through the conflict resolver. Records
    /// are removed only on confirmed success.
    pub async fn replay(&self, shutdown: &CancellationToken) -> Result<ReplayReport, DriftError> {
        let deps = &self.deps;
        let mut report = ReplayReport::default();

        for change in deps.offline.pending() {
            if shutdown.is_cancelled() {
                break;
            }

            let Some(inode) = deps.index.get(change.node) else {
                // The item disappeared locally; nothing to replay.
                deps.offline.remove(&change).await?;
                report.dropped += 1;
                continue;
            };

            // Verify the base ETag against the current remote state.
            let diverged = match (&change.base_etag, inode.remote_id()) {
                (Some(base), Some(remote_id)) => {
                    deps.pacer.acquire("metadata").await;
                    match items::get_item(deps.client.as_ref(), remote_id).await {
                        Ok(meta) => meta.etag().as_ref() != Some(base),
                        Err(DriftError::NotFound(_)) => true,
                        Err(e) => {
                            warn!(node = %change.node, error = %e, "Replay verification failed");
                            deps.offline.record_failure(&change).await?;
                            report.failed += 1;
                            continue;
                        }
                    }
                }
                _ => false,
            };

            if diverged {
                if let Some(mut conflicted) = deps.index.get(change.node) {
                    if conflicted.can_transition_to(&ItemState::Conflict) {
                        conflicted.transition_to(ItemState::Conflict)?;
                        deps.index.apply(conflicted).await?;
                    }
                }
                report.conflicts += 1;
                if let Err(e) = resolve::resolve_conflict(deps, &self.uploads, change.node).await {
                    warn!(node = %change.node, error = %e, "Replay conflict resolution failed");
                    deps.offline.record_failure(&change).await?;
                    report.failed += 1;
                    continue;
                }
                deps.offline.remove(&change).await?;
                continue;
            }

            // A failed online attempt may have parked the item in Error;
            // restore the pending state the queued change implies.
            if matches!(inode.state(), ItemState::Error(_)) {
                let mut restored = inode.clone();
                let target = match &change.op {
                    OfflineOpKind::Delete => ItemState::DeletedLocal,
                    _ => ItemState::DirtyLocal,
                };
                restored.transition_to(target)?;
                deps.index.apply(restored).await?;
            }

            let result = match &change.op {
                OfflineOpKind::Create | OfflineOpKind::Modify | OfflineOpKind::Delete => {
                    self.uploads.process(change.node, shutdown).await
                }
                OfflineOpKind::Move { .. } => self.replay_move(&inode).await,
            };

            match result {
                Ok(()) => {
                    deps.offline.remove(&change).await?;
                    report.replayed += 1;
                }
                Err(e) => {
                    warn!(node = %change.node, error = %e, "Replay failed");
                    deps.offline.record_failure(&change).await?;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Pushes a locally applied move/rename to the remote store
    async fn replay_move(
        &self,
        inode: &driftfs_core::domain::Inode,
    ) -> Result<(), DriftError> {
        let deps = &self.deps;
        let Some(remote_id) = inode.remote_id() else {
            // Never uploaded; the pending create covers the new name.
            return Ok(());
        };

        let parent_remote = deps
            .index
            .get(inode.parent())
            .and_then(|p| p.remote_id().cloned());

        deps.pacer.acquire("metadata").await;
        let updated = items::move_item(
            deps.client.as_ref(),
            remote_id,
            parent_remote.as_ref(),
            inode.name(),
        )
        .await?;

        let mut refreshed = deps
            .index
            .get(inode.id())
            .ok_or_else(|| DriftError::NotFound(format!("node {}", inode.id())))?;
        refreshed.set_remote_etag(updated.etag());
        if matches!(refreshed.state(), ItemState::Hydrated) {
            refreshed.set_local_etag(updated.etag());
        }
        deps.index.apply(refreshed).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod classify_tests {
        use super::*;

        #[test]
        fn test_offline_patterns() {
            let cases = [
                ("connect error: Network is unreachable", "host-unreachable"),
                ("error sending request: dns error: failed to lookup address", "name-resolution-failure"),
                ("tcp connect error: Connection refused (os error 111)", "connection-refused"),
                ("operation timed out", "connection-timeout"),
                ("No route to host (os error 113)", "route-unavailable"),
                ("tls handshake timed out", "tls-handshake-timeout"),
            ];
            for (message, expected) in cases {
                let err = DriftError::Network(message.into());
                assert_eq!(
                    ConnectivityMonitor::classify_offline(&err),
                    Some(expected),
                    "message: {message}"
                );
            }
        }

        #[test]
        fn test_non_offline_errors_do_not_match() {
            assert_eq!(
                ConnectivityMonitor::classify_offline(&DriftError::Network(
                    "connection reset by peer".into()
                )),
                None
            );
            assert_eq!(
                ConnectivityMonitor::classify_offline(&DriftError::Auth("expired".into())),
                None
            );
            assert_eq!(
                ConnectivityMonitor::classify_offline(&DriftError::Server {
                    status: 503,
                    message: "unavailable".into()
                }),
                None
            );
        }
    }

    mod queue_tests {
        use super::*;

        async fn queue(max: u64) -> Arc<OfflineQueue> {
            let store = Arc::new(Store::in_memory().await.unwrap());
            OfflineQueue::load(store, max).await.unwrap()
        }

        #[tokio::test]
        async fn test_record_and_pending_order() {
            let q = queue(100).await;
            q.record(NodeId::new(3), OfflineOpKind::Modify, None).await.unwrap();
            q.record(NodeId::new(5), OfflineOpKind::Create, None).await.unwrap();

            let pending = q.pending();
            assert_eq!(pending.len(), 2);
            assert_eq!(pending[0].node, NodeId::new(3));
            assert_eq!(pending[1].node, NodeId::new(5));
        }

        #[tokio::test]
        async fn test_repeated_modifies_coalesce() {
            let q = queue(100).await;
            let etag = ETag::new("E1").unwrap();
            q.record(NodeId::new(2), OfflineOpKind::Modify, Some(etag.clone()))
                .await
                .unwrap();
            q.record(NodeId::new(2), OfflineOpKind::Modify, Some(ETag::new("E9").unwrap()))
                .await
                .unwrap();

            assert_eq!(q.len(), 1);
            let change = &q.pending()[0];
            // The original baseline is preserved for divergence detection.
            assert_eq!(change.base_etag.as_ref(), Some(&etag));
        }

        #[tokio::test]
        async fn test_create_then_delete_cancels() {
            let q = queue(100).await;
            q.record(NodeId::new(4), OfflineOpKind::Create, None).await.unwrap();
            q.record(NodeId::new(4), OfflineOpKind::Delete, None).await.unwrap();
            assert!(q.is_empty());
        }

        #[tokio::test]
        async fn test_high_water_mark_rejects_new_nodes() {
            let q = queue(2).await;
            q.record(NodeId::new(1), OfflineOpKind::Modify, None).await.unwrap();
            q.record(NodeId::new(2), OfflineOpKind::Modify, None).await.unwrap();

            let err = q
                .record(NodeId::new(3), OfflineOpKind::Modify, None)
                .await
                .unwrap_err();
            assert!(matches!(err, DriftError::Validation(_)));

            // Coalescing into an existing record still works at the mark.
            q.record(NodeId::new(1), OfflineOpKind::Modify, None).await.unwrap();
        }

        #[tokio::test]
        async fn test_queue_survives_reload() {
            let store = Arc::new(Store::in_memory().await.unwrap());
            let q = OfflineQueue::load(store.clone(), 100).await.unwrap();
            q.record(NodeId::new(7), OfflineOpKind::Modify, None).await.unwrap();

            let reloaded = OfflineQueue::load(store, 100).await.unwrap();
            assert_eq!(reloaded.len(), 1);
            assert_eq!(reloaded.pending()[0].node, NodeId::new(7));
        }

        #[tokio::test]
        async fn test_remove_confirmed_change() {
            let q = queue(100).await;
            q.record(NodeId::new(8), OfflineOpKind::Modify, None).await.unwrap();
            let change = q.pending()[0].clone();

            q.remove(&change).await.unwrap();
            assert!(q.is_empty());
        }
    }
}
