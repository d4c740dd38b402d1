//! Delta sync loop
//!
//! Periodically reconciles the metadata index with the remote store:
//! fetches incremental changes from the stored cursor (or a full
//! enumeration when none exists - that is the initial tree walk), applies
//! them, invalidates stale cache entries, flags conflicts, and persists
//! the new cursor atomically with everything it covers.
//!
//! ## Cadence
//!
//! - healthy change transport: `poll.interval_healthy` (default 30 min)
//! - no healthy transport: `poll.interval_fallback` (default 5 min)
//! - repeated cycle failures: 10 s until a cycle succeeds again
//!
//! A change hint from the notifier preempts the timer and runs a cycle
//! immediately. Every cadence change is logged.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driftfs_core::domain::{
    DeltaCursor, DriftError, Inode, ItemKind, ItemState, NodeId,
};
use driftfs_core::ports::transport::ChangeHint;
use driftfs_graph::delta as graph_delta;
use driftfs_graph::items::DriveItem;
use driftfs_notify::NotifierHandle;
use driftfs_store::{records, BatchOp};

use crate::offline::ConnState;
use crate::resolve;
use crate::upload::UploadPipeline;
use crate::SyncDeps;

/// Cursor scope; one cursor per mount
const DRIVE_SCOPE: &str = "default";

/// Cadence while cycles keep failing
const DEGRADED_INTERVAL: Duration = Duration::from_secs(10);

/// Consecutive cycle failures before the degraded cadence kicks in
const DEGRADED_AFTER: u32 = 3;

/// Summary of one reconciliation cycle
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub items_seen: usize,
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub invalidated: usize,
    pub conflicts: usize,
    pub pages: u32,
    pub duration_ms: u64,
}

/// The periodic reconciliation loop
pub struct DeltaSyncLoop {
    deps: Arc<SyncDeps>,
    uploads: Arc<UploadPipeline>,
    notifier: NotifierHandle,
    hints: Mutex<mpsc::Receiver<ChangeHint>>,
    consecutive_failures: AtomicU32,
    /// Serializes cycles: a hint-triggered run never interleaves with a
    /// timer-driven one
    cycle_lock: Mutex<()>,
    conn: tokio::sync::watch::Receiver<ConnState>,
}

impl DeltaSyncLoop {
    pub fn new(
        deps: Arc<SyncDeps>,
        uploads: Arc<UploadPipeline>,
        notifier: NotifierHandle,
        hints: mpsc::Receiver<ChangeHint>,
        conn: tokio::sync::watch::Receiver<ConnState>,
    ) -> Self {
        Self {
            deps,
            uploads,
            notifier,
            hints: Mutex::new(hints),
            consecutive_failures: AtomicU32::new(0),
            cycle_lock: Mutex::new(()),
            conn,
        }
    }

    /// Current polling interval, derived from failure streak and notifier
    /// health
    #[must_use]
    pub fn cadence(&self) -> Duration {
        if self.consecutive_failures.load(Ordering::Acquire) >= DEGRADED_AFTER {
            DEGRADED_INTERVAL
        } else if self.notifier.healthy() {
            self.deps.config.poll_interval_healthy()
        } else {
            self.deps.config.poll_interval_fallback()
        }
    }

    /// Runs until cancelled
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut hints = self.hints.lock().await;
        let mut last_cadence: Option<Duration> = None;

        loop {
            let interval = self.cadence();
            if last_cadence != Some(interval) {
                info!(
                    interval_secs = interval.as_secs(),
                    degraded = interval == DEGRADED_INTERVAL,
                    notifier_healthy = self.notifier.healthy(),
                    "Delta polling cadence changed"
                );
                last_cadence = Some(interval);
            }

            let triggered_by_hint = tokio::select! {
                _ = tokio::time::sleep(interval) => false,
                hint = hints.recv() => {
                    match hint {
                        Some(hint) => {
                            // Collapse a burst of hints into one cycle.
                            while hints.try_recv().is_ok() {}
                            debug!(resource = %hint.resource, "Change hint received");
                            true
                        }
                        None => false,
                    }
                }
                _ = shutdown.cancelled() => break,
            };

            // Degraded pauses non-essential background work; offline makes
            // a cycle pointless.
            let conn = *self.conn.borrow();
            if conn != ConnState::Online {
                debug!(state = ?conn, triggered_by_hint, "Skipping delta cycle");
                continue;
            }

            match self.sync_cycle(&shutdown).await {
                Ok(summary) => {
                    let was_degraded =
                        self.consecutive_failures.swap(0, Ordering::AcqRel) >= DEGRADED_AFTER;
                    if was_degraded {
                        info!("Delta sync recovered, leaving degraded cadence");
                    }
                    info!(
                        items = summary.items_seen,
                        created = summary.created,
                        updated = summary.updated,
                        removed = summary.removed,
                        invalidated = summary.invalidated,
                        conflicts = summary.conflicts,
                        pages = summary.pages,
                        duration_ms = summary.duration_ms,
                        triggered_by_hint,
                        "Delta cycle completed"
                    );
                }
                Err(e) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                    if failures == DEGRADED_AFTER {
                        warn!(
                            failures,
                            interval_secs = DEGRADED_INTERVAL.as_secs(),
                            "Repeated delta failures, entering degraded cadence"
                        );
                    }
                    warn!(error = %e, failures, "Delta cycle failed");
                }
            }
        }

        info!("Delta sync loop stopped");
    }

    /// One reconciliation cycle: fetch, apply, persist cursor atomically
    pub async fn sync_cycle(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<SyncSummary, DriftError> {
        let _cycle = self.cycle_lock.lock().await;
        let started = std::time::Instant::now();
        let deps = &self.deps;

        if shutdown.is_cancelled() {
            return Err(DriftError::Cancelled);
        }

        let cursor = deps.store.get_delta_cursor(DRIVE_SCOPE).await?;

        deps.pacer.acquire("delta").await;
        let batch = match graph_delta::fetch_all(deps.client.as_ref(), cursor.as_ref()).await {
            Ok(batch) => batch,
            Err(DriftError::NotFound(_)) if cursor.is_some() => {
                // The cursor expired server-side; fall back to a full
                // enumeration.
                warn!("Delta cursor expired, performing full resync");
                deps.store
                    .batch(vec![records::delta_cursor_delete(DRIVE_SCOPE)])
                    .await?;
                deps.pacer.acquire("delta").await;
                graph_delta::fetch_all(deps.client.as_ref(), None).await?
            }
            Err(e) => return Err(e),
        };

        let mut summary = SyncSummary {
            items_seen: batch.items.len(),
            pages: batch.pages,
            ..SyncSummary::default()
        };

        let application = self.plan_application(batch.items, &batch.cursor, &mut summary)?;
        let conflict_nodes = application.conflicts.clone();
        let invalidate = application.invalidate_cache.clone();

        deps.index
            .commit_delta(
                application.upserts,
                application.removals,
                application.extra_ops,
            )
            .await?;

        // Cache bytes for demoted or removed items go after the commit;
        // a crash in between only leaves orphans for cleanup.
        for node in invalidate {
            deps.cache.delete(node).await?;
            summary.invalidated += 1;
        }

        for node in conflict_nodes {
            summary.conflicts += 1;
            if let Err(e) = resolve::resolve_conflict(deps, &self.uploads, node).await {
                warn!(node = %node, error = %e, "Conflict resolution failed");
            }
        }

        // Re-queue any pending items an earlier attempt left behind.
        self.uploads.drain_pending();

        summary.duration_ms = started.elapsed().as_millis() as u64;
        Ok(summary)
    }

    /// Plans the index mutations for a drained delta batch
    ///
    /// Items whose parent has not been seen yet are deferred and retried
    /// until a round makes no progress, so the outcome does not depend on
    /// pagination boundaries or item order.
    fn plan_application(
        &self,
        items: Vec<DriveItem>,
        cursor: &DeltaCursor,
        summary: &mut SyncSummary,
    ) -> Result<DeltaApplication, DriftError> {
        let deps = &self.deps;
        let mut application = DeltaApplication::default();
        application
            .extra_ops
            .push(records::delta_cursor_put(DRIVE_SCOPE, cursor)?);

        // Staged view: lets later items resolve parents created earlier in
        // the same batch.
        let mut staged_by_remote: HashMap<String, NodeId> = HashMap::new();
        let mut staged: HashMap<NodeId, Inode> = HashMap::new();

        let mut queue: VecDeque<DriveItem> = items.into();
        let mut deferred = 0usize;

        while let Some(item) = queue.pop_front() {
            let existing = staged_by_remote
                .get(&item.id)
                .and_then(|id| staged.get(id).cloned())
                .or_else(|| {
                    item.remote_id()
                        .ok()
                        .and_then(|rid| deps.index.lookup_remote(&rid))
                });

            if item.is_deleted() {
                self.plan_deletion(existing, &mut application, summary);
                deferred = 0;
                continue;
            }

            // The drive root binds to the fixed root node.
            if item.parent_remote_id().is_none() {
                let mut root = staged
                    .get(&NodeId::ROOT)
                    .cloned()
                    .or_else(|| deps.index.get(NodeId::ROOT))
                    .ok_or_else(|| DriftError::StorageCorrupt("missing root inode".into()))?;
                root.set_remote_id(item.remote_id()?);
                root.set_remote_etag(item.etag());
                staged_by_remote.insert(item.id.clone(), NodeId::ROOT);
                staged.insert(NodeId::ROOT, root);
                deferred = 0;
                continue;
            }

            let parent_remote = item.parent_remote_id().unwrap_or_default().to_string();
            let parent = staged_by_remote.get(&parent_remote).copied().or_else(|| {
                driftfs_core::domain::RemoteId::new(parent_remote.clone())
                    .ok()
                    .and_then(|rid| deps.index.lookup_remote(&rid))
                    .map(|i| i.id())
            });

            let Some(parent) = parent else {
                // Parent not seen yet; retry until a full pass defers
                // everything that is left.
                deferred += 1;
                if deferred > queue.len() {
                    warn!(
                        item = %item.id,
                        name = %item.name,
                        "Dropping delta item with unresolvable parent"
                    );
                    deferred = 0;
                    continue;
                }
                queue.push_back(item);
                continue;
            };
            deferred = 0;

            match existing {
                Some(node) => {
                    self.plan_update(node, &item, parent, &mut application, summary, &mut staged)?;
                }
                None => {
                    let inode = self.inode_from_item(&item, parent)?;
                    staged_by_remote.insert(item.id.clone(), inode.id());
                    if inode.is_directory() {
                        deps.index.mark_warm(inode.id());
                    }
                    staged.insert(inode.id(), inode);
                    summary.created += 1;
                }
            }
        }

        application.upserts.extend(staged.into_values());
        Ok(application)
    }

    fn plan_deletion(
        &self,
        existing: Option<Inode>,
        application: &mut DeltaApplication,
        summary: &mut SyncSummary,
    ) {
        let Some(node) = existing else {
            return; // never knew the item
        };

        if matches!(node.state(), ItemState::DirtyLocal) {
            // Remote delete against local edits: the resolver decides.
            application.conflicts.push(node.id());
            return;
        }
        // A pending local delete agrees with the remote one; fall through
        // and drop the subtree.

        let subtree = self.deps.index.subtree_ids(node.id());
        summary.removed += subtree.len();
        application.invalidate_cache.extend(subtree.iter().copied());
        application.removals.extend(subtree);
    }

    fn plan_update(
        &self,
        node: Inode,
        item: &DriveItem,
        parent: NodeId,
        application: &mut DeltaApplication,
        summary: &mut SyncSummary,
        staged: &mut HashMap<NodeId, Inode>,
    ) -> Result<(), DriftError> {
        let mut updated = node.clone();
        let new_etag = item.etag();
        let etag_changed = new_etag.as_ref() != node.remote_etag();
        let moved = node.name() != item.name
            || staged
                .get(&node.id())
                .map(|s| s.parent())
                .unwrap_or(node.parent())
                != parent;

        if moved {
            updated.set_parent(parent);
            updated.set_name(&item.name);
        }

        if etag_changed {
            match node.state() {
                ItemState::Hydrated if node.etags_match() => {
                    // Local copy matches the old remote version: demote and
                    // invalidate so the next read re-hydrates.
                    updated.transition_to(ItemState::Ghost)?;
                    updated.set_local_etag(None);
                    application.invalidate_cache.push(node.id());
                    application
                        .extra_ops
                        .push(records::content_hash_delete(node.id()));
                }
                ItemState::DirtyLocal | ItemState::DeletedLocal => {
                    application.conflicts.push(node.id());
                    let mut conflicted = updated.clone();
                    if conflicted.can_transition_to(&ItemState::Conflict) {
                        conflicted.transition_to(ItemState::Conflict)?;
                    }
                    conflicted.set_remote_etag(new_etag.clone());
                    staged.insert(node.id(), conflicted);
                    summary.updated += 1;
                    return Ok(());
                }
                _ => {}
            }

            updated.set_remote_etag(new_etag);
            updated.set_content_hash(item.quick_xor_hash());
            if let Some(size) = item.size {
                updated.set_size(size);
            }
            if let Some(modified) = item.last_modified_date_time {
                updated.set_modified_at(modified);
            }
        }

        if moved || etag_changed {
            staged.insert(node.id(), updated);
            summary.updated += 1;
        }
        Ok(())
    }

    fn inode_from_item(&self, item: &DriveItem, parent: NodeId) -> Result<Inode, DriftError> {
        let kind = if item.is_directory() {
            ItemKind::Directory
        } else {
            ItemKind::File
        };
        Ok(Inode::from_remote(
            self.deps.index.allocate_id(),
            parent,
            item.name.clone(),
            kind,
            item.remote_id()?,
            item.size.unwrap_or(0),
            item.etag(),
            item.quick_xor_hash(),
            item.last_modified_date_time.unwrap_or_else(Utc::now),
        ))
    }
}

/// Planned mutations of one delta cycle
#[derive(Default)]
struct DeltaApplication {
    upserts: Vec<Inode>,
    removals: Vec<NodeId>,
    extra_ops: Vec<BatchOp>,
    conflicts: Vec<NodeId>,
    invalidate_cache: Vec<NodeId>,
}
