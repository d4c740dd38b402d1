//! Upload pipeline
//!
//! Drains `DirtyLocal` and `DeletedLocal` items to the remote store.
//! Bodies under the small-file boundary go up in one PUT; larger bodies use
//! a resumable chunked session whose URL and acknowledged offset persist
//! after every chunk, so a crash resumes mid-file within the session
//! lifetime. Before committing, the current remote ETag is compared with
//! the item's baseline; a mismatch becomes a `Conflict` transition handled
//! by the resolver.
//!
//! Ordering: items are independent of each other; within one item, later
//! local modifications supersede earlier pending ones by coalescing in the
//! offline queue, and the per-item lock serializes transfers.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driftfs_core::domain::{
    DriftError, ErrorKind, Inode, ItemState, NodeId, RemoteId, UploadSession,
};
use driftfs_graph::items;
use driftfs_graph::upload::{self as graph_upload, ChunkOutcome};
use driftfs_store::records;

use crate::queue::WorkQueue;
use crate::resolve;
use crate::retry::with_backoff;
use crate::scheduler::Priority;
use crate::status::TransferEvent;
use crate::SyncDeps;

/// Small-file boundary: bodies at or above this use a chunked session
pub const SMALL_UPLOAD_LIMIT: u64 = 250 * 1024 * 1024;

/// Upload retry attempts per item
const UPLOAD_ATTEMPTS: u32 = 3;

/// The drain pipeline for local changes
pub struct UploadPipeline {
    deps: Arc<SyncDeps>,
    queue: Arc<WorkQueue>,
    locks: DashMap<NodeId, Arc<tokio::sync::Mutex<()>>>,
}

impl UploadPipeline {
    pub fn new(deps: Arc<SyncDeps>) -> Arc<Self> {
        let capacity = deps.config.download.queue as usize;
        Arc::new(Self {
            deps,
            queue: Arc::new(WorkQueue::new(capacity)),
            locks: DashMap::new(),
        })
    }

    /// Starts the worker pool
    pub fn spawn_workers(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let workers = self.deps.config.upload.workers as usize;
        (0..workers)
            .map(|worker| {
                let pipeline = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    debug!(worker, "Upload worker started");
                    while let Some(node) = pipeline.queue.pop(&shutdown).await {
                        if let Err(e) = pipeline.process(node, &shutdown).await {
                            warn!(worker, node = %node, error = %e, "Upload failed");
                        }
                    }
                    debug!(worker, "Upload worker stopped");
                })
            })
            .collect()
    }

    /// Enqueues a drain for a node
    pub fn enqueue(&self, node: NodeId, priority: Priority) -> Result<(), DriftError> {
        self.queue.push(node, priority)
    }

    /// Scans the index for pending items and queues them all
    pub fn drain_pending(&self) -> usize {
        let pending = self
            .deps
            .index
            .nodes_matching(|i| i.state().has_pending_changes() && !i.is_virtual());
        let mut queued = 0;
        for inode in pending {
            if self.enqueue(inode.id(), Priority::Background).is_ok() {
                queued += 1;
            }
        }
        queued
    }

    /// Processes one item, start to commit
    ///
    /// Called by workers and, synchronously, by the offline recovery
    /// driver.
    pub async fn process(
        &self,
        node: NodeId,
        shutdown: &CancellationToken,
    ) -> Result<(), DriftError> {
        let lock = self
            .locks
            .entry(node)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let Some(inode) = self.deps.index.get(node) else {
            return Ok(()); // removed while queued
        };
        if inode.is_virtual() {
            return Ok(()); // virtual entries never reach the remote store
        }

        match inode.state() {
            ItemState::DirtyLocal => {
                self.deps.status.emit(TransferEvent::UploadStarted { node });
                let result = with_backoff("upload", UPLOAD_ATTEMPTS, shutdown, |_| {
                    self.upload_once(node, shutdown)
                })
                .await;
                self.finish(node, result).await
            }
            ItemState::DeletedLocal => {
                let result = with_backoff("remote-delete", UPLOAD_ATTEMPTS, shutdown, |_| {
                    self.delete_once(node)
                })
                .await;
                self.finish(node, result).await
            }
            other => {
                debug!(node = %node, state = %other, "Skipping upload, state moved on");
                Ok(())
            }
        }
    }

    async fn finish(&self, node: NodeId, result: Result<bool, DriftError>) -> Result<(), DriftError> {
        match result {
            Ok(uploaded) => {
                if uploaded {
                    self.deps
                        .status
                        .emit(TransferEvent::UploadCompleted { node });
                }
                Ok(())
            }
            Err(e) => {
                // Conflicts were already re-routed. Retryable exhaustion
                // (network, throttle, 5xx) keeps the pending state so a
                // later drain or the recovery driver picks the item up
                // again; only fatal failures land in Error.
                if !matches!(e.kind(), ErrorKind::Conflict | ErrorKind::Cancelled)
                    && !e.is_retryable()
                {
                    if let Some(mut inode) = self.deps.index.get(node) {
                        inode.mark_error(e.to_string());
                        self.deps.index.apply(inode).await?;
                    }
                }
                self.deps.status.emit(TransferEvent::UploadFailed {
                    node,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// One upload attempt; returns `Ok(false)` when the item was re-routed
    /// (conflict) instead of uploaded
    async fn upload_once(
        &self,
        node: NodeId,
        cancel: &CancellationToken,
    ) -> Result<bool, DriftError> {
        let deps = &self.deps;
        let inode = deps
            .index
            .get(node)
            .ok_or_else(|| DriftError::NotFound(format!("node {node}")))?;

        // Conflict precheck against the baseline ETag.
        if let Some(remote_id) = inode.remote_id() {
            deps.pacer.acquire("metadata").await;
            let remote_etag = match items::get_item(deps.client.as_ref(), remote_id).await {
                Ok(meta) => meta.etag(),
                Err(DriftError::NotFound(_)) => None,
                Err(e) => return Err(e),
            };
            if driftfs_conflict::detect(&inode, remote_etag.as_ref()).is_some() {
                self.route_conflict(node).await?;
                return Ok(false);
            }
        }

        let size = deps.cache.stat(node).await?.map(|s| s.size).unwrap_or(0);
        let parent_remote = self.ensure_remote_parent(inode.parent()).await?;
        let baseline = inode.local_etag().map(|e| e.as_str().to_string());

        let committed = if inode.is_directory() {
            deps.pacer.acquire("metadata").await;
            items::create_folder(deps.client.as_ref(), &parent_remote, inode.name()).await?
        } else {
            match choose_strategy(size) {
                driftfs_core::domain::UploadStrategy::Small => {
                    self.upload_small(&inode, &parent_remote, size, baseline.as_deref())
                        .await?
                }
                driftfs_core::domain::UploadStrategy::Chunked => {
                    self.upload_chunked(&inode, &parent_remote, size, baseline.as_deref(), cancel)
                        .await?
                }
            }
        };

        // Commit: new ETags, remote binding, session cleanup, one batch.
        let new_etag = committed
            .etag()
            .ok_or_else(|| DriftError::Validation("upload response without etag".into()))?;
        let remote_id = committed.remote_id()?;
        let hash = match committed.quick_xor_hash() {
            Some(hash) => Some(hash),
            None if !inode.is_directory() => Some(deps.cache.compute_hash(node).await?.0),
            None => None,
        };

        let mut updated = deps
            .index
            .get(node)
            .ok_or_else(|| DriftError::NotFound(format!("node {node}")))?;
        updated.set_remote_id(remote_id);
        updated.transition_to(ItemState::Hydrated)?;
        updated.set_local_etag(Some(new_etag.clone()));
        updated.set_remote_etag(Some(new_etag));
        updated.set_content_hash(hash.clone());
        if !updated.is_directory() {
            updated.set_size(size);
        }

        let mut ops = vec![records::upload_session_delete(node)];
        if let Some(hash) = &hash {
            ops.push(records::content_hash_put(node, hash)?);
        }
        deps.index.commit(vec![updated], ops).await?;

        info!(node = %node, bytes = size, "Uploaded");
        Ok(true)
    }

    async fn upload_small(
        &self,
        inode: &Inode,
        parent_remote: &RemoteId,
        size: u64,
        if_match: Option<&str>,
    ) -> Result<items::DriveItem, DriftError> {
        let deps = &self.deps;
        let body = deps.cache.read(inode.id(), 0, size as usize).await?;

        deps.pacer.acquire("upload").await;
        match graph_upload::put_small(
            deps.client.as_ref(),
            parent_remote,
            inode.name(),
            body,
            if_match,
        )
        .await
        {
            Ok(item) => Ok(item),
            Err(DriftError::Conflict(_)) => {
                self.route_conflict(inode.id()).await?;
                Err(DriftError::Conflict("precheck failed at commit".into()))
            }
            Err(e) => Err(e),
        }
    }

    async fn upload_chunked(
        &self,
        inode: &Inode,
        parent_remote: &RemoteId,
        size: u64,
        if_match: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<items::DriveItem, DriftError> {
        let deps = &self.deps;
        let node = inode.id();
        let chunk_bytes = deps.config.upload.chunk_bytes;

        // Resume a persisted session while its URL is alive; otherwise open
        // a fresh one and persist it before the first chunk.
        let mut session = match deps.store.get_upload_session(node).await? {
            Some(existing) if existing.is_resumable() && existing.total_bytes == size => {
                debug!(node = %node, offset = existing.next_offset, "Resuming upload session");
                let mut session = existing;
                // The server knows best where we actually stopped.
                if let Some(url) = session.session_url.clone() {
                    if let Some(next) =
                        graph_upload::query_session(deps.client.as_ref(), &url).await?
                    {
                        session.advance_to(next);
                    }
                }
                session
            }
            _ => {
                deps.pacer.acquire("upload").await;
                let info = graph_upload::create_session(
                    deps.client.as_ref(),
                    parent_remote,
                    inode.name(),
                    if_match,
                )
                .await?;
                let session = UploadSession::chunked(
                    node,
                    size,
                    chunk_bytes,
                    info.upload_url,
                    info.expiration_date_time,
                    inode.local_etag().cloned(),
                );
                deps.store
                    .batch(vec![records::upload_session_put(&session)?])
                    .await?;
                session
            }
        };

        let url = session
            .session_url
            .clone()
            .ok_or_else(|| DriftError::Validation("chunked session without URL".into()))?;

        loop {
            if cancel.is_cancelled() {
                return Err(DriftError::Cancelled);
            }

            let offset = session.next_offset;
            let len = chunk_bytes.min(size - offset) as usize;
            let chunk = deps.cache.read(node, offset, len).await?;
            if chunk.is_empty() {
                return Err(DriftError::Validation(format!(
                    "cache entry shorter than expected at offset {offset}"
                )));
            }

            deps.pacer.acquire("upload").await;
            let outcome =
                graph_upload::put_chunk(deps.client.as_ref(), &url, chunk, offset, size).await?;

            match outcome {
                ChunkOutcome::Accepted { next_offset } => {
                    session.advance_to(next_offset.unwrap_or(offset + len as u64));
                    deps.store
                        .batch(vec![records::upload_session_put(&session)?])
                        .await?;
                }
                ChunkOutcome::Completed(item) => return Ok(item),
            }
        }
    }

    /// One remote-delete attempt; `Ok(false)` when re-routed to conflict
    async fn delete_once(&self, node: NodeId) -> Result<bool, DriftError> {
        let deps = &self.deps;
        let Some(inode) = deps.index.get(node) else {
            return Ok(false);
        };

        if let Some(remote_id) = inode.remote_id().cloned() {
            deps.pacer.acquire("metadata").await;
            let remote_etag = match items::get_item(deps.client.as_ref(), &remote_id).await {
                Ok(meta) => meta.etag(),
                Err(DriftError::NotFound(_)) => None, // already gone remotely
                Err(e) => return Err(e),
            };

            if driftfs_conflict::detect(&inode, remote_etag.as_ref()).is_some() {
                self.route_conflict(node).await?;
                return Ok(false);
            }

            if remote_etag.is_some() {
                deps.pacer.acquire("metadata").await;
                match items::delete_item(deps.client.as_ref(), &remote_id).await {
                    Ok(()) | Err(DriftError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        deps.cache.delete(node).await?;
        deps.index
            .remove(
                node,
                vec![
                    records::content_hash_delete(node),
                    records::upload_session_delete(node),
                    records::download_session_delete(node),
                ],
            )
            .await?;

        info!(node = %node, "Local delete confirmed remotely");
        Ok(true)
    }

    /// Transitions an item into `Conflict` and hands it to the resolver
    async fn route_conflict(&self, node: NodeId) -> Result<(), DriftError> {
        let deps = &self.deps;
        if let Some(mut inode) = deps.index.get(node) {
            if inode.can_transition_to(&ItemState::Conflict) {
                inode.mark_conflict()?;
                deps.index.apply(inode).await?;
            }
        }
        deps.status.emit(TransferEvent::ConflictDetected { node });
        resolve::resolve_conflict(deps, self, node).await
    }

    /// Walks up the tree ensuring every ancestor exists remotely, creating
    /// missing directories on the way down
    async fn ensure_remote_parent(&self, parent: NodeId) -> Result<RemoteId, DriftError> {
        let deps = &self.deps;

        // Collect the chain of ancestors missing a remote id.
        let mut missing: Vec<Inode> = Vec::new();
        let mut current = parent;
        let anchor = loop {
            let inode = deps
                .index
                .get(current)
                .ok_or_else(|| DriftError::NotFound(format!("ancestor {current}")))?;
            if let Some(remote) = inode.remote_id() {
                break remote.clone();
            }
            if current == NodeId::ROOT {
                return Err(DriftError::Validation(
                    "root has no remote binding yet; initial sync incomplete".into(),
                ));
            }
            let next = inode.parent();
            missing.push(inode);
            current = next;
        };

        // Create from the top down.
        let mut parent_remote = anchor;
        for dir in missing.into_iter().rev() {
            deps.pacer.acquire("metadata").await;
            let created =
                items::create_folder(deps.client.as_ref(), &parent_remote, dir.name()).await?;
            let remote_id = created.remote_id()?;

            let mut updated = deps
                .index
                .get(dir.id())
                .ok_or_else(|| DriftError::NotFound(format!("ancestor {}", dir.id())))?;
            updated.set_remote_id(remote_id.clone());
            if matches!(updated.state(), ItemState::DirtyLocal) {
                updated.transition_to(ItemState::Hydrated)?;
                if let Some(etag) = created.etag() {
                    updated.set_local_etag(Some(etag.clone()));
                    updated.set_remote_etag(Some(etag));
                }
            }
            deps.index.apply(updated).await?;
            parent_remote = remote_id;
        }

        Ok(parent_remote)
    }
}

/// Picks the upload strategy for a body of `size` bytes
#[must_use]
pub fn choose_strategy(size: u64) -> driftfs_core::domain::UploadStrategy {
    if size < SMALL_UPLOAD_LIMIT {
        driftfs_core::domain::UploadStrategy::Small
    } else {
        driftfs_core::domain::UploadStrategy::Chunked
    }
}

/// Re-enqueues unexpired upload sessions found at startup
pub async fn resume_pending(pipeline: &Arc<UploadPipeline>) -> Result<usize, DriftError> {
    let sessions = pipeline.deps.store.load_upload_sessions().await?;
    let mut resumed = 0;
    let mut dropped = Vec::new();

    for session in sessions {
        let state = pipeline.deps.index.get(session.node).map(|i| i.state().clone());
        let pending = matches!(
            state,
            Some(ItemState::DirtyLocal | ItemState::DeletedLocal)
        );

        if pending && (session.is_resumable() || session.strategy == driftfs_core::domain::UploadStrategy::Small) {
            pipeline.enqueue(session.node, Priority::Background)?;
            resumed += 1;
        } else if !pending {
            dropped.push(records::upload_session_delete(session.node));
        } else {
            // Expired chunked session: the upload restarts from scratch.
            dropped.push(records::upload_session_delete(session.node));
            pipeline.enqueue(session.node, Priority::Background)?;
            resumed += 1;
        }
    }

    if !dropped.is_empty() {
        pipeline.deps.store.batch(dropped).await?;
    }
    if resumed > 0 {
        info!(resumed, "Re-enqueued interrupted uploads");
    }
    Ok(resumed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftfs_core::domain::UploadStrategy;

    #[test]
    fn test_strategy_boundary() {
        assert_eq!(choose_strategy(0), UploadStrategy::Small);
        assert_eq!(choose_strategy(SMALL_UPLOAD_LIMIT - 1), UploadStrategy::Small);
        assert_eq!(choose_strategy(SMALL_UPLOAD_LIMIT), UploadStrategy::Chunked);
        assert_eq!(choose_strategy(SMALL_UPLOAD_LIMIT + 1), UploadStrategy::Chunked);
    }
}
