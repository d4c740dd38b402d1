//! Download pipeline
//!
//! A bounded worker pool that hydrates items from `Ghost`/`Error` to
//! `Hydrated`. Work arrives through a bounded two-level priority queue
//! (foreground opens beat background prefetch). Per item the pipeline
//! fetches fresh metadata (pre-authenticated URL, current ETag, expected
//! hash), streams content into the cache - chunked with a persisted
//! [`DownloadSession`] above the chunk threshold so a restart resumes at
//! the last offset - verifies the quick-xor hash, and commits the result
//! in one atomic batch.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driftfs_core::domain::{
    CorrelationId, DownloadSession, DriftError, Inode, ItemState, NodeId,
};
use driftfs_graph::items;
use driftfs_store::records;

use crate::retry::with_backoff;
use crate::scheduler::Priority;
use crate::status::TransferEvent;
use crate::SyncDeps;

use crate::queue::WorkQueue;

// ============================================================================
// Pipeline
// ============================================================================

/// The hydration pipeline
pub struct DownloadPipeline {
    deps: Arc<SyncDeps>,
    queue: Arc<WorkQueue>,
    /// Serializes transfers per inode
    locks: DashMap<NodeId, Arc<tokio::sync::Mutex<()>>>,
}

impl DownloadPipeline {
    pub fn new(deps: Arc<SyncDeps>) -> Arc<Self> {
        let capacity = deps.config.download.queue as usize;
        Arc::new(Self {
            deps,
            queue: Arc::new(WorkQueue::new(capacity)),
            locks: DashMap::new(),
        })
    }

    /// Starts the worker pool; returns the worker handles
    pub fn spawn_workers(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let workers = self.deps.config.download.workers as usize;
        (0..workers)
            .map(|worker| {
                let pipeline = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    debug!(worker, "Download worker started");
                    while let Some(node) = pipeline.queue.pop(&shutdown).await {
                        if let Err(e) = pipeline.process(node, &shutdown).await {
                            warn!(worker, node = %node, error = %e, "Hydration failed");
                        }
                    }
                    debug!(worker, "Download worker stopped");
                })
            })
            .collect()
    }

    /// Enqueues a hydration request
    pub fn enqueue(&self, node: NodeId, priority: Priority) -> Result<(), DriftError> {
        self.queue.push(node, priority)
    }

    /// Hydrates a node and waits for the outcome
    ///
    /// Used by the read path: subscribes to status before enqueueing so the
    /// completion event cannot be missed, then waits for this node's
    /// terminal event.
    pub async fn hydrate_and_wait(
        &self,
        node: NodeId,
        cancel: &CancellationToken,
    ) -> Result<(), DriftError> {
        let mut events = self.deps.status.subscribe();

        // Already hydrated between the caller's check and now.
        match self.deps.index.get(node).map(|i| i.state().clone()) {
            Some(ItemState::Hydrated | ItemState::DirtyLocal | ItemState::Conflict) => {
                return Ok(())
            }
            Some(_) => {}
            None => return Err(DriftError::NotFound(format!("node {node}"))),
        }

        self.enqueue(node, Priority::Foreground)?;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(TransferEvent::HydrationCompleted { node: done }) if done == node => {
                        return Ok(());
                    }
                    Ok(TransferEvent::HydrationFailed { node: failed, error }) if failed == node => {
                        return Err(DriftError::Validation(error));
                    }
                    Ok(_) => {}
                    Err(_) => {
                        // Lagged or closed; fall back to polling the state.
                        let state = self.deps.index.get(node).map(|i| i.state().clone());
                        match state {
                            Some(ItemState::Hydrated) => return Ok(()),
                            Some(ItemState::Error(e)) => return Err(DriftError::Validation(e)),
                            _ => events = self.deps.status.subscribe(),
                        }
                    }
                },
                _ = cancel.cancelled() => return Err(DriftError::Cancelled),
            }
        }
    }

    /// Processes one hydration, start to commit
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

        let Some(mut inode) = self.deps.index.get(node) else {
            return Ok(()); // removed while queued
        };
        match inode.state() {
            ItemState::Ghost | ItemState::Error(_) => {}
            other => {
                debug!(node = %node, state = %other, "Skipping hydration, state moved on");
                return Ok(());
            }
        }
        let Some(remote_id) = inode.remote_id().cloned() else {
            return Err(DriftError::Validation(format!(
                "node {node} has no remote id to hydrate from"
            )));
        };

        inode.start_hydrating()?;
        self.deps.index.apply(inode).await?;
        self.deps
            .status
            .emit(TransferEvent::HydrationStarted { node });

        let correlation = CorrelationId::new();
        debug!(node = %node, %correlation, "Hydration started");

        let retries = self.deps.config.download.retries;
        let result = with_backoff("hydrate", retries, shutdown, |_| {
            self.transfer(node, &remote_id, shutdown)
        })
        .await;

        match result {
            Ok(()) => {
                self.deps
                    .status
                    .emit(TransferEvent::HydrationCompleted { node });
                Ok(())
            }
            Err(e) => {
                warn!(node = %node, %correlation, error = %e, "Hydration gave up");
                if let Some(mut inode) = self.deps.index.get(node) {
                    inode.mark_error(e.to_string());
                    self.deps.index.apply(inode).await?;
                }
                self.deps.status.emit(TransferEvent::HydrationFailed {
                    node,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// One transfer attempt: metadata, content, verify, commit
    async fn transfer(
        &self,
        node: NodeId,
        remote_id: &driftfs_core::domain::RemoteId,
        cancel: &CancellationToken,
    ) -> Result<(), DriftError> {
        let deps = &self.deps;

        // Fresh metadata for a valid pre-authenticated URL and current ETag.
        deps.pacer.acquire("metadata").await;
        let meta = items::get_item(deps.client.as_ref(), remote_id).await?;

        let etag = meta
            .etag()
            .ok_or_else(|| DriftError::Validation(format!("item {remote_id} without etag")))?;
        let expected_hash = meta.quick_xor_hash();
        let size = meta.size.unwrap_or(0);
        let url = meta.download_url.clone().unwrap_or_else(|| {
            format!("/me/drive/items/{}/content", remote_id.as_str())
        });

        let chunk_bytes = deps.config.download.chunk_bytes;

        if size > chunk_bytes {
            self.transfer_chunked(node, &url, size, expected_hash.clone(), chunk_bytes, cancel)
                .await?;
        } else {
            deps.pacer.acquire("download").await;
            let bytes = deps.client.get_stream(&url, &[], 0, None).await?;
            deps.cache.truncate(node, 0).await?;
            deps.cache.write(node, 0, &bytes).await?;
        }

        // Verify, with one re-download on checksum mismatch before surfacing.
        let final_size = match &expected_hash {
            Some(expected) => match deps.cache.finalize(node, expected).await {
                Ok(size) => size,
                Err(DriftError::Validation(_)) => {
                    warn!(node = %node, "Checksum mismatch, re-downloading once");
                    deps.pacer.acquire("download").await;
                    let bytes = deps.client.get_stream(&url, &[], 0, None).await?;
                    deps.cache.truncate(node, 0).await?;
                    deps.cache.write(node, 0, &bytes).await?;
                    deps.cache.finalize(node, expected).await?
                }
                Err(other) => return Err(other),
            },
            None => deps
                .cache
                .stat(node)
                .await?
                .map(|s| s.size)
                .unwrap_or(0),
        };

        // Single commit: inode transition + hash record + session cleanup.
        let mut inode = deps
            .index
            .get(node)
            .ok_or_else(|| DriftError::NotFound(format!("node {node}")))?;
        let hash = match expected_hash {
            Some(hash) => hash,
            None => deps.cache.compute_hash(node).await?.0,
        };
        inode.complete_hydration(etag, hash.clone(), final_size)?;

        let ops = vec![
            records::content_hash_put(node, &hash)?,
            records::download_session_delete(node),
        ];
        deps.index.commit(vec![inode], ops).await?;

        info!(node = %node, bytes = final_size, "Hydrated");
        Ok(())
    }

    /// Chunked transfer with a persisted session for resume
    async fn transfer_chunked(
        &self,
        node: NodeId,
        url: &str,
        size: u64,
        expected_hash: Option<driftfs_core::domain::QuickXorHash>,
        chunk_bytes: u64,
        cancel: &CancellationToken,
    ) -> Result<(), DriftError> {
        let deps = &self.deps;

        // Resume from a persisted session when it still matches the item.
        let mut session = match deps.store.get_download_session(node).await? {
            Some(existing)
                if existing.expected_size == size
                    && existing.expected_hash == expected_hash =>
            {
                debug!(node = %node, offset = existing.next_offset, "Resuming chunked download");
                existing
            }
            _ => {
                deps.cache.truncate(node, 0).await?;
                DownloadSession::new(node, size, expected_hash)
            }
        };

        while session.next_offset < size {
            if cancel.is_cancelled() {
                return Err(DriftError::Cancelled);
            }

            let offset = session.next_offset;
            let len = chunk_bytes.min(size - offset);

            deps.pacer.acquire("download").await;
            let bytes = deps.client.get_stream(url, &[], offset, Some(len)).await?;
            if bytes.is_empty() {
                return Err(DriftError::Validation(format!(
                    "empty range response at offset {offset}"
                )));
            }
            deps.cache.write(node, offset, &bytes).await?;

            session.advance_to(offset + bytes.len() as u64);
            deps.store
                .batch(vec![records::download_session_put(&session)?])
                .await?;

            let percent = ((session.next_offset * 100) / size.max(1)).min(100) as u8;
            deps.status
                .emit(TransferEvent::HydrationProgress { node, percent });
        }

        Ok(())
    }

    /// Drops a queued or persisted transfer for a node
    pub async fn abandon(&self, node: NodeId) -> Result<(), DriftError> {
        self.deps
            .store
            .batch(vec![records::download_session_delete(node)])
            .await
    }
}

/// Enqueues every resumable download found at startup
pub async fn resume_pending(
    pipeline: &Arc<DownloadPipeline>,
) -> Result<usize, DriftError> {
    let sessions = pipeline.deps.store.load_download_sessions().await?;
    let mut resumed = 0;
    for session in sessions {
        if pipeline
            .deps
            .index
            .get(session.node)
            .is_some_and(|i| matches!(i.state(), ItemState::Ghost | ItemState::Error(_)))
        {
            pipeline.enqueue(session.node, Priority::Background)?;
            resumed += 1;
        }
    }
    if resumed > 0 {
        info!(resumed, "Re-enqueued interrupted downloads");
    }
    Ok(resumed)
}

/// Helper for building an inode eligible for hydration checks
#[must_use]
pub fn needs_hydration(inode: &Inode) -> bool {
    matches!(inode.state(), ItemState::Ghost) && !inode.is_directory()
}
