//! Conflict plan execution
//!
//! Turns a [`ResolutionPlan`] from the conflict crate into index and
//! pipeline operations. The remote version is preserved without moving
//! content: keep-both renames the remote item server-side to the conflict
//! copy name and re-binds it to a fresh ghost inode, while the local body
//! re-queues as a new upload under the original name.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use driftfs_conflict::{plan, ConflictContext, ResolutionPlan};
use driftfs_core::domain::{DriftError, Inode, ItemKind, ItemState, NodeId};
use driftfs_graph::items;
use driftfs_store::records;

use crate::scheduler::Priority;
use crate::upload::UploadPipeline;
use crate::SyncDeps;

/// Resolves a node sitting in `Conflict` according to the configured policy
///
/// `user-choice` leaves the node in `Conflict`; every other strategy ends
/// with the local side either re-queued for upload or discarded.
pub async fn resolve_conflict(
    deps: &Arc<SyncDeps>,
    uploads: &UploadPipeline,
    node: NodeId,
) -> Result<(), DriftError> {
    let inode = deps
        .index
        .get(node)
        .ok_or_else(|| DriftError::NotFound(format!("node {node}")))?;
    if !matches!(inode.state(), ItemState::Conflict) {
        return Ok(());
    }

    // Latest remote facts; a deleted remote side resolves to `None`.
    let remote_meta = match inode.remote_id() {
        Some(remote_id) => {
            deps.pacer.acquire("metadata").await;
            match items::get_item(deps.client.as_ref(), remote_id).await {
                Ok(meta) => Some(meta),
                Err(DriftError::NotFound(_)) => None,
                Err(e) => return Err(e),
            }
        }
        None => None,
    };

    let path = node_path(deps, &inode);
    let strategy = deps.policy.evaluate(&path);
    let ctx = ConflictContext {
        node,
        path: path.clone(),
        name: inode.name().to_string(),
        local_etag: inode.local_etag().cloned(),
        remote_etag: remote_meta.as_ref().and_then(|m| m.etag()),
        local_modified: Some(inode.modified_at()),
        remote_modified: remote_meta.as_ref().and_then(|m| m.last_modified_date_time),
        resolved_at: Utc::now(),
    };

    match plan(strategy, &ctx) {
        ResolutionPlan::Defer => Ok(()),

        ResolutionPlan::KeepLocal => {
            requeue_local(deps, uploads, node, remote_meta.as_ref()).await
        }

        ResolutionPlan::KeepRemote => {
            let mut updated = deps
                .index
                .get(node)
                .ok_or_else(|| DriftError::NotFound(format!("node {node}")))?;
            deps.cache.delete(node).await?;
            updated.transition_to(ItemState::Ghost)?;
            updated.set_local_etag(None);
            if let Some(meta) = &remote_meta {
                updated.set_remote_etag(meta.etag());
                updated.set_content_hash(meta.quick_xor_hash());
                updated.set_size(meta.size.unwrap_or(0));
            }
            deps.index
                .commit(vec![updated], vec![records::content_hash_delete(node)])
                .await?;
            info!(path = %path, "Local side discarded, item will re-hydrate on demand");
            Ok(())
        }

        ResolutionPlan::KeepBoth { remote_copy_name } => {
            preserve_remote_as(deps, node, remote_meta.as_ref(), &remote_copy_name).await?;
            requeue_local(deps, uploads, node, None).await
        }

        ResolutionPlan::RenameBoth {
            local_name,
            remote_copy_name,
        } => {
            preserve_remote_as(deps, node, remote_meta.as_ref(), &remote_copy_name).await?;
            let parent = inode.parent();
            deps.index.rename(node, parent, &local_name).await?;
            requeue_local(deps, uploads, node, None).await
        }
    }
}

/// Re-queues the local body for upload
///
/// With remote facts, the baseline adopts the current remote ETag so the
/// next precheck passes and the upload force-overwrites; without them the
/// remote binding is cleared and the upload creates a fresh item.
async fn requeue_local(
    deps: &Arc<SyncDeps>,
    uploads: &UploadPipeline,
    node: NodeId,
    remote_meta: Option<&items::DriveItem>,
) -> Result<(), DriftError> {
    let Some(inode) = deps.index.get(node) else {
        return Ok(());
    };
    let mut updated = inode;
    updated.transition_to(ItemState::DirtyLocal)?;
    match remote_meta {
        Some(meta) => {
            updated.set_local_etag(meta.etag());
            updated.set_remote_etag(meta.etag());
        }
        None => {
            updated.set_local_etag(None);
            updated.set_remote_etag(None);
        }
    }
    deps.index.apply(updated).await?;

    if let Err(e) = uploads.enqueue(node, Priority::Foreground) {
        warn!(node = %node, error = %e, "Could not queue resolved upload");
    }
    Ok(())
}

/// Preserves the remote version beside the original
///
/// Renames the remote item server-side to `copy_name` and re-binds it to a
/// fresh ghost inode; the original node gives up its remote binding. With
/// no remote side (edit/delete conflict) there is nothing to preserve.
async fn preserve_remote_as(
    deps: &Arc<SyncDeps>,
    node: NodeId,
    remote_meta: Option<&items::DriveItem>,
    copy_name: &str,
) -> Result<(), DriftError> {
    let Some(meta) = remote_meta else {
        // Remote side deleted; the local body is the only survivor.
        if let Some(mut inode) = deps.index.get(node) {
            clear_remote_binding(&mut inode);
            deps.index.apply(inode).await?;
        }
        return Ok(());
    };

    let inode = deps
        .index
        .get(node)
        .ok_or_else(|| DriftError::NotFound(format!("node {node}")))?;
    let remote_id = meta.remote_id()?;

    deps.pacer.acquire("metadata").await;
    let renamed = items::move_item(deps.client.as_ref(), &remote_id, None, copy_name).await?;

    let copy = Inode::from_remote(
        deps.index.allocate_id(),
        inode.parent(),
        copy_name,
        ItemKind::File,
        remote_id,
        renamed.size.or(meta.size).unwrap_or(0),
        renamed.etag().or_else(|| meta.etag()),
        renamed.quick_xor_hash().or_else(|| meta.quick_xor_hash()),
        renamed
            .last_modified_date_time
            .or(meta.last_modified_date_time)
            .unwrap_or_else(Utc::now),
    );

    let mut original = inode;
    clear_remote_binding(&mut original);

    // One batch: the original loses its binding, the copy takes it over.
    deps.index.commit(vec![original, copy.clone()], Vec::new()).await?;
    info!(copy = copy_name, node = %copy.id(), "Remote version preserved as conflict copy");
    Ok(())
}

fn clear_remote_binding(inode: &mut Inode) {
    // The upload pipeline creates a fresh remote item for an unbound node.
    inode.set_local_etag(None);
    inode.set_remote_etag(None);
    inode.strip_remote_id();
}

/// Builds the mount-relative path of a node for policy evaluation and logs
fn node_path(deps: &Arc<SyncDeps>, inode: &Inode) -> String {
    let mut segments = vec![inode.name().to_string()];
    let mut current = inode.parent();
    while current != NodeId::SENTINEL && current != NodeId::ROOT {
        match deps.index.get(current) {
            Some(parent) => {
                segments.push(parent.name().to_string());
                current = parent.parent();
            }
            None => break,
        }
    }
    segments.reverse();
    segments.join("/")
}
