//! Filesystem callback surface
//!
//! Node-id-addressed operations for the OS adapter. Reads come straight
//! from the metadata index and content cache; a read of a `Ghost` file
//! blocks on foreground hydration. Mutations persist through atomic store
//! batches, queue uploads while online, and append coalescing offline
//! changes while the remote store is unreachable.
//!
//! Directory listings are served from the index: a directory that was
//! never fetched blocks on its first listing; a stale one returns cached
//! entries immediately and refreshes in the background through the request
//! scheduler.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use driftfs_core::domain::{
    validate_name, DriftError, Inode, ItemKind, ItemState, NodeId, OfflineOpKind, UploadSession,
};
use driftfs_graph::items;
use driftfs_store::records;
use driftfs_sync::index::Warmth;
use driftfs_sync::offline::{ConnState, ConnectivityMonitor};
use driftfs_sync::scheduler::Priority;

use crate::handle::HandleId;
use crate::mount::Mount;
use crate::xattr;

/// Attributes returned by `lookup`/`stat`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttributes {
    pub node: NodeId,
    pub kind: ItemKind,
    pub size: u64,
    /// Unix permission bits the adapter reports
    pub mode: u32,
    pub nlink: u32,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub accessed: DateTime<Utc>,
}

/// One `readdir` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub node: NodeId,
    pub name: String,
    pub kind: ItemKind,
}

/// Open mode for `open`/`create`
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            truncate: false,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            truncate: false,
        }
    }
}

/// Attribute changes for `set_attributes`
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrs {
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
}

/// `statfs` answer
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub name_max: u32,
}

/// Shared result type for scheduler-deduplicated remote operations
#[derive(Debug, Clone)]
pub enum RemoteOutcome {
    /// A directory listing landed; carries the child count
    Listed(usize),
    /// A single-entry fetch landed
    Found(NodeId),
    /// A single-entry fetch confirmed absence
    Missing,
}

fn attributes_of(inode: &Inode) -> NodeAttributes {
    NodeAttributes {
        node: inode.id(),
        kind: inode.kind(),
        size: inode.size(),
        mode: if inode.is_directory() { 0o755 } else { 0o644 },
        nlink: if inode.is_directory() { 2 } else { 1 },
        created: inode.created_at(),
        modified: inode.modified_at(),
        accessed: inode.accessed_at(),
    }
}

/// Entries pending remote deletion stay in the index but leave the
/// namespace immediately
fn is_visible(inode: &Inode) -> bool {
    !matches!(inode.state(), ItemState::DeletedLocal)
}

impl Mount {
    fn is_offline(&self) -> bool {
        matches!(*self.conn.borrow(), ConnState::Offline)
    }

    fn node(&self, id: NodeId) -> Result<Inode, DriftError> {
        self.deps
            .index
            .get(id)
            .ok_or_else(|| DriftError::NotFound(format!("node {id}")))
    }

    fn directory(&self, id: NodeId) -> Result<Inode, DriftError> {
        let inode = self.node(id)?;
        if !inode.is_directory() {
            return Err(DriftError::NotADirectory);
        }
        Ok(inode)
    }

    // ========================================================================
    // Lookup and listing
    // ========================================================================

    /// Resolves a name within a directory
    pub async fn lookup(
        &self,
        parent: NodeId,
        name: &str,
    ) -> Result<NodeAttributes, DriftError> {
        let dir = self.directory(parent)?;

        if let Some(found) = self.deps.index.lookup(parent, name) {
            if is_visible(&found) {
                return Ok(attributes_of(&found));
            }
            return Err(DriftError::NotFound(format!("{name} (pending delete)")));
        }

        if self.is_offline() {
            return Err(DriftError::NotFound(name.into()));
        }

        match self
            .deps
            .index
            .warmth(parent, self.deps.config.index_refresh())
        {
            // A warm miss is authoritative.
            Warmth::Fresh => Err(DriftError::NotFound(name.into())),
            // Never listed: the first lookup pays for the whole listing.
            Warmth::Cold => {
                self.refresh_directory(parent, Priority::Foreground).await?;
                match self.deps.index.lookup(parent, name) {
                    Some(found) if is_visible(&found) => Ok(attributes_of(&found)),
                    _ => Err(DriftError::NotFound(name.into())),
                }
            }
            // Stale: revalidate only the missing entry, never the whole
            // parent listing.
            Warmth::Stale => {
                match self.fetch_child(&dir, name).await? {
                    RemoteOutcome::Found(node) => {
                        let found = self.node(node)?;
                        Ok(attributes_of(&found))
                    }
                    _ => Err(DriftError::NotFound(name.into())),
                }
            }
        }
    }

    /// Node attributes
    pub fn stat(&self, node: NodeId) -> Result<NodeAttributes, DriftError> {
        let inode = self.node(node)?;
        Ok(attributes_of(&inode))
    }

    /// Lists a directory starting at `offset`
    ///
    /// `.` and `..` occupy offsets 0 and 1.
    pub async fn readdir(
        &self,
        node: NodeId,
        offset: usize,
    ) -> Result<Vec<DirEntry>, DriftError> {
        let dir = self.directory(node)?;

        match self
            .deps
            .index
            .warmth(node, self.deps.config.index_refresh())
        {
            Warmth::Cold if !self.is_offline() => {
                // First listing ever: the caller blocks on it.
                self.refresh_directory(node, Priority::Foreground).await?;
            }
            Warmth::Stale if !self.is_offline() => {
                // Serve the cached listing now, refresh behind the scenes.
                self.spawn_background_refresh(node);
            }
            _ => {}
        }

        // The root's `..` points back at itself.
        let parent_entry = if dir.parent().is_sentinel() {
            node
        } else {
            dir.parent()
        };
        let mut entries = vec![
            DirEntry {
                node,
                name: ".".into(),
                kind: ItemKind::Directory,
            },
            DirEntry {
                node: parent_entry,
                name: "..".into(),
                kind: ItemKind::Directory,
            },
        ];

        let mut children: Vec<Inode> = self
            .deps
            .index
            .children_of(node)
            .into_iter()
            .filter(is_visible)
            .collect();
        children.sort_by(|a, b| a.name().cmp(b.name()));

        entries.extend(children.into_iter().map(|child| DirEntry {
            node: child.id(),
            name: child.name().to_string(),
            kind: child.kind(),
        }));

        Ok(entries.into_iter().skip(offset).collect())
    }

    /// Fetches a directory's remote listing through the scheduler
    ///
    /// Concurrent callers for the same directory share one remote call.
    async fn refresh_directory(
        &self,
        node: NodeId,
        priority: Priority,
    ) -> Result<RemoteOutcome, DriftError> {
        Self::refresh_directory_inner(
            self.deps.clone(),
            self.monitor.clone(),
            self.scheduler.clone(),
            node,
            priority,
        )
        .await
    }

    fn spawn_background_refresh(&self, node: NodeId) {
        let deps = self.deps.clone();
        let monitor = self.monitor.clone();
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::refresh_directory_inner(
                deps,
                monitor,
                scheduler,
                node,
                Priority::Background,
            )
            .await
            {
                debug!(node = %node, error = %e, "Background listing refresh failed");
            }
        });
    }

    async fn refresh_directory_inner(
        deps: std::sync::Arc<driftfs_sync::SyncDeps>,
        monitor: std::sync::Arc<ConnectivityMonitor>,
        scheduler: std::sync::Arc<driftfs_sync::scheduler::RequestScheduler<RemoteOutcome>>,
        node: NodeId,
        priority: Priority,
    ) -> Result<RemoteOutcome, DriftError> {
        let dir = deps
            .index
            .get(node)
            .ok_or_else(|| DriftError::NotFound(format!("node {node}")))?;
        if !dir.is_directory() {
            return Err(DriftError::NotADirectory);
        }
        let Some(remote_id) = dir.remote_id().cloned() else {
            // Purely local directory: the index already has everything.
            deps.index.mark_warm(node);
            return Ok(RemoteOutcome::Listed(0));
        };

        let key = ("LIST", remote_id.as_str().to_string());

        scheduler
            .request(priority, key, CancellationToken::new(), move |_cancel| {
                async move {
                    deps.pacer.acquire("metadata").await;
                    let children =
                        match items::list_children(deps.client.as_ref(), &remote_id).await {
                            Ok(children) => {
                                monitor.note_success();
                                children
                            }
                            Err(e) => {
                                monitor.note_failure(&e);
                                return Err(e);
                            }
                        };

                    let mut upserts = Vec::new();
                    for item in &children {
                        let rid = item.remote_id()?;
                        if let Some(existing) = deps.index.lookup_remote(&rid) {
                            // The delta loop owns content-change handling;
                            // listings only refresh passive metadata.
                            let mut updated = existing.clone();
                            updated.set_remote_etag(item.etag());
                            if !matches!(
                                existing.state(),
                                ItemState::DirtyLocal | ItemState::DeletedLocal
                            ) {
                                if let Some(size) = item.size {
                                    updated.set_size(size);
                                }
                            }
                            if updated != existing {
                                upserts.push(updated);
                            }
                        } else {
                            let kind = if item.is_directory() {
                                ItemKind::Directory
                            } else {
                                ItemKind::File
                            };
                            upserts.push(Inode::from_remote(
                                deps.index.allocate_id(),
                                node,
                                item.name.clone(),
                                kind,
                                rid,
                                item.size.unwrap_or(0),
                                item.etag(),
                                item.quick_xor_hash(),
                                item.last_modified_date_time.unwrap_or_else(Utc::now),
                            ));
                        }
                    }

                    let count = children.len();
                    deps.index.commit(upserts, Vec::new()).await?;
                    deps.index.mark_warm(node);
                    debug!(node = %node, count, "Directory listing refreshed");
                    Ok(RemoteOutcome::Listed(count))
                }
            })
            .await
    }

    /// Fetches a single child entry (scoped lookup revalidation)
    async fn fetch_child(
        &self,
        dir: &Inode,
        name: &str,
    ) -> Result<RemoteOutcome, DriftError> {
        let Some(parent_remote) = dir.remote_id().cloned() else {
            return Ok(RemoteOutcome::Missing);
        };

        let deps = self.deps.clone();
        let monitor = self.monitor.clone();
        let parent = dir.id();
        let name = name.to_string();
        let key = (
            "GET",
            format!("{}/{name}", parent_remote.as_str()),
        );

        self.scheduler
            .request(
                Priority::Foreground,
                key,
                CancellationToken::new(),
                move |_cancel| async move {
                    deps.pacer.acquire("metadata").await;
                    let item = match items::get_child(deps.client.as_ref(), &parent_remote, &name)
                        .await
                    {
                        Ok(item) => {
                            monitor.note_success();
                            item
                        }
                        Err(e) => {
                            monitor.note_failure(&e);
                            return Err(e);
                        }
                    };

                    let Some(item) = item else {
                        return Ok(RemoteOutcome::Missing);
                    };
                    let rid = item.remote_id()?;
                    if let Some(existing) = deps.index.lookup_remote(&rid) {
                        return Ok(RemoteOutcome::Found(existing.id()));
                    }

                    let kind = if item.is_directory() {
                        ItemKind::Directory
                    } else {
                        ItemKind::File
                    };
                    let inode = Inode::from_remote(
                        deps.index.allocate_id(),
                        parent,
                        item.name.clone(),
                        kind,
                        rid,
                        item.size.unwrap_or(0),
                        item.etag(),
                        item.quick_xor_hash(),
                        item.last_modified_date_time.unwrap_or_else(Utc::now),
                    );
                    let id = inode.id();
                    deps.index.insert(inode).await?;
                    Ok(RemoteOutcome::Found(id))
                },
            )
            .await
    }

    // ========================================================================
    // File I/O
    // ========================================================================

    /// Opens a file, hydrating it first when only metadata is local
    pub async fn open(&self, node: NodeId, flags: OpenFlags) -> Result<HandleId, DriftError> {
        let mut inode = self.node(node)?;
        if inode.is_directory() {
            return Err(DriftError::IsADirectory);
        }

        if flags.truncate && flags.write {
            // Content is about to be discarded; no point downloading it.
            self.deps.cache.truncate(node, 0).await?;
            self.mark_dirty(node, false).await?;
        } else if matches!(inode.state(), ItemState::Ghost | ItemState::Error(_)) {
            if self.is_offline() {
                return Err(DriftError::Network(
                    "content not cached and the remote store is unreachable".into(),
                ));
            }
            self.downloads
                .hydrate_and_wait(node, &CancellationToken::new())
                .await?;
        }

        inode = self.node(node)?;
        inode.touch_accessed();
        self.deps.index.apply(inode).await?;

        Ok(self.handles.open(node, flags.read, flags.write))
    }

    /// Reads from an open handle
    pub async fn read(
        &self,
        handle: HandleId,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, DriftError> {
        let handle = self.handles.get(handle)?;
        if !handle.read {
            return Err(DriftError::Validation("handle not open for reading".into()));
        }
        self.deps.cache.read(handle.node, offset, len).await
    }

    /// Writes through an open handle
    pub async fn write(
        &self,
        handle_id: HandleId,
        offset: u64,
        data: &[u8],
    ) -> Result<u32, DriftError> {
        let handle = self.handles.get(handle_id)?;
        if !handle.write {
            return Err(DriftError::Validation("handle not open for writing".into()));
        }

        self.mark_dirty(handle.node, true).await?;
        let written = self.deps.cache.write(handle.node, offset, data).await?;
        self.handles.mark_dirty(handle_id);
        Ok(written as u32)
    }

    /// Transitions a file into `DirtyLocal`, persisting the upload session
    /// skeleton in the same batch, and queues the offline record when the
    /// remote store is unreachable
    ///
    /// `needs_base` says the caller edits on top of the existing bytes; a
    /// placeholder then hydrates first. Whole-file replacements skip it.
    async fn mark_dirty(&self, node: NodeId, needs_base: bool) -> Result<(), DriftError> {
        let inode = self.node(node)?;
        match inode.state() {
            ItemState::DirtyLocal => return Ok(()),
            ItemState::Ghost if needs_base && !self.is_offline() => {
                // Partial overwrite of a placeholder needs the base bytes.
                self.downloads
                    .hydrate_and_wait(node, &CancellationToken::new())
                    .await?;
            }
            ItemState::Ghost if needs_base => {
                return Err(DriftError::Network(
                    "content not cached and the remote store is unreachable".into(),
                ));
            }
            _ => {}
        }

        let mut updated = self.node(node)?;
        let base_etag = updated.local_etag().cloned();
        if !matches!(updated.state(), ItemState::DirtyLocal) {
            updated.transition_to(ItemState::DirtyLocal)?;
        }
        updated.set_modified_at(Utc::now());

        let session = UploadSession::small(node, updated.size(), base_etag.clone());
        self.deps
            .index
            .commit(
                vec![updated],
                vec![records::upload_session_put(&session)?],
            )
            .await?;

        if self.is_offline() {
            self.deps
                .offline
                .record(node, OfflineOpKind::Modify, base_etag)
                .await?;
        }
        Ok(())
    }

    /// Flushes handle state: refresh inode size/mtime from the cache and,
    /// while online, queue the upload
    pub async fn flush(&self, handle_id: HandleId) -> Result<(), DriftError> {
        let handle = self.handles.get(handle_id)?;
        if handle.dirty {
            self.sync_node(handle.node).await?;
        }
        Ok(())
    }

    /// Like `flush`, for `fsync`
    pub async fn fsync(&self, handle_id: HandleId) -> Result<(), DriftError> {
        self.flush(handle_id).await
    }

    /// Closes a handle; dirty handles trigger an upload
    pub async fn release(&self, handle_id: HandleId) -> Result<(), DriftError> {
        let handle = self.handles.release(handle_id)?;
        if handle.dirty {
            self.sync_node(handle.node).await?;
        }
        Ok(())
    }

    async fn sync_node(&self, node: NodeId) -> Result<(), DriftError> {
        if let Some(stat) = self.deps.cache.stat(node).await? {
            let mut inode = self.node(node)?;
            if inode.size() != stat.size {
                inode.set_size(stat.size);
                self.deps.index.apply(inode).await?;
            }
        }

        if !self.is_offline() {
            if let Err(e) = self.uploads.enqueue(node, Priority::Background) {
                warn!(node = %node, error = %e, "Could not queue upload");
            }
        }
        Ok(())
    }

    // ========================================================================
    // Namespace mutations
    // ========================================================================

    /// Creates a file and opens it read-write
    pub async fn create(
        &self,
        parent: NodeId,
        name: &str,
        _mode: u32,
    ) -> Result<(NodeAttributes, HandleId), DriftError> {
        validate_name(name)?;
        self.directory(parent)?;
        if self
            .deps
            .index
            .lookup(parent, name)
            .is_some_and(|existing| is_visible(&existing))
        {
            return Err(DriftError::Validation(format!("'{name}' already exists")));
        }

        let inode = Inode::new_local(
            self.deps.index.allocate_id(),
            parent,
            name,
            ItemKind::File,
        );
        let node = inode.id();
        let attrs = attributes_of(&inode);

        // The dirty item and its upload session land in one batch.
        let session = UploadSession::small(node, 0, None);
        self.deps
            .index
            .commit(vec![inode], vec![records::upload_session_put(&session)?])
            .await?;
        self.deps.cache.truncate(node, 0).await?;

        if self.is_offline() {
            self.deps
                .offline
                .record(node, OfflineOpKind::Create, None)
                .await?;
        }

        let handle = self.handles.open(node, true, true);
        Ok((attrs, handle))
    }

    /// Creates a directory
    pub async fn mkdir(
        &self,
        parent: NodeId,
        name: &str,
        _mode: u32,
    ) -> Result<NodeAttributes, DriftError> {
        validate_name(name)?;
        self.directory(parent)?;
        if self
            .deps
            .index
            .lookup(parent, name)
            .is_some_and(|existing| is_visible(&existing))
        {
            return Err(DriftError::Validation(format!("'{name}' already exists")));
        }

        let inode = Inode::new_local(
            self.deps.index.allocate_id(),
            parent,
            name,
            ItemKind::Directory,
        );
        let node = inode.id();
        let attrs = attributes_of(&inode);
        self.deps.index.insert(inode).await?;
        // A brand new directory is trivially fully listed.
        self.deps.index.mark_warm(node);

        if self.is_offline() {
            self.deps
                .offline
                .record(node, OfflineOpKind::Create, None)
                .await?;
        } else if let Err(e) = self.uploads.enqueue(node, Priority::Background) {
            warn!(node = %node, error = %e, "Could not queue directory creation");
        }

        Ok(attrs)
    }

    /// Removes a file
    pub async fn unlink(&self, parent: NodeId, name: &str) -> Result<(), DriftError> {
        let target = self
            .deps
            .index
            .lookup(parent, name)
            .filter(is_visible)
            .ok_or_else(|| DriftError::NotFound(name.into()))?;
        if target.is_directory() {
            return Err(DriftError::IsADirectory);
        }
        self.remove_node(target).await
    }

    /// Removes an empty directory
    pub async fn rmdir(&self, parent: NodeId, name: &str) -> Result<(), DriftError> {
        let target = self
            .deps
            .index
            .lookup(parent, name)
            .filter(is_visible)
            .ok_or_else(|| DriftError::NotFound(name.into()))?;
        if !target.is_directory() {
            return Err(DriftError::NotADirectory);
        }
        if self
            .deps
            .index
            .children_of(target.id())
            .iter()
            .any(is_visible)
        {
            return Err(DriftError::NotEmpty);
        }
        self.remove_node(target).await
    }

    async fn remove_node(&self, target: Inode) -> Result<(), DriftError> {
        let node = target.id();
        let base_etag = target.local_etag().cloned();

        if target.remote_id().is_none() {
            // Never reached the remote store: disappear locally, and while
            // offline cancel any queued create.
            self.deps.cache.delete(node).await?;
            self.deps
                .index
                .remove(
                    node,
                    vec![
                        records::content_hash_delete(node),
                        records::upload_session_delete(node),
                    ],
                )
                .await?;
            if self.is_offline() {
                self.deps
                    .offline
                    .record(node, OfflineOpKind::Delete, None)
                    .await?;
            }
            return Ok(());
        }

        let mut updated = target;
        updated.mark_deleted()?;
        self.deps.index.apply(updated).await?;

        if self.is_offline() {
            self.deps
                .offline
                .record(node, OfflineOpKind::Delete, base_etag)
                .await?;
        } else if let Err(e) = self.uploads.enqueue(node, Priority::Foreground) {
            warn!(node = %node, error = %e, "Could not queue remote delete");
        }
        Ok(())
    }

    /// Renames and/or moves an entry
    pub async fn rename(
        &self,
        old_parent: NodeId,
        old_name: &str,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<(), DriftError> {
        validate_name(new_name)?;
        let source = self
            .deps
            .index
            .lookup(old_parent, old_name)
            .filter(is_visible)
            .ok_or_else(|| DriftError::NotFound(old_name.into()))?;
        self.directory(new_parent)?;

        // POSIX rename replaces an existing file target.
        if let Some(existing) = self
            .deps
            .index
            .lookup(new_parent, new_name)
            .filter(is_visible)
        {
            if existing.id() != source.id() {
                if existing.is_directory() {
                    return Err(DriftError::IsADirectory);
                }
                self.remove_node(existing).await?;
            }
        }

        let base_etag = source.local_etag().cloned();
        self.deps
            .index
            .rename(source.id(), new_parent, new_name)
            .await?;

        if self.is_offline() {
            self.deps
                .offline
                .record(
                    source.id(),
                    OfflineOpKind::Move {
                        new_parent,
                        new_name: new_name.to_string(),
                    },
                    base_etag,
                )
                .await?;
            return Ok(());
        }

        // Push the move remotely right away; a connectivity failure falls
        // back to the offline queue.
        if let Some(remote_id) = source.remote_id() {
            let parent_remote = self
                .deps
                .index
                .get(new_parent)
                .and_then(|p| p.remote_id().cloned());
            self.deps.pacer.acquire("metadata").await;
            match items::move_item(
                self.deps.client.as_ref(),
                remote_id,
                parent_remote.as_ref(),
                new_name,
            )
            .await
            {
                Ok(updated) => {
                    self.monitor.note_success();
                    let mut refreshed = self.node(source.id())?;
                    refreshed.set_remote_etag(updated.etag());
                    if matches!(refreshed.state(), ItemState::Hydrated) {
                        refreshed.set_local_etag(updated.etag());
                    }
                    self.deps.index.apply(refreshed).await?;
                }
                Err(e) => {
                    self.monitor.note_failure(&e);
                    if ConnectivityMonitor::classify_offline(&e).is_some() {
                        self.deps
                            .offline
                            .record(
                                source.id(),
                                OfflineOpKind::Move {
                                    new_parent,
                                    new_name: new_name.to_string(),
                                },
                                base_etag,
                            )
                            .await?;
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies attribute changes
    pub async fn set_attributes(
        &self,
        node: NodeId,
        attrs: SetAttrs,
    ) -> Result<NodeAttributes, DriftError> {
        if let Some(size) = attrs.size {
            let inode = self.node(node)?;
            if inode.is_directory() {
                return Err(DriftError::IsADirectory);
            }
            // Truncating to zero replaces the content outright; shrinking
            // to a non-zero size still needs the base bytes.
            self.mark_dirty(node, size > 0).await?;
            self.deps.cache.truncate(node, size).await?;
        }

        let mut inode = self.node(node)?;
        if let Some(size) = attrs.size {
            inode.set_size(size);
        }
        if let Some(modified) = attrs.modified {
            inode.set_modified_at(modified);
        }
        if attrs.accessed.is_some() {
            inode.touch_accessed();
        }
        let result = attributes_of(&inode);
        self.deps.index.apply(inode).await?;
        Ok(result)
    }

    /// Filesystem-level statistics
    pub fn statfs(&self) -> FsStats {
        FsStats {
            block_size: 4096,
            blocks: u64::MAX / 4096,
            blocks_free: u64::MAX / 8192,
            blocks_available: u64::MAX / 8192,
            files: self.deps.index.node_count() as u64,
            name_max: 255,
        }
    }

    // ========================================================================
    // Status surface
    // ========================================================================

    /// Reads a status xattr
    pub fn getxattr(&self, node: NodeId, name: &str) -> Result<Option<Vec<u8>>, DriftError> {
        let inode = self.node(node)?;
        let progress = self.deps.status.progress(node);
        Ok(xattr::get_xattr(&inode, name, progress))
    }

    /// Lists the supported xattr names
    pub fn listxattr(&self) -> Vec<&'static str> {
        xattr::list_xattrs()
    }

    /// Pins a file: hydrates it and exempts it from cache eviction
    pub async fn pin(&self, node: NodeId) -> Result<(), DriftError> {
        let mut inode = self.node(node)?;
        if inode.is_directory() {
            return Err(DriftError::IsADirectory);
        }
        inode.set_pinned(true);
        let needs_hydration = matches!(inode.state(), ItemState::Ghost);
        self.deps.index.apply(inode).await?;

        if needs_hydration && !self.is_offline() {
            self.downloads.enqueue(node, Priority::Background)?;
        }
        Ok(())
    }

    /// Returns a pinned file to the normal eviction policy
    pub async fn unpin(&self, node: NodeId) -> Result<(), DriftError> {
        let mut inode = self.node(node)?;
        inode.set_pinned(false);
        self.deps.index.apply(inode).await
    }
}
