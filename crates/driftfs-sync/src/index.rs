//! Metadata index
//!
//! The authoritative in-memory view of the projected tree: an arena of
//! inodes with reverse child lookups, loaded from the persistent store at
//! mount and kept write-through afterwards. Every mutation persists through
//! one atomic batch before the in-memory maps change, so readers observe
//! either the old tree or the new one, never a half-applied edit.
//!
//! Directory freshness is tracked per node: a directory that has never been
//! listed from the remote store is *cold* (callers must fetch before
//! trusting a miss), a recently listed one is *fresh*, and one past the
//! refresh interval is *stale* (serve cached entries, refresh in the
//! background).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use driftfs_cache::CacheEntryPolicy;
use driftfs_core::domain::{DriftError, Inode, ItemState, NodeId, RemoteId};
use driftfs_store::{records, BatchOp, Store};

/// Directory freshness classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warmth {
    /// Never listed; a miss is not authoritative
    Cold,
    /// Listed within the refresh interval
    Fresh,
    /// Listed, but past the refresh interval
    Stale,
}

/// In-memory metadata index over the persistent store
pub struct MetadataIndex {
    store: Arc<Store>,
    nodes: DashMap<NodeId, Inode>,
    /// parent → name → child
    children: DashMap<NodeId, HashMap<String, NodeId>>,
    /// remote id → node
    by_remote: DashMap<String, NodeId>,
    /// directory → last remote listing
    warm: DashMap<NodeId, Instant>,
    next_id: AtomicU64,
    /// Serializes mutations so store batches and map updates stay coherent
    write_lock: Mutex<()>,
}

impl MetadataIndex {
    /// Loads the tree from the store, creating the root on first mount
    ///
    /// Inodes stuck in a transient state by a crash are reset (`Hydrating`
    /// falls back to `Ghost`) in one batch before the index goes live.
    pub async fn load(store: Arc<Store>) -> Result<Self, DriftError> {
        let mut inodes = store.load_inodes().await?;

        if inodes.is_empty() {
            let root = Inode::root();
            store
                .batch(vec![
                    records::inode_put(&root)?,
                    records::counter_put(records::NEXT_NODE_ID_KEY, 2)?,
                ])
                .await?;
            inodes.push(root);
        }

        // Crash recovery: re-hydration is idempotent, transient states are
        // not worth resuming.
        let mut reset_ops = Vec::new();
        for inode in &mut inodes {
            if matches!(inode.state(), ItemState::Hydrating) {
                inode.reset_transient();
                reset_ops.push(records::inode_put(inode)?);
            }
        }
        if !reset_ops.is_empty() {
            info!(count = reset_ops.len(), "Resetting transient states after restart");
            store.batch(reset_ops).await?;
        }

        let max_id = inodes.iter().map(|i| i.id().as_u64()).max().unwrap_or(1);
        let counter = store.get_counter(records::NEXT_NODE_ID_KEY, max_id + 1).await?;

        let index = Self {
            store,
            nodes: DashMap::new(),
            children: DashMap::new(),
            by_remote: DashMap::new(),
            warm: DashMap::new(),
            next_id: AtomicU64::new(counter.max(max_id + 1)),
            write_lock: Mutex::new(()),
        };

        for inode in inodes {
            index.link(&inode);
            index.nodes.insert(inode.id(), inode);
        }

        info!(nodes = index.nodes.len(), "Metadata index loaded");
        Ok(index)
    }

    /// Allocates the next node id
    pub fn allocate_id(&self) -> NodeId {
        NodeId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn counter_op(&self) -> Result<BatchOp, DriftError> {
        records::counter_put(records::NEXT_NODE_ID_KEY, self.next_id.load(Ordering::SeqCst))
    }

    fn link(&self, inode: &Inode) {
        if inode.id() != NodeId::ROOT {
            self.children
                .entry(inode.parent())
                .or_default()
                .insert(inode.name().to_string(), inode.id());
        }
        if let Some(remote) = inode.remote_id() {
            self.by_remote.insert(remote.as_str().to_string(), inode.id());
        }
        if inode.is_directory() {
            self.children.entry(inode.id()).or_default();
        }
    }

    fn unlink(&self, inode: &Inode) {
        if let Some(mut siblings) = self.children.get_mut(&inode.parent()) {
            siblings.remove(inode.name());
        }
        if let Some(remote) = inode.remote_id() {
            self.by_remote.remove(remote.as_str());
        }
    }

    // --- Read surface ---

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<Inode> {
        self.nodes.get(&id).map(|i| i.clone())
    }

    /// Looks up a child by name; `None` is only authoritative for warm
    /// directories
    #[must_use]
    pub fn lookup(&self, parent: NodeId, name: &str) -> Option<Inode> {
        let child = self.children.get(&parent)?.get(name).copied()?;
        self.get(child)
    }

    /// Snapshot of a directory's children
    #[must_use]
    pub fn children_of(&self, id: NodeId) -> Vec<Inode> {
        match self.children.get(&id) {
            Some(entries) => entries
                .values()
                .filter_map(|child| self.get(*child))
                .collect(),
            None => Vec::new(),
        }
    }

    #[must_use]
    pub fn lookup_remote(&self, remote_id: &RemoteId) -> Option<Inode> {
        let id = self.by_remote.get(remote_id.as_str()).map(|e| *e)?;
        self.get(id)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Every node matching `pred`; used by pipelines to find work
    pub fn nodes_matching(&self, pred: impl Fn(&Inode) -> bool) -> Vec<Inode> {
        self.nodes
            .iter()
            .filter(|entry| pred(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    // --- Warmth ---

    /// Records that a directory listing was just fetched
    pub fn mark_warm(&self, id: NodeId) {
        self.warm.insert(id, Instant::now());
    }

    #[must_use]
    pub fn warmth(&self, id: NodeId, refresh_interval: Duration) -> Warmth {
        match self.warm.get(&id) {
            None => Warmth::Cold,
            Some(at) if at.elapsed() > refresh_interval => Warmth::Stale,
            Some(_) => Warmth::Fresh,
        }
    }

    // --- Mutations ---

    /// Persists a set of inode updates plus extra ops in one atomic batch,
    /// then updates the in-memory maps
    pub async fn commit(
        &self,
        inodes: Vec<Inode>,
        extra_ops: Vec<BatchOp>,
    ) -> Result<(), DriftError> {
        let _guard = self.write_lock.lock().await;
        self.commit_locked(inodes, extra_ops).await
    }

    async fn commit_locked(
        &self,
        inodes: Vec<Inode>,
        extra_ops: Vec<BatchOp>,
    ) -> Result<(), DriftError> {
        let mut ops = Vec::with_capacity(inodes.len() + extra_ops.len() + 1);
        for inode in &inodes {
            inode.validate()?;
            ops.push(records::inode_put(inode)?);
        }
        ops.push(self.counter_op()?);
        ops.extend(extra_ops);

        self.store.batch(ops).await?;

        for inode in inodes {
            if let Some(old) = self.nodes.get(&inode.id()).map(|e| e.clone()) {
                // Re-link when the edge or remote binding changed.
                if old.parent() != inode.parent()
                    || old.name() != inode.name()
                    || old.remote_id() != inode.remote_id()
                {
                    self.unlink(&old);
                }
            }
            self.link(&inode);
            self.nodes.insert(inode.id(), inode);
        }
        Ok(())
    }

    /// Persists one inode update
    pub async fn apply(&self, inode: Inode) -> Result<(), DriftError> {
        self.commit(vec![inode], Vec::new()).await
    }

    /// Inserts a new child, rejecting duplicates within its parent
    pub async fn insert(&self, inode: Inode) -> Result<(), DriftError> {
        let _guard = self.write_lock.lock().await;
        if self
            .children
            .get(&inode.parent())
            .is_some_and(|c| c.contains_key(inode.name()))
        {
            return Err(DriftError::Validation(format!(
                "name '{}' already exists in {}",
                inode.name(),
                inode.parent()
            )));
        }
        if !self.nodes.contains_key(&inode.parent()) {
            return Err(DriftError::NotFound(format!(
                "parent {} of '{}'",
                inode.parent(),
                inode.name()
            )));
        }
        debug!(node = %inode.id(), parent = %inode.parent(), name = inode.name(), "Inserting inode");
        self.commit_locked(vec![inode], Vec::new()).await
    }

    /// Moves and/or renames a node
    pub async fn rename(
        &self,
        id: NodeId,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<Inode, DriftError> {
        let _guard = self.write_lock.lock().await;

        let mut inode = self
            .get(id)
            .ok_or_else(|| DriftError::NotFound(format!("node {id}")))?;
        if !self.nodes.contains_key(&new_parent) {
            return Err(DriftError::NotFound(format!("target parent {new_parent}")));
        }
        if self
            .children
            .get(&new_parent)
            .is_some_and(|c| c.get(new_name).is_some_and(|existing| *existing != id))
        {
            return Err(DriftError::Validation(format!(
                "name '{new_name}' already exists in {new_parent}"
            )));
        }

        debug!(node = %id, new_parent = %new_parent, new_name, "Renaming inode");
        inode.set_parent(new_parent);
        inode.set_name(new_name);
        inode.set_modified_at(chrono::Utc::now());

        self.commit_locked(vec![inode.clone()], Vec::new()).await?;
        Ok(inode)
    }

    /// Removes a leaf node; directories must be empty
    ///
    /// `extra_ops` join the removal batch (content hash deletes, session
    /// deletes) so no orphaned records survive a crash.
    pub async fn remove(&self, id: NodeId, extra_ops: Vec<BatchOp>) -> Result<(), DriftError> {
        let _guard = self.write_lock.lock().await;

        let inode = self
            .get(id)
            .ok_or_else(|| DriftError::NotFound(format!("node {id}")))?;
        if self.children.get(&id).is_some_and(|c| !c.is_empty()) {
            return Err(DriftError::NotEmpty);
        }

        let mut ops = vec![records::inode_delete(id)];
        ops.extend(extra_ops);
        self.store.batch(ops).await?;

        self.unlink(&inode);
        self.nodes.remove(&id);
        self.children.remove(&id);
        self.warm.remove(&id);
        debug!(node = %id, "Inode removed");
        Ok(())
    }

    /// Removes a node and everything under it in one batch
    ///
    /// Returns the removed ids so the caller can drop cache entries.
    pub async fn remove_subtree(&self, id: NodeId) -> Result<Vec<NodeId>, DriftError> {
        let _guard = self.write_lock.lock().await;

        let root = self
            .get(id)
            .ok_or_else(|| DriftError::NotFound(format!("node {id}")))?;

        // Collect depth-first.
        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            removed.push(current);
            if let Some(entries) = self.children.get(&current) {
                stack.extend(entries.values().copied());
            }
        }

        let mut ops = Vec::with_capacity(removed.len() * 2);
        for node in &removed {
            ops.push(records::inode_delete(*node));
            ops.push(records::content_hash_delete(*node));
            ops.push(records::upload_session_delete(*node));
            ops.push(records::download_session_delete(*node));
        }
        self.store.batch(ops).await?;

        self.unlink(&root);
        for node in &removed {
            if let Some((_, inode)) = self.nodes.remove(node) {
                if let Some(remote) = inode.remote_id() {
                    self.by_remote.remove(remote.as_str());
                }
            }
            self.children.remove(node);
            self.warm.remove(node);
        }

        debug!(root = %id, removed = removed.len(), "Subtree removed");
        Ok(removed)
    }

    /// Applies a whole delta cycle in one atomic batch
    ///
    /// Upserts, removals (already expanded to full subtrees by the caller),
    /// and extra ops (the new cursor, hash invalidations) commit together:
    /// a crash between cycles never leaves a half-applied delta, and the
    /// result is independent of how the remote store paginated the changes.
    pub async fn commit_delta(
        &self,
        upserts: Vec<Inode>,
        removals: Vec<NodeId>,
        extra_ops: Vec<BatchOp>,
    ) -> Result<(), DriftError> {
        let _guard = self.write_lock.lock().await;

        let mut ops = Vec::with_capacity(upserts.len() + removals.len() * 4 + extra_ops.len() + 1);
        for inode in &upserts {
            inode.validate()?;
            ops.push(records::inode_put(inode)?);
        }
        for node in &removals {
            ops.push(records::inode_delete(*node));
            ops.push(records::content_hash_delete(*node));
            ops.push(records::upload_session_delete(*node));
            ops.push(records::download_session_delete(*node));
        }
        ops.push(self.counter_op()?);
        ops.extend(extra_ops);

        self.store.batch(ops).await?;

        for node in &removals {
            if let Some((_, inode)) = self.nodes.remove(node) {
                self.unlink(&inode);
            }
            self.children.remove(node);
            self.warm.remove(node);
        }
        for inode in upserts {
            if let Some(old) = self.nodes.get(&inode.id()).map(|e| e.clone()) {
                if old.parent() != inode.parent()
                    || old.name() != inode.name()
                    || old.remote_id() != inode.remote_id()
                {
                    self.unlink(&old);
                }
            }
            self.link(&inode);
            self.nodes.insert(inode.id(), inode);
        }
        Ok(())
    }

    /// Expands a node to the full list of ids under it (itself included)
    #[must_use]
    pub fn subtree_ids(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            out.push(current);
            if let Some(entries) = self.children.get(&current) {
                stack.extend(entries.values().copied());
            }
        }
        out
    }

    /// Policy view of every node that may hold cache bytes, for cleanup
    #[must_use]
    pub fn cache_policies(&self) -> HashMap<NodeId, CacheEntryPolicy> {
        self.nodes
            .iter()
            .map(|entry| {
                let inode = entry.value();
                (
                    inode.id(),
                    CacheEntryPolicy {
                        pinned: inode.is_pinned(),
                        dirty: inode.state().has_pending_changes()
                            || matches!(inode.state(), ItemState::Conflict),
                        last_access: inode.accessed_at(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use driftfs_core::domain::{ETag, ItemKind};

    async fn index() -> MetadataIndex {
        let store = Arc::new(Store::in_memory().await.unwrap());
        MetadataIndex::load(store).await.unwrap()
    }

    fn file(index: &MetadataIndex, parent: NodeId, name: &str, remote: &str) -> Inode {
        Inode::from_remote(
            index.allocate_id(),
            parent,
            name,
            ItemKind::File,
            RemoteId::new(remote).unwrap(),
            10,
            Some(ETag::new(format!("{remote}-E1")).unwrap()),
            None,
            Utc::now(),
        )
    }

    fn directory(index: &MetadataIndex, parent: NodeId, name: &str, remote: &str) -> Inode {
        Inode::from_remote(
            index.allocate_id(),
            parent,
            name,
            ItemKind::Directory,
            RemoteId::new(remote).unwrap(),
            0,
            None,
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_load_creates_root() {
        let idx = index().await;
        let root = idx.get(NodeId::ROOT).unwrap();
        assert!(root.is_directory());
        assert_eq!(root.parent(), NodeId::SENTINEL);
        assert_eq!(idx.node_count(), 1);
    }

    #[tokio::test]
    async fn test_insert_lookup_children() {
        let idx = index().await;

        let docs = directory(&idx, NodeId::ROOT, "docs", "R-docs");
        let docs_id = docs.id();
        idx.insert(docs).await.unwrap();

        let a = file(&idx, docs_id, "a.txt", "R-a");
        idx.insert(a.clone()).await.unwrap();

        assert_eq!(idx.lookup(NodeId::ROOT, "docs").unwrap().id(), docs_id);
        assert_eq!(idx.lookup(docs_id, "a.txt").unwrap().id(), a.id());
        assert!(idx.lookup(docs_id, "missing.txt").is_none());

        let children = idx.children_of(docs_id);
        assert_eq!(children.len(), 1);
        assert_eq!(
            idx.lookup_remote(&RemoteId::new("R-a").unwrap()).unwrap().id(),
            a.id()
        );
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_names() {
        let idx = index().await;
        idx.insert(file(&idx, NodeId::ROOT, "x.txt", "R1")).await.unwrap();

        let duplicate = file(&idx, NodeId::ROOT, "x.txt", "R2");
        assert!(matches!(
            idx.insert(duplicate).await,
            Err(DriftError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_requires_live_parent() {
        let idx = index().await;
        let orphan = file(&idx, NodeId::new(999), "lost.txt", "R1");
        assert!(matches!(
            idx.insert(orphan).await,
            Err(DriftError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_moves_edges() {
        let idx = index().await;

        let docs = directory(&idx, NodeId::ROOT, "docs", "R-docs");
        let docs_id = docs.id();
        idx.insert(docs).await.unwrap();
        let a = file(&idx, NodeId::ROOT, "a.txt", "R-a");
        let a_id = a.id();
        idx.insert(a).await.unwrap();

        idx.rename(a_id, docs_id, "renamed.txt").await.unwrap();

        assert!(idx.lookup(NodeId::ROOT, "a.txt").is_none());
        let moved = idx.lookup(docs_id, "renamed.txt").unwrap();
        assert_eq!(moved.id(), a_id);
        assert_eq!(moved.parent(), docs_id);
    }

    #[tokio::test]
    async fn test_rename_rejects_occupied_target() {
        let idx = index().await;
        let a = file(&idx, NodeId::ROOT, "a.txt", "R-a");
        let a_id = a.id();
        idx.insert(a).await.unwrap();
        idx.insert(file(&idx, NodeId::ROOT, "b.txt", "R-b")).await.unwrap();

        assert!(matches!(
            idx.rename(a_id, NodeId::ROOT, "b.txt").await,
            Err(DriftError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_requires_empty_directory() {
        let idx = index().await;
        let docs = directory(&idx, NodeId::ROOT, "docs", "R-docs");
        let docs_id = docs.id();
        idx.insert(docs).await.unwrap();
        let f = file(&idx, docs_id, "f.txt", "R-f");
        let f_id = f.id();
        idx.insert(f).await.unwrap();

        assert!(matches!(
            idx.remove(docs_id, Vec::new()).await,
            Err(DriftError::NotEmpty)
        ));

        idx.remove(f_id, Vec::new()).await.unwrap();
        idx.remove(docs_id, Vec::new()).await.unwrap();
        assert!(idx.lookup(NodeId::ROOT, "docs").is_none());
    }

    #[tokio::test]
    async fn test_remove_subtree() {
        let idx = index().await;
        let docs = directory(&idx, NodeId::ROOT, "docs", "R-docs");
        let docs_id = docs.id();
        idx.insert(docs).await.unwrap();
        let sub = directory(&idx, docs_id, "sub", "R-sub");
        let sub_id = sub.id();
        idx.insert(sub).await.unwrap();
        idx.insert(file(&idx, sub_id, "deep.txt", "R-deep")).await.unwrap();

        let removed = idx.remove_subtree(docs_id).await.unwrap();
        assert_eq!(removed.len(), 3);
        assert!(idx.lookup(NodeId::ROOT, "docs").is_none());
        assert!(idx.lookup_remote(&RemoteId::new("R-deep").unwrap()).is_none());
        assert_eq!(idx.node_count(), 1);
    }

    #[tokio::test]
    async fn test_state_survives_reload() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let idx = MetadataIndex::load(store.clone()).await.unwrap();

        let docs = directory(&idx, NodeId::ROOT, "docs", "R-docs");
        let docs_id = docs.id();
        idx.insert(docs).await.unwrap();
        let allocated = idx.allocate_id();
        idx.insert(file(&idx, docs_id, "a.txt", "R-a")).await.unwrap();

        let reloaded = MetadataIndex::load(store).await.unwrap();
        assert_eq!(reloaded.node_count(), 3);
        assert!(reloaded.lookup(NodeId::ROOT, "docs").is_some());
        // The allocator never reissues ids from the previous run.
        assert!(reloaded.allocate_id() > allocated);
    }

    #[tokio::test]
    async fn test_hydrating_resets_to_ghost_on_load() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let idx = MetadataIndex::load(store.clone()).await.unwrap();

        let mut f = file(&idx, NodeId::ROOT, "mid.txt", "R-mid");
        f.start_hydrating().unwrap();
        let f_id = f.id();
        idx.insert(f).await.unwrap();

        let reloaded = MetadataIndex::load(store).await.unwrap();
        assert_eq!(reloaded.get(f_id).unwrap().state(), &ItemState::Ghost);
    }

    #[tokio::test]
    async fn test_warmth_transitions() {
        let idx = index().await;
        let ttl = Duration::from_secs(30);

        assert_eq!(idx.warmth(NodeId::ROOT, ttl), Warmth::Cold);
        idx.mark_warm(NodeId::ROOT);
        assert_eq!(idx.warmth(NodeId::ROOT, ttl), Warmth::Fresh);
        assert_eq!(idx.warmth(NodeId::ROOT, Duration::ZERO), Warmth::Stale);
    }

    #[tokio::test]
    async fn test_cache_policies_reflect_pin_and_dirty() {
        let idx = index().await;

        let mut pinned = file(&idx, NodeId::ROOT, "pinned.txt", "R-p");
        pinned.set_pinned(true);
        let pinned_id = pinned.id();
        idx.insert(pinned).await.unwrap();

        let policies = idx.cache_policies();
        assert!(policies.get(&pinned_id).unwrap().pinned);
        assert!(!policies.get(&pinned_id).unwrap().dirty);
    }
}
