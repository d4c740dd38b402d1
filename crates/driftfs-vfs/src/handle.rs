//! Open-file handle table

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use driftfs_core::domain::{DriftError, NodeId};

/// Opaque handle identifier returned by `open`/`create`
pub type HandleId = u64;

/// One open file
#[derive(Debug, Clone)]
pub struct Handle {
    pub node: NodeId,
    pub read: bool,
    pub write: bool,
    /// Set once a write lands through this handle
    pub dirty: bool,
}

/// Table of open handles for one mount
pub struct HandleTable {
    next: AtomicU64,
    handles: DashMap<HandleId, Handle>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            handles: DashMap::new(),
        }
    }

    pub fn open(&self, node: NodeId, read: bool, write: bool) -> HandleId {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        self.handles.insert(
            id,
            Handle {
                node,
                read,
                write,
                dirty: false,
            },
        );
        id
    }

    pub fn get(&self, id: HandleId) -> Result<Handle, DriftError> {
        self.handles
            .get(&id)
            .map(|h| h.clone())
            .ok_or_else(|| DriftError::NotFound(format!("handle {id}")))
    }

    pub fn mark_dirty(&self, id: HandleId) {
        if let Some(mut handle) = self.handles.get_mut(&id) {
            handle.dirty = true;
        }
    }

    /// Removes the handle, returning its final state
    pub fn release(&self, id: HandleId) -> Result<Handle, DriftError> {
        self.handles
            .remove(&id)
            .map(|(_, h)| h)
            .ok_or_else(|| DriftError::NotFound(format!("handle {id}")))
    }

    /// Open handles for a node (used to refuse eviction of open files)
    #[must_use]
    pub fn open_count(&self, node: NodeId) -> usize {
        self.handles.iter().filter(|e| e.node == node).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_get_release() {
        let table = HandleTable::new();
        let id = table.open(NodeId::new(2), true, false);

        let handle = table.get(id).unwrap();
        assert_eq!(handle.node, NodeId::new(2));
        assert!(handle.read);
        assert!(!handle.write);
        assert!(!handle.dirty);

        let released = table.release(id).unwrap();
        assert_eq!(released.node, NodeId::new(2));
        assert!(table.get(id).is_err());
    }

    #[test]
    fn test_handles_are_unique() {
        let table = HandleTable::new();
        let a = table.open(NodeId::new(2), true, true);
        let b = table.open(NodeId::new(2), true, true);
        assert_ne!(a, b);
        assert_eq!(table.open_count(NodeId::new(2)), 2);
    }

    #[test]
    fn test_mark_dirty() {
        let table = HandleTable::new();
        let id = table.open(NodeId::new(3), true, true);
        table.mark_dirty(id);
        assert!(table.get(id).unwrap().dirty);
    }

    #[test]
    fn test_release_unknown_handle() {
        let table = HandleTable::new();
        assert!(matches!(table.release(99), Err(DriftError::NotFound(_))));
    }
}
