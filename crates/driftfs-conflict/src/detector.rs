//! Conflict detection
//!
//! Divergence is decided by ETag comparison, never by timestamps: the
//! `local_etag` records which remote version the local bytes started from,
//! so any difference from the current remote ETag while local edits are
//! pending means both sides moved.

use tracing::debug;

use driftfs_core::domain::{ETag, Inode, ItemState};

/// Classification of a detected divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Both sides edited the content
    EditEdit,
    /// Local edits pending, remote deleted the item
    EditDelete,
    /// Local delete pending, remote edited the item
    DeleteEdit,
}

/// Checks a dirty item against the latest observed remote state
///
/// `remote_etag == None` means the item disappeared from the remote store.
/// Returns `None` when the item has no pending local changes or the remote
/// side did not move.
#[must_use]
pub fn detect(inode: &Inode, remote_etag: Option<&ETag>) -> Option<ConflictKind> {
    let kind = match (inode.state(), remote_etag) {
        (ItemState::DirtyLocal, Some(remote)) => {
            // The baseline is the etag the local edit started from.
            match inode.local_etag() {
                Some(base) if base == remote => None,
                // A never-uploaded local item that suddenly has a remote
                // counterpart also counts as divergence.
                _ => Some(ConflictKind::EditEdit),
            }
        }
        (ItemState::DirtyLocal, None) => {
            // Remote deletion only conflicts with an item that existed
            // remotely before.
            inode.remote_id().map(|_| ConflictKind::EditDelete)
        }
        (ItemState::DeletedLocal, Some(remote)) => {
            // A never-hydrated item has no local etag; the version last
            // observed from the remote store is its baseline.
            match inode.local_etag().or(inode.remote_etag()) {
                Some(base) if base == remote => None,
                _ => Some(ConflictKind::DeleteEdit),
            }
        }
        _ => None,
    };

    if let Some(kind) = kind {
        debug!(
            node = %inode.id(),
            state = %inode.state(),
            kind = ?kind,
            "Divergence detected"
        );
    }
    kind
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use driftfs_core::domain::{ItemKind, NodeId, QuickXorHash, RemoteId};

    fn dirty_inode(base_etag: &str) -> Inode {
        let mut inode = Inode::from_remote(
            NodeId::new(2),
            NodeId::ROOT,
            "b.txt",
            ItemKind::File,
            RemoteId::new("R1").unwrap(),
            1,
            Some(ETag::new(base_etag).unwrap()),
            None,
            Utc::now(),
        );
        inode.start_hydrating().unwrap();
        inode
            .complete_hydration(
                ETag::new(base_etag).unwrap(),
                QuickXorHash::new("AAAAAAAAAAAAAAAAAAAAAAAAAAA=").unwrap(),
                1,
            )
            .unwrap();
        inode.mark_dirty().unwrap();
        inode
    }

    #[test]
    fn test_no_conflict_when_remote_unchanged() {
        let inode = dirty_inode("E1");
        let remote = ETag::new("E1").unwrap();
        assert_eq!(detect(&inode, Some(&remote)), None);
    }

    #[test]
    fn test_edit_edit_on_remote_change() {
        let inode = dirty_inode("E1");
        let remote = ETag::new("E2").unwrap();
        assert_eq!(detect(&inode, Some(&remote)), Some(ConflictKind::EditEdit));
    }

    #[test]
    fn test_edit_delete_when_remote_gone() {
        let inode = dirty_inode("E1");
        assert_eq!(detect(&inode, None), Some(ConflictKind::EditDelete));
    }

    #[test]
    fn test_delete_edit() {
        let mut inode = dirty_inode("E1");
        inode.mark_deleted().unwrap();
        let remote = ETag::new("E2").unwrap();
        assert_eq!(detect(&inode, Some(&remote)), Some(ConflictKind::DeleteEdit));
    }

    #[test]
    fn test_ghost_delete_without_remote_change_is_clean() {
        // Deleting a never-hydrated placeholder: the observed remote etag
        // is the baseline.
        let mut inode = Inode::from_remote(
            NodeId::new(4),
            NodeId::ROOT,
            "ghost.txt",
            ItemKind::File,
            RemoteId::new("R4").unwrap(),
            1,
            Some(ETag::new("E1").unwrap()),
            None,
            Utc::now(),
        );
        inode.mark_deleted().unwrap();

        let unchanged = ETag::new("E1").unwrap();
        assert_eq!(detect(&inode, Some(&unchanged)), None);

        let changed = ETag::new("E2").unwrap();
        assert_eq!(detect(&inode, Some(&changed)), Some(ConflictKind::DeleteEdit));
    }

    #[test]
    fn test_clean_states_never_conflict() {
        let mut inode = dirty_inode("E1");
        inode.transition_to(ItemState::Hydrated).unwrap();
        let remote = ETag::new("E9").unwrap();
        assert_eq!(detect(&inode, Some(&remote)), None);
    }

    #[test]
    fn test_local_only_creation_with_remote_counterpart() {
        // Created locally, never uploaded, but the name now exists remotely.
        let inode = Inode::new_local(NodeId::new(3), NodeId::ROOT, "new.txt", ItemKind::File);
        let remote = ETag::new("E5").unwrap();
        assert_eq!(detect(&inode, Some(&remote)), Some(ConflictKind::EditEdit));
    }
}
