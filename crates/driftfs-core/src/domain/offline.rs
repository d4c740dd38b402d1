//! Offline change queue records
//!
//! While the remote store is unreachable the filesystem stays read-write;
//! every mutation appends a change record here. Repeated modifies of the
//! same item coalesce into the existing record so the queue length tracks
//! distinct items, not write calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{ETag, NodeId};

/// Kind of queued local mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineOpKind {
    Create,
    Modify,
    Delete,
    Move {
        new_parent: NodeId,
        new_name: String,
    },
}

/// A persisted local mutation awaiting replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineChange {
    /// Monotonic queue position; replay is oldest-first
    pub change_id: u64,
    pub node: NodeId,
    pub op: OfflineOpKind,
    pub queued_at: DateTime<Utc>,
    /// Remote ETag observed before the mutation; compared on replay to
    /// detect divergence
    pub base_etag: Option<ETag>,
    pub retry_count: u32,
}

impl OfflineChange {
    pub fn new(change_id: u64, node: NodeId, op: OfflineOpKind, base_etag: Option<ETag>) -> Self {
        Self {
            change_id,
            node,
            op,
            queued_at: Utc::now(),
            base_etag,
            retry_count: 0,
        }
    }

    /// Whether a newer operation on the same node folds into this record
    ///
    /// Modify-after-modify and modify-after-create update in place; a delete
    /// supersedes anything pending. Moves never coalesce with content ops.
    #[must_use]
    pub fn can_coalesce(&self, newer: &OfflineOpKind) -> bool {
        matches!(
            (&self.op, newer),
            (OfflineOpKind::Modify, OfflineOpKind::Modify)
                | (OfflineOpKind::Create, OfflineOpKind::Modify)
                | (_, OfflineOpKind::Delete)
        )
    }

    /// Folds a newer operation into this record
    ///
    /// The change id and base ETag are preserved: the record keeps its queue
    /// position and the divergence baseline from before the first edit.
    pub fn coalesce(&mut self, newer: OfflineOpKind) {
        match (&self.op, &newer) {
            // Create followed by delete cancels out; the caller is expected
            // to drop the record instead, but folding to Delete is safe.
            (OfflineOpKind::Create, OfflineOpKind::Modify) => {}
            _ => self.op = newer,
        }
        self.queued_at = Utc::now();
    }

    pub fn record_failure(&mut self) {
        self.retry_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modify_coalesces_into_modify() {
        let mut change = OfflineChange::new(
            7,
            NodeId::new(2),
            OfflineOpKind::Modify,
            Some(ETag::new("E1").unwrap()),
        );
        assert!(change.can_coalesce(&OfflineOpKind::Modify));

        change.coalesce(OfflineOpKind::Modify);
        assert_eq!(change.change_id, 7);
        assert_eq!(change.op, OfflineOpKind::Modify);
        // Baseline from before the first edit survives coalescing.
        assert_eq!(change.base_etag.as_ref().unwrap().as_str(), "E1");
    }

    #[test]
    fn test_create_absorbs_modify() {
        let mut change = OfflineChange::new(1, NodeId::new(3), OfflineOpKind::Create, None);
        assert!(change.can_coalesce(&OfflineOpKind::Modify));

        change.coalesce(OfflineOpKind::Modify);
        // Replay still needs to create the item, so the op stays Create.
        assert_eq!(change.op, OfflineOpKind::Create);
    }

    #[test]
    fn test_delete_supersedes() {
        let mut change = OfflineChange::new(2, NodeId::new(4), OfflineOpKind::Modify, None);
        assert!(change.can_coalesce(&OfflineOpKind::Delete));

        change.coalesce(OfflineOpKind::Delete);
        assert_eq!(change.op, OfflineOpKind::Delete);
    }

    #[test]
    fn test_move_does_not_coalesce_with_modify() {
        let mv = OfflineOpKind::Move {
            new_parent: NodeId::new(9),
            new_name: "renamed.txt".into(),
        };
        let change = OfflineChange::new(3, NodeId::new(5), mv, None);
        assert!(!change.can_coalesce(&OfflineOpKind::Modify));
    }
}
