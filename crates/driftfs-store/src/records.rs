//! Typed record access over the bucket store
//!
//! JSON codecs and key conventions for each bucket, so callers compose
//! atomic batches out of typed domain values instead of raw bytes.
//!
//! ## Key conventions
//!
//! | Bucket | Key |
//! |---|---|
//! | `inodes`, `content_hashes`, `upload_sessions`, `download_sessions` | zero-padded node id |
//! | `offline_changes` | zero-padded change id (replay order = key order) |
//! | `delta_cursor` | drive id |
//! | `subscriptions` | subscription id |
//! | `config` | counter / setting name |

use serde::de::DeserializeOwned;

use driftfs_core::domain::{
    DeltaCursor, DownloadSession, DriftError, Inode, NodeId, OfflineChange, QuickXorHash,
    Subscription, UploadSession,
};

use crate::store::{BatchOp, Bucket, Store};

/// Key of the persisted node-id allocator in the `config` bucket
pub const NEXT_NODE_ID_KEY: &str = "next_node_id";
/// Key of the persisted offline-change-id allocator in the `config` bucket
pub const NEXT_CHANGE_ID_KEY: &str = "next_change_id";

fn decode<T: DeserializeOwned>(bucket: Bucket, key: &str, bytes: &[u8]) -> Result<T, DriftError> {
    serde_json::from_slice(bytes).map_err(|e| {
        DriftError::StorageCorrupt(format!(
            "undecodable record {}/{key}: {e}",
            bucket.name()
        ))
    })
}

impl Store {
    // --- Inodes ---

    pub async fn get_inode(&self, id: NodeId) -> Result<Option<Inode>, DriftError> {
        match self.get(Bucket::Inodes, &id.as_key()).await? {
            Some(bytes) => Ok(Some(decode(Bucket::Inodes, &id.as_key(), &bytes)?)),
            None => Ok(None),
        }
    }

    /// Loads the whole tree; used once at mount to build the in-memory index
    pub async fn load_inodes(&self) -> Result<Vec<Inode>, DriftError> {
        let rows = self.range(Bucket::Inodes, "").await?;
        rows.iter()
            .map(|(key, bytes)| decode(Bucket::Inodes, key, bytes))
            .collect()
    }

    // --- Content hashes ---

    pub async fn get_content_hash(&self, id: NodeId) -> Result<Option<QuickXorHash>, DriftError> {
        match self.get(Bucket::ContentHashes, &id.as_key()).await? {
            Some(bytes) => Ok(Some(decode(Bucket::ContentHashes, &id.as_key(), &bytes)?)),
            None => Ok(None),
        }
    }

    // --- Delta cursor ---

    pub async fn get_delta_cursor(&self, drive: &str) -> Result<Option<DeltaCursor>, DriftError> {
        match self.get(Bucket::DeltaCursor, drive).await? {
            Some(bytes) => Ok(Some(decode(Bucket::DeltaCursor, drive, &bytes)?)),
            None => Ok(None),
        }
    }

    // --- Transfer sessions ---

    pub async fn get_upload_session(
        &self,
        id: NodeId,
    ) -> Result<Option<UploadSession>, DriftError> {
        match self.get(Bucket::UploadSessions, &id.as_key()).await? {
            Some(bytes) => Ok(Some(decode(Bucket::UploadSessions, &id.as_key(), &bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn load_upload_sessions(&self) -> Result<Vec<UploadSession>, DriftError> {
        let rows = self.range(Bucket::UploadSessions, "").await?;
        rows.iter()
            .map(|(key, bytes)| decode(Bucket::UploadSessions, key, bytes))
            .collect()
    }

    pub async fn get_download_session(
        &self,
        id: NodeId,
    ) -> Result<Option<DownloadSession>, DriftError> {
        match self.get(Bucket::DownloadSessions, &id.as_key()).await? {
            Some(bytes) => Ok(Some(decode(
                Bucket::DownloadSessions,
                &id.as_key(),
                &bytes,
            )?)),
            None => Ok(None),
        }
    }

    pub async fn load_download_sessions(&self) -> Result<Vec<DownloadSession>, DriftError> {
        let rows = self.range(Bucket::DownloadSessions, "").await?;
        rows.iter()
            .map(|(key, bytes)| decode(Bucket::DownloadSessions, key, bytes))
            .collect()
    }

    // --- Offline changes ---

    /// Loads all queued offline changes, oldest first
    pub async fn load_offline_changes(&self) -> Result<Vec<OfflineChange>, DriftError> {
        let rows = self.range(Bucket::OfflineChanges, "").await?;
        rows.iter()
            .map(|(key, bytes)| decode(Bucket::OfflineChanges, key, bytes))
            .collect()
    }

    // --- Subscriptions ---

    pub async fn load_subscriptions(&self) -> Result<Vec<Subscription>, DriftError> {
        let rows = self.range(Bucket::Subscriptions, "").await?;
        rows.iter()
            .map(|(key, bytes)| decode(Bucket::Subscriptions, key, bytes))
            .collect()
    }

    // --- Counters ---

    /// Reads a `config`-bucket counter, defaulting when absent
    pub async fn get_counter(&self, key: &str, default: u64) -> Result<u64, DriftError> {
        match self.get(Bucket::Config, key).await? {
            Some(bytes) => decode(Bucket::Config, key, &bytes),
            None => Ok(default),
        }
    }
}

// ============================================================================
// Batch op builders
// ============================================================================

/// Batch op writing an inode record
pub fn inode_put(inode: &Inode) -> Result<BatchOp, DriftError> {
    BatchOp::put_json(Bucket::Inodes, inode.id().as_key(), inode)
}

/// Batch op removing an inode record
pub fn inode_delete(id: NodeId) -> BatchOp {
    BatchOp::delete(Bucket::Inodes, id.as_key())
}

pub fn content_hash_put(id: NodeId, hash: &QuickXorHash) -> Result<BatchOp, DriftError> {
    BatchOp::put_json(Bucket::ContentHashes, id.as_key(), hash)
}

pub fn content_hash_delete(id: NodeId) -> BatchOp {
    BatchOp::delete(Bucket::ContentHashes, id.as_key())
}

pub fn delta_cursor_put(drive: &str, cursor: &DeltaCursor) -> Result<BatchOp, DriftError> {
    BatchOp::put_json(Bucket::DeltaCursor, drive, cursor)
}

pub fn delta_cursor_delete(drive: &str) -> BatchOp {
    BatchOp::delete(Bucket::DeltaCursor, drive)
}

pub fn upload_session_put(session: &UploadSession) -> Result<BatchOp, DriftError> {
    BatchOp::put_json(Bucket::UploadSessions, session.node.as_key(), session)
}

pub fn upload_session_delete(id: NodeId) -> BatchOp {
    BatchOp::delete(Bucket::UploadSessions, id.as_key())
}

pub fn download_session_put(session: &DownloadSession) -> Result<BatchOp, DriftError> {
    BatchOp::put_json(Bucket::DownloadSessions, session.node.as_key(), session)
}

pub fn download_session_delete(id: NodeId) -> BatchOp {
    BatchOp::delete(Bucket::DownloadSessions, id.as_key())
}

fn change_key(change_id: u64) -> String {
    format!("{change_id:020}")
}

pub fn offline_change_put(change: &OfflineChange) -> Result<BatchOp, DriftError> {
    BatchOp::put_json(Bucket::OfflineChanges, change_key(change.change_id), change)
}

pub fn offline_change_delete(change_id: u64) -> BatchOp {
    BatchOp::delete(Bucket::OfflineChanges, change_key(change_id))
}

pub fn subscription_put(subscription: &Subscription) -> Result<BatchOp, DriftError> {
    BatchOp::put_json(Bucket::Subscriptions, &subscription.id, subscription)
}

pub fn subscription_delete(id: &str) -> BatchOp {
    BatchOp::delete(Bucket::Subscriptions, id)
}

pub fn counter_put(key: &str, value: u64) -> Result<BatchOp, DriftError> {
    BatchOp::put_json(Bucket::Config, key, &value)
}
