//! Transfer session records
//!
//! Upload and download sessions are persisted beside the inode they belong
//! to so a restart resumes long transfers from the last acknowledged offset
//! instead of starting over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{ETag, NodeId, QuickXorHash};

/// How an upload is performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStrategy {
    /// Single PUT of the whole body
    Small,
    /// Resumable chunked session against a session URL
    Chunked,
}

/// Persisted state of an in-flight upload
///
/// Written atomically with the inode's transition to `DirtyLocal`; deleted
/// in the same batch that commits the upload result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub node: NodeId,
    pub strategy: UploadStrategy,
    /// Chunk size in bytes; unused for the small strategy
    pub chunk_bytes: u64,
    /// Next byte offset to send; all earlier bytes are acknowledged
    pub next_offset: u64,
    /// Total content size at session creation
    pub total_bytes: u64,
    /// Session URL returned by the remote store (chunked only)
    pub session_url: Option<String>,
    /// When the session URL stops being usable
    pub expires_at: Option<DateTime<Utc>>,
    /// ETag baseline for the conflict precheck
    pub base_etag: Option<ETag>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    /// Starts a small-strategy session
    pub fn small(node: NodeId, total_bytes: u64, base_etag: Option<ETag>) -> Self {
        Self {
            node,
            strategy: UploadStrategy::Small,
            chunk_bytes: 0,
            next_offset: 0,
            total_bytes,
            session_url: None,
            expires_at: None,
            base_etag,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Starts a chunked-strategy session
    pub fn chunked(
        node: NodeId,
        total_bytes: u64,
        chunk_bytes: u64,
        session_url: String,
        expires_at: Option<DateTime<Utc>>,
        base_etag: Option<ETag>,
    ) -> Self {
        Self {
            node,
            strategy: UploadStrategy::Chunked,
            chunk_bytes,
            next_offset: 0,
            total_bytes,
            session_url: Some(session_url),
            expires_at,
            base_etag,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Records an acknowledged chunk
    pub fn advance_to(&mut self, offset: u64) {
        self.next_offset = offset;
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.retry_count += 1;
        self.last_error = Some(error.into());
    }

    /// A session can resume only while its URL is still valid
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        match self.strategy {
            UploadStrategy::Small => false,
            UploadStrategy::Chunked => match self.expires_at {
                Some(expiry) => Utc::now() < expiry,
                None => self.session_url.is_some(),
            },
        }
    }

    #[must_use]
    pub fn remaining_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.next_offset)
    }
}

/// Persisted state of an in-flight chunked download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSession {
    pub node: NodeId,
    /// Size announced by item metadata
    pub expected_size: u64,
    /// Next byte offset to fetch; all earlier bytes are in the cache entry
    pub next_offset: u64,
    /// Hash announced by item metadata, verified at finalize
    pub expected_hash: Option<QuickXorHash>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl DownloadSession {
    pub fn new(node: NodeId, expected_size: u64, expected_hash: Option<QuickXorHash>) -> Self {
        Self {
            node,
            expected_size,
            next_offset: 0,
            expected_hash,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn advance_to(&mut self, offset: u64) {
        self.next_offset = offset;
    }

    pub fn record_failure(&mut self) {
        self.retry_count += 1;
    }

    #[must_use]
    pub fn remaining_bytes(&self) -> u64 {
        self.expected_size.saturating_sub(self.next_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_small_session_is_not_resumable() {
        let session = UploadSession::small(NodeId::new(2), 100, None);
        assert!(!session.is_resumable());
        assert_eq!(session.remaining_bytes(), 100);
    }

    #[test]
    fn test_chunked_session_resume_window() {
        let mut session = UploadSession::chunked(
            NodeId::new(2),
            300 * 1024 * 1024,
            10 * 1024 * 1024,
            "https://upload.example/session/1".into(),
            Some(Utc::now() + Duration::hours(1)),
            Some(ETag::new("E1").unwrap()),
        );
        assert!(session.is_resumable());

        session.advance_to(30 * 1024 * 1024);
        assert_eq!(session.next_offset, 30 * 1024 * 1024);
        assert_eq!(session.remaining_bytes(), 270 * 1024 * 1024);
    }

    #[test]
    fn test_expired_session_is_not_resumable() {
        let session = UploadSession::chunked(
            NodeId::new(2),
            100,
            10,
            "https://upload.example/session/2".into(),
            Some(Utc::now() - Duration::minutes(5)),
            None,
        );
        assert!(!session.is_resumable());
    }

    #[test]
    fn test_failure_tracking() {
        let mut session = UploadSession::small(NodeId::new(3), 10, None);
        session.record_failure("503 from server");
        session.record_failure("connection reset");
        assert_eq!(session.retry_count, 2);
        assert_eq!(session.last_error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_download_session_progress() {
        let mut session = DownloadSession::new(NodeId::new(4), 50 * 1024 * 1024, None);
        assert_eq!(session.remaining_bytes(), 50 * 1024 * 1024);

        session.advance_to(20 * 1024 * 1024);
        assert_eq!(session.remaining_bytes(), 30 * 1024 * 1024);

        session.record_failure();
        assert_eq!(session.retry_count, 1);
    }
}
