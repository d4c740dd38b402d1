//! File-backed content store
//!
//! Layout: `<root>/content/<node-id>`, one body per item. The thumbnail
//! area uses the same layout under `<root>/thumbnails/` and is cleaned with
//! the same policy.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use driftfs_core::domain::{DriftError, NodeId, QuickXorHash, QuickXorHasher};

/// Hash-verification read chunk
const VERIFY_CHUNK: usize = 256 * 1024;

/// Metadata of one cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStat {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Per-entry input to [`ContentCache::cleanup`]
///
/// The metadata index owns liveness and access times; the cache only holds
/// bytes, so the caller supplies the policy view.
#[derive(Debug, Clone, Copy)]
pub struct CacheEntryPolicy {
    /// Pinned entries are exempt from retention eviction
    pub pinned: bool,
    /// Entries with unsynced local edits are never evicted
    pub dirty: bool,
    pub last_access: DateTime<Utc>,
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Entries removed because no live inode references them
    pub orphans_removed: Vec<NodeId>,
    /// Entries evicted because they idled past the retention window
    pub evicted: Vec<NodeId>,
    pub bytes_freed: u64,
}

/// File-backed content store keyed by node id
pub struct ContentCache {
    content_dir: PathBuf,
}

impl ContentCache {
    /// Creates the cache under `cache_dir`, creating directories as needed
    pub async fn new(cache_dir: &Path) -> Result<Self, DriftError> {
        let content_dir = cache_dir.join("content");
        fs::create_dir_all(&content_dir)
            .await
            .map_err(|e| io_error("create cache directory", &content_dir, e))?;
        Ok(Self { content_dir })
    }

    /// Path of an entry's backing file
    #[must_use]
    pub fn entry_path(&self, id: NodeId) -> PathBuf {
        self.content_dir.join(id.as_u64().to_string())
    }

    /// Opens an entry for appending writes, creating it lazily
    pub async fn open(&self, id: NodeId) -> Result<File, DriftError> {
        let path = self.entry_path(id);
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| io_error("open cache entry", &path, e))
    }

    /// Writes `data` at `offset`, creating the entry if needed
    pub async fn write(&self, id: NodeId, offset: u64, data: &[u8]) -> Result<u64, DriftError> {
        let mut file = self.open(id).await?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_error("seek cache entry", &self.entry_path(id), e))?;
        file.write_all(data)
            .await
            .map_err(|e| io_error("write cache entry", &self.entry_path(id), e))?;
        file.flush()
            .await
            .map_err(|e| io_error("flush cache entry", &self.entry_path(id), e))?;
        Ok(data.len() as u64)
    }

    /// Reads up to `len` bytes at `offset`; short reads happen at EOF
    pub async fn read(&self, id: NodeId, offset: u64, len: usize) -> Result<Vec<u8>, DriftError> {
        let path = self.entry_path(id);
        let mut file = File::open(&path)
            .await
            .map_err(|e| io_error("open cache entry", &path, e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_error("seek cache entry", &path, e))?;

        let mut buffer = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file
                .read(&mut buffer[filled..])
                .await
                .map_err(|e| io_error("read cache entry", &path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    /// Truncates an entry to `size` bytes
    pub async fn truncate(&self, id: NodeId, size: u64) -> Result<(), DriftError> {
        let file = self.open(id).await?;
        file.set_len(size)
            .await
            .map_err(|e| io_error("truncate cache entry", &self.entry_path(id), e))
    }

    /// Verifies the entry against `expected` and returns its size
    ///
    /// On mismatch the entry is discarded and `Validation` is returned; a
    /// `Hydrated` inode must never reference unverified bytes.
    pub async fn finalize(
        &self,
        id: NodeId,
        expected: &QuickXorHash,
    ) -> Result<u64, DriftError> {
        let (actual, size) = self.compute_hash(id).await?;

        if &actual != expected {
            warn!(
                node = %id,
                expected = %expected,
                actual = %actual,
                "Checksum mismatch, discarding cache entry"
            );
            self.delete(id).await?;
            return Err(DriftError::Validation(format!(
                "checksum mismatch for node {id}: expected {expected}, got {actual}"
            )));
        }

        debug!(node = %id, size, "Cache entry finalized");
        Ok(size)
    }

    /// Streams the entry through the quick-xor hasher
    pub async fn compute_hash(&self, id: NodeId) -> Result<(QuickXorHash, u64), DriftError> {
        let path = self.entry_path(id);
        let mut file = File::open(&path)
            .await
            .map_err(|e| io_error("open cache entry", &path, e))?;

        let mut hasher = QuickXorHasher::new();
        let mut buffer = vec![0u8; VERIFY_CHUNK];
        let mut total = 0u64;
        loop {
            let n = file
                .read(&mut buffer)
                .await
                .map_err(|e| io_error("read cache entry", &path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            total += n as u64;
        }
        Ok((hasher.finalize(), total))
    }

    /// Removes an entry; removing a missing entry is a no-op
    pub async fn delete(&self, id: NodeId) -> Result<(), DriftError> {
        let path = self.entry_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove cache entry", &path, e)),
        }
    }

    /// Returns entry metadata, or `None` when no entry exists
    pub async fn stat(&self, id: NodeId) -> Result<Option<CacheStat>, DriftError> {
        let path = self.entry_path(id);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(CacheStat {
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("stat cache entry", &path, e)),
        }
    }

    /// Removes orphaned entries and evicts entries idle past `retention`
    ///
    /// `live` maps every node the metadata index still knows to its policy
    /// view; entries without a mapping are orphans. Idempotent on a
    /// quiescent cache.
    pub async fn cleanup(
        &self,
        retention: Duration,
        live: &HashMap<NodeId, CacheEntryPolicy>,
    ) -> Result<CleanupReport, DriftError> {
        let mut report = CleanupReport::default();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::days(30));

        let mut entries = fs::read_dir(&self.content_dir)
            .await
            .map_err(|e| io_error("list cache", &self.content_dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list cache", &self.content_dir, e))?
        {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|s| s.parse::<u64>().ok()) else {
                // Foreign files are left alone.
                continue;
            };
            let id = NodeId::new(id);
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);

            match live.get(&id) {
                None => {
                    self.delete(id).await?;
                    report.orphans_removed.push(id);
                    report.bytes_freed += size;
                }
                Some(policy) => {
                    if !policy.pinned && !policy.dirty && policy.last_access < cutoff {
                        self.delete(id).await?;
                        report.evicted.push(id);
                        report.bytes_freed += size;
                    }
                }
            }
        }

        if !report.orphans_removed.is_empty() || !report.evicted.is_empty() {
            info!(
                orphans = report.orphans_removed.len(),
                evicted = report.evicted.len(),
                bytes_freed = report.bytes_freed,
                "Cache cleanup completed"
            );
        }
        Ok(report)
    }

    /// Total bytes held by the cache
    pub async fn disk_usage(&self) -> Result<u64, DriftError> {
        let mut total = 0u64;
        let mut entries = fs::read_dir(&self.content_dir)
            .await
            .map_err(|e| io_error("list cache", &self.content_dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list cache", &self.content_dir, e))?
        {
            if let Ok(meta) = entry.metadata().await {
                if meta.is_file() {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> DriftError {
    DriftError::StorageCorrupt(format!("{action} {}: {e}", path.display()))
}
