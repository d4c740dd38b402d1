//! Integration tests for the content cache

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use driftfs_cache::{CacheEntryPolicy, ContentCache};
use driftfs_core::domain::{quickxor, DriftError, NodeId};

async fn cache() -> (TempDir, ContentCache) {
    let dir = TempDir::new().unwrap();
    let cache = ContentCache::new(dir.path()).await.unwrap();
    (dir, cache)
}

fn policy(pinned: bool, dirty: bool, age: Duration) -> CacheEntryPolicy {
    CacheEntryPolicy {
        pinned,
        dirty,
        last_access: Utc::now() - chrono::Duration::from_std(age).unwrap(),
    }
}

#[tokio::test]
async fn test_write_read_roundtrip() {
    let (_dir, cache) = cache().await;
    let id = NodeId::new(2);

    cache.write(id, 0, b"hello world").await.unwrap();

    assert_eq!(cache.read(id, 0, 5).await.unwrap(), b"hello");
    assert_eq!(cache.read(id, 6, 100).await.unwrap(), b"world");
    // Reads past EOF are empty, not errors.
    assert_eq!(cache.read(id, 50, 10).await.unwrap(), b"");
}

#[tokio::test]
async fn test_chunked_writes_assemble_in_order() {
    let (_dir, cache) = cache().await;
    let id = NodeId::new(3);

    // Chunks land at their own offsets, as the download pipeline writes them.
    cache.write(id, 6, b"world").await.unwrap();
    cache.write(id, 0, b"hello ").await.unwrap();

    assert_eq!(cache.read(id, 0, 11).await.unwrap(), b"hello world");
}

#[tokio::test]
async fn test_finalize_accepts_matching_hash() {
    let (_dir, cache) = cache().await;
    let id = NodeId::new(4);
    let body = b"content to verify";

    cache.write(id, 0, body).await.unwrap();
    let size = cache.finalize(id, &quickxor::hash_bytes(body)).await.unwrap();

    assert_eq!(size, body.len() as u64);
    assert!(cache.stat(id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_finalize_discards_on_mismatch() {
    let (_dir, cache) = cache().await;
    let id = NodeId::new(5);

    cache.write(id, 0, b"actual bytes").await.unwrap();
    let wrong = quickxor::hash_bytes(b"different bytes");

    let err = cache.finalize(id, &wrong).await.unwrap_err();
    assert!(matches!(err, DriftError::Validation(_)));
    // The corrupt entry is gone.
    assert!(cache.stat(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_stat_and_delete() {
    let (_dir, cache) = cache().await;
    let id = NodeId::new(6);

    assert!(cache.stat(id).await.unwrap().is_none());

    cache.write(id, 0, b"12345").await.unwrap();
    let stat = cache.stat(id).await.unwrap().unwrap();
    assert_eq!(stat.size, 5);

    cache.delete(id).await.unwrap();
    assert!(cache.stat(id).await.unwrap().is_none());

    // Deleting again is a no-op.
    cache.delete(id).await.unwrap();
}

#[tokio::test]
async fn test_truncate() {
    let (_dir, cache) = cache().await;
    let id = NodeId::new(7);

    cache.write(id, 0, b"0123456789").await.unwrap();
    cache.truncate(id, 4).await.unwrap();

    assert_eq!(cache.read(id, 0, 100).await.unwrap(), b"0123");
}

#[tokio::test]
async fn test_cleanup_removes_orphans() {
    let (_dir, cache) = cache().await;

    cache.write(NodeId::new(10), 0, b"live").await.unwrap();
    cache.write(NodeId::new(11), 0, b"orphan").await.unwrap();

    let mut live = HashMap::new();
    live.insert(NodeId::new(10), policy(false, false, Duration::ZERO));

    let report = cache.cleanup(Duration::from_secs(86400), &live).await.unwrap();

    assert_eq!(report.orphans_removed, vec![NodeId::new(11)]);
    assert!(report.evicted.is_empty());
    assert!(cache.stat(NodeId::new(10)).await.unwrap().is_some());
    assert!(cache.stat(NodeId::new(11)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cleanup_evicts_idle_entries_only() {
    let (_dir, cache) = cache().await;
    let retention = Duration::from_secs(30 * 86400);

    cache.write(NodeId::new(20), 0, b"idle").await.unwrap();
    cache.write(NodeId::new(21), 0, b"fresh").await.unwrap();
    cache.write(NodeId::new(22), 0, b"pinned").await.unwrap();
    cache.write(NodeId::new(23), 0, b"dirty").await.unwrap();

    let idle = Duration::from_secs(60 * 86400);
    let mut live = HashMap::new();
    live.insert(NodeId::new(20), policy(false, false, idle));
    live.insert(NodeId::new(21), policy(false, false, Duration::ZERO));
    live.insert(NodeId::new(22), policy(true, false, idle));
    live.insert(NodeId::new(23), policy(false, true, idle));

    let report = cache.cleanup(retention, &live).await.unwrap();

    assert_eq!(report.evicted, vec![NodeId::new(20)]);
    assert!(cache.stat(NodeId::new(21)).await.unwrap().is_some());
    // Pinned and dirty entries survive regardless of idle time.
    assert!(cache.stat(NodeId::new(22)).await.unwrap().is_some());
    assert!(cache.stat(NodeId::new(23)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let (_dir, cache) = cache().await;

    cache.write(NodeId::new(30), 0, b"orphan").await.unwrap();
    let live = HashMap::new();

    let first = cache.cleanup(Duration::from_secs(1), &live).await.unwrap();
    assert_eq!(first.orphans_removed.len(), 1);

    let second = cache.cleanup(Duration::from_secs(1), &live).await.unwrap();
    assert!(second.orphans_removed.is_empty());
    assert!(second.evicted.is_empty());
    assert_eq!(second.bytes_freed, 0);
}

#[tokio::test]
async fn test_disk_usage() {
    let (_dir, cache) = cache().await;
    cache.write(NodeId::new(40), 0, &[0u8; 100]).await.unwrap();
    cache.write(NodeId::new(41), 0, &[0u8; 28]).await.unwrap();
    assert_eq!(cache.disk_usage().await.unwrap(), 128);
}
