//! SQLite-backed bucket store
//!
//! Durable, crash-safe storage for all long-lived engine state. The store
//! exposes named buckets over a single SQLite table; write batches execute
//! in one transaction so readers observe either the whole batch or none of
//! it. The database runs in WAL mode with full synchronous commits.
//!
//! ## Locking
//!
//! One process owns a store at a time, enforced with a lock file beside the
//! database. A lock older than the staleness window is presumed abandoned by
//! a crashed process and reclaimed; a fresh lock is retried with exponential
//! backoff before the open fails with `StorageLocked`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use tracing::{debug, info, warn};

use driftfs_core::domain::errors::DriftError;

/// Named buckets of the persistent store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Inodes,
    ContentHashes,
    DeltaCursor,
    UploadSessions,
    DownloadSessions,
    OfflineChanges,
    Subscriptions,
    Config,
}

impl Bucket {
    /// All buckets, for enumeration in tests and diagnostics
    pub const ALL: [Bucket; 8] = [
        Bucket::Inodes,
        Bucket::ContentHashes,
        Bucket::DeltaCursor,
        Bucket::UploadSessions,
        Bucket::DownloadSessions,
        Bucket::OfflineChanges,
        Bucket::Subscriptions,
        Bucket::Config,
    ];

    /// Stable storage name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Bucket::Inodes => "inodes",
            Bucket::ContentHashes => "content_hashes",
            Bucket::DeltaCursor => "delta_cursor",
            Bucket::UploadSessions => "upload_sessions",
            Bucket::DownloadSessions => "download_sessions",
            Bucket::OfflineChanges => "offline_changes",
            Bucket::Subscriptions => "subscriptions",
            Bucket::Config => "config",
        }
    }
}

/// One operation of an atomic write batch
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put {
        bucket: Bucket,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        bucket: Bucket,
        key: String,
    },
}

impl BatchOp {
    /// Put with a JSON-encoded value
    pub fn put_json<T: serde::Serialize>(
        bucket: Bucket,
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, DriftError> {
        let encoded = serde_json::to_vec(value)
            .map_err(|e| DriftError::Validation(format!("cannot encode record: {e}")))?;
        Ok(BatchOp::Put {
            bucket,
            key: key.into(),
            value: encoded,
        })
    }

    pub fn delete(bucket: Bucket, key: impl Into<String>) -> Self {
        BatchOp::Delete {
            bucket,
            key: key.into(),
        }
    }
}

/// Lock acquisition tuning; production uses [`LockOptions::default`]
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// A lock older than this is presumed abandoned and reclaimed
    pub stale_after: Duration,
    /// Retry attempts before giving up with `StorageLocked`
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt up to `max_delay`
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5 * 60),
            max_attempts: 10,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Removes the lock file when the store is dropped
#[derive(Debug)]
struct LockGuard {
    path: Option<PathBuf>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove store lock");
            }
        }
    }
}

/// The persistent bucket store
pub struct Store {
    pool: SqlitePool,
    _lock: LockGuard,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (or creates) the store at `db_path` with default lock options
    pub async fn open(db_path: &Path) -> Result<Self, DriftError> {
        Self::open_with_options(db_path, LockOptions::default()).await
    }

    /// Opens the store with explicit lock tuning
    pub async fn open_with_options(
        db_path: &Path,
        lock_options: LockOptions,
    ) -> Result<Self, DriftError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DriftError::StorageCorrupt(format!(
                    "cannot create store directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let lock = Self::acquire_lock(db_path, &lock_options).await?;

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                DriftError::StorageCorrupt(format!("cannot open {}: {e}", db_path.display()))
            })?;

        Self::run_migrations(&pool).await?;

        info!(path = %db_path.display(), "Persistent store opened");
        Ok(Self { pool, _lock: lock })
    }

    /// In-memory store for tests; single connection so data persists across
    /// queries
    pub async fn in_memory() -> Result<Self, DriftError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| DriftError::StorageCorrupt(format!("cannot open in-memory store: {e}")))?;

        Self::run_migrations(&pool).await?;
        debug!("In-memory store opened");
        Ok(Self {
            pool,
            _lock: LockGuard { path: None },
        })
    }

    async fn acquire_lock(db_path: &Path, options: &LockOptions) -> Result<LockGuard, DriftError> {
        let lock_path = db_path.with_extension("db.lock");
        let mut delay = options.base_delay;

        for attempt in 0..options.max_attempts {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    use std::io::Write;
                    let _ = write!(file, "{}", std::process::id());
                    debug!(path = %lock_path.display(), "Store lock acquired");
                    return Ok(LockGuard {
                        path: Some(lock_path),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let age = std::fs::metadata(&lock_path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|mtime| mtime.elapsed().ok());

                    if age.map_or(false, |age| age >= options.stale_after) {
                        warn!(
                            path = %lock_path.display(),
                            age_secs = age.map(|a| a.as_secs()).unwrap_or_default(),
                            "Reclaiming stale store lock"
                        );
                        let _ = std::fs::remove_file(&lock_path);
                        continue;
                    }

                    debug!(
                        path = %lock_path.display(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Store locked, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, options.max_delay);
                }
                Err(e) => {
                    return Err(DriftError::StorageCorrupt(format!(
                        "cannot create lock file {}: {e}",
                        lock_path.display()
                    )));
                }
            }
        }

        Err(DriftError::StorageLocked(format!(
            "{} is held by another process",
            lock_path.display()
        )))
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), DriftError> {
        let migration_sql = include_str!("migrations/0001_kv.sql");
        sqlx::raw_sql(migration_sql)
            .execute(pool)
            .await
            .map_err(|e| DriftError::StorageCorrupt(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Reads one value
    pub async fn get(&self, bucket: Bucket, key: &str) -> Result<Option<Vec<u8>>, DriftError> {
        let row = sqlx::query("SELECT value FROM kv WHERE bucket = ? AND key = ?")
            .bind(bucket.name())
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    /// Reads all entries of a bucket whose key starts with `prefix`, in key
    /// order. An empty prefix scans the whole bucket.
    pub async fn range(
        &self,
        bucket: Bucket,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, DriftError> {
        let pattern = format!("{}%", escape_like(prefix));
        let rows = sqlx::query(
            "SELECT key, value FROM kv WHERE bucket = ? AND key LIKE ? ESCAPE '\\' ORDER BY key",
        )
        .bind(bucket.name())
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<Vec<u8>, _>("value")))
            .collect())
    }

    /// Writes one value (a batch of one)
    pub async fn put(&self, bucket: Bucket, key: &str, value: Vec<u8>) -> Result<(), DriftError> {
        self.batch(vec![BatchOp::Put {
            bucket,
            key: key.to_string(),
            value,
        }])
        .await
    }

    /// Deletes one key (a batch of one); deleting a missing key is a no-op
    pub async fn delete(&self, bucket: Bucket, key: &str) -> Result<(), DriftError> {
        self.batch(vec![BatchOp::delete(bucket, key)]).await
    }

    /// Applies a set of puts and deletes atomically across buckets
    ///
    /// The batch commits with a synchronous transaction; after this returns,
    /// the batch survives a crash, and a reader never observes part of it.
    pub async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), DriftError> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        for op in &ops {
            match op {
                BatchOp::Put { bucket, key, value } => {
                    sqlx::query(
                        "INSERT INTO kv (bucket, key, value) VALUES (?, ?, ?)
                         ON CONFLICT (bucket, key) DO UPDATE SET value = excluded.value",
                    )
                    .bind(bucket.name())
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_error)?;
                }
                BatchOp::Delete { bucket, key } => {
                    sqlx::query("DELETE FROM kv WHERE bucket = ? AND key = ?")
                        .bind(bucket.name())
                        .bind(key)
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_error)?;
                }
            }
        }

        tx.commit().await.map_err(storage_error)?;
        debug!(ops = ops.len(), "Batch committed");
        Ok(())
    }

    /// Number of entries in a bucket
    pub async fn count(&self, bucket: Bucket) -> Result<u64, DriftError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM kv WHERE bucket = ?")
            .bind(bucket.name())
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}

fn storage_error(e: sqlx::Error) -> DriftError {
    DriftError::StorageCorrupt(format!("store query failed: {e}"))
}

/// Escapes `%`, `_`, and the escape character for a LIKE prefix pattern
fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
