//! DriftFS content cache
//!
//! File bodies keyed by node id, one file per item under
//! `<cache_dir>/content/<node-id>`. Writes land at arbitrary offsets so
//! chunked downloads and local edits share one entry; `finalize` verifies
//! the quick-xor hash before an entry may back a `Hydrated` inode.

pub mod content;

pub use content::{CacheEntryPolicy, CacheStat, CleanupReport, ContentCache};
