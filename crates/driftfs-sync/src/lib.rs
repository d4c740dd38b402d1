//! DriftFS synchronization engine
//!
//! The subsystems that keep the local projection and the remote store
//! converging:
//! - [`index`] - the in-memory metadata index over the persistent store
//! - [`scheduler`] - prioritized, deduplicated remote request scheduling
//! - [`download`] - the hydration pipeline (Ghost → Hydrated)
//! - [`upload`] - the drain pipeline (DirtyLocal / DeletedLocal → remote)
//! - [`delta`] - the periodic delta reconciliation loop
//! - [`offline`] - connectivity detection, the offline change queue, and
//!   the reconnection recovery driver
//! - [`resolve`] - conflict plan execution
//! - [`status`] - the transfer status channel and progress map
//! - [`retry`] - shared backoff for retryable errors
//!
//! Everything hangs off [`SyncDeps`], one instance per mount.

pub mod delta;
pub mod download;
pub mod index;
pub mod offline;
pub mod queue;
pub mod resolve;
pub mod retry;
pub mod scheduler;
pub mod status;
pub mod upload;

use std::sync::Arc;

use driftfs_cache::ContentCache;
use driftfs_conflict::PolicyEngine;
use driftfs_core::config::Config;
use driftfs_core::ports::graph::GraphClient;
use driftfs_graph::pacing::RequestPacer;
use driftfs_store::Store;

use index::MetadataIndex;
use offline::OfflineQueue;
use status::TransferStatus;

/// Shared wiring of one mount's sync engine
///
/// Each mount owns an isolated instance; nothing here is process-global.
pub struct SyncDeps {
    pub config: Config,
    pub store: Arc<Store>,
    pub cache: Arc<ContentCache>,
    pub index: Arc<MetadataIndex>,
    pub client: Arc<dyn GraphClient>,
    pub pacer: Arc<RequestPacer>,
    pub status: Arc<TransferStatus>,
    pub policy: Arc<PolicyEngine>,
    pub offline: Arc<OfflineQueue>,
}
