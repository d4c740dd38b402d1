//! Mount lifecycle
//!
//! One [`Mount`] per projected drive: it opens the persistent store under
//! the mount's cache directory, loads the metadata index, starts the
//! pipelines and background activities, and tears everything down within
//! the graceful-shutdown budget. Mount setup as a whole is bounded by
//! `mount.timeout`; when it expires the partially built state is dropped
//! (releasing the store lock) and the mount fails cleanly.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use driftfs_cache::ContentCache;
use driftfs_conflict::{PolicyEngine, Strategy};
use driftfs_core::config::Config;
use driftfs_core::domain::{DriftError, ItemState, TransportKind};
use driftfs_core::ports::graph::GraphClient;
use driftfs_core::ports::transport::ChangeHint;
use driftfs_graph::pacing::RequestPacer;
use driftfs_notify::{ChangeNotifier, ChangeTransport, NotifierHandle, SubscriptionManager};
use driftfs_store::{records, Store};
use driftfs_sync::delta::DeltaSyncLoop;
use driftfs_sync::download::{self, DownloadPipeline};
use driftfs_sync::index::MetadataIndex;
use driftfs_sync::offline::{ConnState, ConnectivityMonitor, OfflineQueue, RecoveryDriver};
use driftfs_sync::scheduler::RequestScheduler;
use driftfs_sync::status::TransferStatus;
use driftfs_sync::upload::{self, UploadPipeline};
use driftfs_sync::SyncDeps;

use crate::fs::RemoteOutcome;
use crate::handle::HandleTable;

/// Graceful shutdown budget for the whole mount
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);
/// Graceful stop budget for upload workers
const UPLOAD_STOP_BUDGET: Duration = Duration::from_secs(30);
/// Graceful stop budget for download workers
const DOWNLOAD_STOP_BUDGET: Duration = Duration::from_secs(5);
/// Capacity of the change-hint channel into the delta loop
const HINT_CHANNEL_CAPACITY: usize = 64;

/// Change-subscription parameters, when a push transport is configured
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    /// Resource scope, e.g. `/me/drive/root`
    pub resource: String,
    /// Public callback URL (webhook transport)
    pub notification_url: String,
    pub transport: TransportKind,
}

/// External wiring the embedder supplies at mount time
#[derive(Default)]
pub struct MountOptions {
    /// Change transports in preference order; empty means pure polling
    pub transports: Vec<Arc<dyn ChangeTransport>>,
    pub subscription: Option<SubscriptionSpec>,
}

/// Worker and background-task handles, grouped by stop budget
struct BackgroundTasks {
    download_workers: Vec<JoinHandle<()>>,
    upload_workers: Vec<JoinHandle<()>>,
    services: Vec<JoinHandle<()>>,
}

/// One mounted drive
pub struct Mount {
    pub(crate) deps: Arc<SyncDeps>,
    pub(crate) downloads: Arc<DownloadPipeline>,
    pub(crate) uploads: Arc<UploadPipeline>,
    pub(crate) monitor: Arc<ConnectivityMonitor>,
    pub(crate) conn: watch::Receiver<ConnState>,
    pub(crate) notifier: NotifierHandle,
    pub(crate) handles: HandleTable,
    pub(crate) scheduler: Arc<RequestScheduler<RemoteOutcome>>,
    delta: Arc<DeltaSyncLoop>,
    subscriptions: Option<Arc<SubscriptionManager>>,
    hints_tx: mpsc::Sender<ChangeHint>,
    shutdown: CancellationToken,
    tasks: tokio::sync::Mutex<Option<BackgroundTasks>>,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount").finish_non_exhaustive()
    }
}

impl Mount {
    /// Mounts a drive, bounded by `mount.timeout`
    pub async fn mount(
        config: Config,
        client: Arc<dyn GraphClient>,
        options: MountOptions,
    ) -> Result<Arc<Self>, DriftError> {
        config.ensure_valid()?;
        let timeout = config.mount_timeout();

        match tokio::time::timeout(timeout, Self::mount_inner(config, client, options)).await {
            Ok(result) => result,
            Err(_) => {
                // Partially built state was dropped with the future; the
                // store lock guard went with it.
                Err(DriftError::Config {
                    field: "mount.timeout".into(),
                    message: format!("mount setup exceeded {}s", timeout.as_secs()),
                })
            }
        }
    }

    async fn mount_inner(
        config: Config,
        client: Arc<dyn GraphClient>,
        options: MountOptions,
    ) -> Result<Arc<Self>, DriftError> {
        let cache_dir = config
            .mount
            .cache_dir
            .clone()
            .unwrap_or_else(Config::default_cache_dir);
        let config_dir = config
            .mount
            .config_dir
            .clone()
            .unwrap_or_else(Config::default_config_dir);
        prepare_directories(&config_dir, &cache_dir)?;

        let store = Arc::new(Store::open(&cache_dir.join("store.db")).await?);
        let index = Arc::new(MetadataIndex::load(store.clone()).await?);
        let cache = Arc::new(ContentCache::new(&cache_dir).await?);
        let offline = OfflineQueue::load(store.clone(), config.offline.max_changes).await?;

        let default_strategy = Strategy::from_str(&config.conflict.strategy)?;
        let policy = Arc::new(PolicyEngine::new(default_strategy, &config.conflict.rules));

        let deps = Arc::new(SyncDeps {
            config: config.clone(),
            store: store.clone(),
            cache,
            index,
            client: client.clone(),
            pacer: Arc::new(RequestPacer::with_defaults()),
            status: Arc::new(TransferStatus::new()),
            policy,
            offline,
        });

        let shutdown = CancellationToken::new();

        // Pipelines.
        let downloads = DownloadPipeline::new(deps.clone());
        let uploads = UploadPipeline::new(deps.clone());
        let download_workers = downloads.spawn_workers(shutdown.clone());
        let upload_workers = uploads.spawn_workers(shutdown.clone());

        // Crash recovery: resume transfer sessions, re-queue pending items.
        download::resume_pending(&downloads).await?;
        upload::resume_pending(&uploads).await?;
        uploads.drain_pending();

        let mut services = Vec::new();

        // Connectivity.
        let (monitor, conn) = ConnectivityMonitor::new(
            client.clone(),
            config.probe_interval(),
            config.probe_timeout(),
        );
        services.push(tokio::spawn({
            let monitor = monitor.clone();
            let shutdown = shutdown.clone();
            async move { monitor.run(shutdown).await }
        }));

        // Change notification.
        let (hints_tx, hints_rx) = mpsc::channel(HINT_CHANNEL_CAPACITY);
        let (notifier, notifier_handle) =
            ChangeNotifier::new(options.transports, hints_tx.clone());
        services.push(tokio::spawn({
            let shutdown = shutdown.clone();
            async move { notifier.run(shutdown).await }
        }));

        let subscriptions = match options.subscription {
            Some(spec) => {
                let manager = Arc::new(SubscriptionManager::new(
                    client.clone(),
                    store.clone(),
                    spec.resource,
                    spec.notification_url,
                    spec.transport,
                ));
                if let Err(e) = manager.ensure().await {
                    warn!(error = %e, "Could not establish change subscription");
                }
                services.push(tokio::spawn({
                    let manager = manager.clone();
                    let shutdown = shutdown.clone();
                    async move { manager.maintain(shutdown).await }
                }));
                Some(manager)
            }
            None => None,
        };

        // Delta loop.
        let delta = Arc::new(DeltaSyncLoop::new(
            deps.clone(),
            uploads.clone(),
            notifier_handle.clone(),
            hints_rx,
            conn.clone(),
        ));
        services.push(tokio::spawn({
            let delta = delta.clone();
            let shutdown = shutdown.clone();
            async move { delta.run(shutdown).await }
        }));

        // Offline recovery.
        let recovery = RecoveryDriver::new(deps.clone(), uploads.clone());
        services.push(tokio::spawn({
            let conn = conn.clone();
            let shutdown = shutdown.clone();
            async move { recovery.run(conn, shutdown).await }
        }));

        // Cache cleanup timer.
        services.push(tokio::spawn(cleanup_loop(deps.clone(), shutdown.clone())));

        // Kick the initial reconciliation (the first tree walk when no
        // cursor exists) without waiting a full polling interval.
        let _ = hints_tx
            .try_send(ChangeHint::new("/", TransportKind::Polling));

        let mount = Arc::new(Self {
            deps,
            downloads,
            uploads,
            monitor,
            conn,
            notifier: notifier_handle,
            handles: HandleTable::new(),
            scheduler: Arc::new(RequestScheduler::new(4)),
            delta,
            subscriptions,
            hints_tx,
            shutdown,
            tasks: tokio::sync::Mutex::new(Some(BackgroundTasks {
                download_workers,
                upload_workers,
                services,
            })),
        });

        info!(
            cache_dir = %cache_dir.display(),
            nodes = mount.deps.index.node_count(),
            "Mount ready"
        );
        Ok(mount)
    }

    /// The transfer status stream
    pub fn status(&self) -> &TransferStatus {
        &self.deps.status
    }

    /// Current connectivity state
    #[must_use]
    pub fn connectivity(&self) -> ConnState {
        *self.conn.borrow()
    }

    /// Whether the change notifier currently delivers hints
    #[must_use]
    pub fn notifier_healthy(&self) -> bool {
        self.notifier.healthy()
    }

    /// Requests an immediate reconciliation cycle
    pub fn request_sync(&self) {
        let _ = self
            .hints_tx
            .try_send(ChangeHint::new("/", TransportKind::Polling));
    }

    /// Runs one reconciliation cycle and waits for its summary
    ///
    /// Delta application is idempotent, so overlapping with a loop-driven
    /// cycle is harmless.
    pub async fn sync_now(
        &self,
    ) -> Result<driftfs_sync::delta::SyncSummary, DriftError> {
        self.delta.sync_cycle(&CancellationToken::new()).await
    }

    /// The connectivity monitor, for embedders feeding passive signals
    pub fn monitor(&self) -> Arc<ConnectivityMonitor> {
        self.monitor.clone()
    }

    /// Number of offline changes awaiting replay
    #[must_use]
    pub fn offline_pending(&self) -> usize {
        self.deps.offline.len()
    }

    /// Runs a cache cleanup pass on explicit request
    pub async fn cleanup_now(&self) -> Result<(), DriftError> {
        run_cleanup(&self.deps).await
    }

    /// Graceful shutdown: stop intake, drain workers within their budgets,
    /// delete the change subscription, release the store lock
    pub async fn shutdown(&self) {
        info!("Mount shutting down");
        self.shutdown.cancel();

        if let Some(tasks) = self.tasks.lock().await.take() {
            join_with_budget("download-workers", tasks.download_workers, DOWNLOAD_STOP_BUDGET)
                .await;
            join_with_budget("upload-workers", tasks.upload_workers, UPLOAD_STOP_BUDGET).await;
            join_with_budget("services", tasks.services, SHUTDOWN_BUDGET).await;
        }

        if let Some(subscriptions) = &self.subscriptions {
            subscriptions.shutdown().await;
        }

        info!("Mount stopped");
    }
}

/// Creates the mount directories with the documented permissions
fn prepare_directories(config_dir: &Path, cache_dir: &Path) -> Result<(), DriftError> {
    for (dir, mode) in [(config_dir, 0o700u32), (cache_dir, 0o755u32)] {
        std::fs::create_dir_all(dir).map_err(|e| {
            DriftError::StorageCorrupt(format!("cannot create {}: {e}", dir.display()))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(mode);
            std::fs::set_permissions(dir, perms).map_err(|e| {
                DriftError::StorageCorrupt(format!(
                    "cannot set permissions on {}: {e}",
                    dir.display()
                ))
            })?;
        }
    }
    Ok(())
}

async fn join_with_budget(group: &str, handles: Vec<JoinHandle<()>>, budget: Duration) {
    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(budget, drain).await.is_err() {
        warn!(group, budget_secs = budget.as_secs(), "Stop budget exceeded, abandoning tasks");
    }
}

/// Periodic cache cleanup: orphans, retention eviction, inode demotion
async fn cleanup_loop(deps: Arc<SyncDeps>, shutdown: CancellationToken) {
    let mut timer = tokio::time::interval(deps.config.cache_cleanup_interval());
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    timer.tick().await; // the immediate first tick; cleanup can wait

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = timer.tick() => {
                if let Err(e) = run_cleanup(&deps).await {
                    warn!(error = %e, "Cache cleanup failed");
                }
            }
        }
    }
}

/// One cleanup pass, also usable on explicit request
pub(crate) async fn run_cleanup(deps: &Arc<SyncDeps>) -> Result<(), DriftError> {
    let policies = deps.index.cache_policies();
    let report = deps
        .cache
        .cleanup(deps.config.cache_retention(), &policies)
        .await?;

    // Evicted entries demote their inodes back to placeholders.
    for node in report.evicted {
        if let Some(mut inode) = deps.index.get(node) {
            if matches!(inode.state(), ItemState::Hydrated) {
                inode.evict()?;
                deps.index
                    .commit(vec![inode], vec![records::content_hash_delete(node)])
                    .await?;
            }
        }
    }
    Ok(())
}
