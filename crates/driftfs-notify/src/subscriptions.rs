//! Subscription bookkeeping
//!
//! Both push transports ride on a remote subscription record. The manager
//! keeps exactly one alive per mount: it renews proactively within 24 hours
//! of expiry, recreates on renewal failure, persists every state change,
//! and deletes the subscription at graceful shutdown.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driftfs_core::domain::{DriftError, Subscription, TransportKind};
use driftfs_core::ports::graph::GraphClient;
use driftfs_store::{records, Store};

/// Lifetime requested for new subscriptions
const SUBSCRIPTION_LIFETIME_HOURS: i64 = 72;

/// How often the maintenance loop re-checks the renewal window
const MAINTENANCE_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionResponse {
    id: String,
    expiration_date_time: DateTime<Utc>,
}

/// Keeps the mount's change subscription alive
pub struct SubscriptionManager {
    client: Arc<dyn GraphClient>,
    store: Arc<Store>,
    /// Resource scope, e.g. `/me/drive/root`
    resource: String,
    /// Public callback URL for webhook subscriptions
    notification_url: String,
    transport: TransportKind,
    current: Mutex<Option<Subscription>>,
}

impl SubscriptionManager {
    pub fn new(
        client: Arc<dyn GraphClient>,
        store: Arc<Store>,
        resource: impl Into<String>,
        notification_url: impl Into<String>,
        transport: TransportKind,
    ) -> Self {
        Self {
            client,
            store,
            resource: resource.into(),
            notification_url: notification_url.into(),
            transport,
            current: Mutex::new(None),
        }
    }

    /// Restores a persisted subscription or creates a fresh one
    pub async fn ensure(&self) -> Result<Subscription, DriftError> {
        let mut current = self.current.lock().await;

        if current.is_none() {
            // Adopt a persisted subscription from a previous run.
            *current = self
                .store
                .load_subscriptions()
                .await?
                .into_iter()
                .find(|s| s.resource == self.resource);
        }

        match current.as_ref() {
            Some(existing) if !existing.is_expired() && !existing.needs_renewal() => {
                return Ok(existing.clone());
            }
            Some(existing) if !existing.is_expired() => {
                match self.renew(existing).await {
                    Ok(renewed) => {
                        *current = Some(renewed.clone());
                        return Ok(renewed);
                    }
                    Err(e) => {
                        warn!(
                            subscription = %existing.id,
                            error = %e,
                            "Subscription renewal failed, recreating"
                        );
                        let _ = self.delete_remote(&existing.id).await;
                    }
                }
            }
            _ => {}
        }

        let created = self.create().await?;
        *current = Some(created.clone());
        Ok(created)
    }

    async fn create(&self) -> Result<Subscription, DriftError> {
        let expiration = Utc::now() + ChronoDuration::hours(SUBSCRIPTION_LIFETIME_HOURS);
        let body = serde_json::json!({
            "changeType": "updated",
            "notificationUrl": self.notification_url,
            "resource": self.resource,
            "expirationDateTime": expiration.to_rfc3339(),
        });

        let response: SubscriptionResponse = self
            .client
            .post(
                "/subscriptions",
                &[("Content-Type", "application/json")],
                serde_json::to_vec(&body).map_err(|e| {
                    DriftError::Validation(format!("cannot encode subscription body: {e}"))
                })?,
            )
            .await?
            .into_result()?
            .json()?;

        let subscription = Subscription::new(
            response.id,
            self.resource.clone(),
            response.expiration_date_time,
            self.transport,
        );
        self.store
            .batch(vec![records::subscription_put(&subscription)?])
            .await?;

        info!(
            subscription = %subscription.id,
            expires_at = %subscription.expires_at,
            "Subscription created"
        );
        Ok(subscription)
    }

    async fn renew(&self, existing: &Subscription) -> Result<Subscription, DriftError> {
        let expiration = Utc::now() + ChronoDuration::hours(SUBSCRIPTION_LIFETIME_HOURS);
        let body = serde_json::json!({ "expirationDateTime": expiration.to_rfc3339() });

        let response: SubscriptionResponse = self
            .client
            .patch(
                &format!("/subscriptions/{}", existing.id),
                &[("Content-Type", "application/json")],
                serde_json::to_vec(&body).map_err(|e| {
                    DriftError::Validation(format!("cannot encode renewal body: {e}"))
                })?,
            )
            .await?
            .into_result()?
            .json()?;

        let mut renewed = existing.clone();
        renewed.expires_at = response.expiration_date_time;
        self.store
            .batch(vec![records::subscription_put(&renewed)?])
            .await?;

        debug!(subscription = %renewed.id, expires_at = %renewed.expires_at, "Subscription renewed");
        Ok(renewed)
    }

    async fn delete_remote(&self, id: &str) -> Result<(), DriftError> {
        self.client
            .delete(&format!("/subscriptions/{id}"), &[])
            .await?
            .into_result()?;
        self.store
            .batch(vec![records::subscription_delete(id)])
            .await?;
        Ok(())
    }

    /// Periodic renewal loop; runs until cancelled
    pub async fn maintain(&self, shutdown: CancellationToken) {
        let mut timer =
            tokio::time::interval(std::time::Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {
                    if let Err(e) = self.ensure().await {
                        warn!(error = %e, "Subscription maintenance failed");
                    }
                }
            }
        }
    }

    /// Deletes the active subscription at graceful shutdown
    pub async fn shutdown(&self) {
        let current = self.current.lock().await;
        if let Some(subscription) = current.as_ref() {
            match self.delete_remote(&subscription.id).await {
                Ok(()) => info!(subscription = %subscription.id, "Subscription deleted"),
                Err(e) => warn!(
                    subscription = %subscription.id,
                    error = %e,
                    "Failed to delete subscription at shutdown"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftfs_core::ports::graph::{GraphResponse, RequestHeaders};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// GraphClient stub scripting subscription responses
    struct ScriptedGraph {
        posts: AtomicU32,
        patches: AtomicU32,
        deletes: AtomicU32,
        fail_patch: bool,
    }

    impl ScriptedGraph {
        fn new(fail_patch: bool) -> Self {
            Self {
                posts: AtomicU32::new(0),
                patches: AtomicU32::new(0),
                deletes: AtomicU32::new(0),
                fail_patch,
            }
        }

        fn subscription_json(id: &str) -> Vec<u8> {
            serde_json::to_vec(&serde_json::json!({
                "id": id,
                "expirationDateTime": (Utc::now() + ChronoDuration::hours(72)).to_rfc3339(),
            }))
            .unwrap()
        }
    }

    #[async_trait::async_trait]
    impl GraphClient for ScriptedGraph {
        async fn get(
            &self,
            _path: &str,
            _headers: RequestHeaders<'_>,
        ) -> Result<GraphResponse, DriftError> {
            Ok(GraphResponse {
                status: 404,
                headers: vec![],
                body: vec![],
            })
        }

        async fn put(
            &self,
            _path: &str,
            _headers: RequestHeaders<'_>,
            _body: Vec<u8>,
        ) -> Result<GraphResponse, DriftError> {
            unreachable!("subscriptions never PUT")
        }

        async fn post(
            &self,
            _path: &str,
            _headers: RequestHeaders<'_>,
            _body: Vec<u8>,
        ) -> Result<GraphResponse, DriftError> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            Ok(GraphResponse {
                status: 201,
                headers: vec![],
                body: Self::subscription_json("sub-new"),
            })
        }

        async fn patch(
            &self,
            _path: &str,
            _headers: RequestHeaders<'_>,
            _body: Vec<u8>,
        ) -> Result<GraphResponse, DriftError> {
            self.patches.fetch_add(1, Ordering::SeqCst);
            if self.fail_patch {
                Ok(GraphResponse {
                    status: 404,
                    headers: vec![],
                    body: vec![],
                })
            } else {
                Ok(GraphResponse {
                    status: 200,
                    headers: vec![],
                    body: Self::subscription_json("sub-renewed"),
                })
            }
        }

        async fn delete(
            &self,
            _path: &str,
            _headers: RequestHeaders<'_>,
        ) -> Result<GraphResponse, DriftError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(GraphResponse {
                status: 204,
                headers: vec![],
                body: vec![],
            })
        }

        async fn get_stream(
            &self,
            _url: &str,
            _headers: RequestHeaders<'_>,
            _offset: u64,
            _length: Option<u64>,
        ) -> Result<Vec<u8>, DriftError> {
            unreachable!("subscriptions never stream")
        }
    }

    async fn manager(fail_patch: bool) -> (SubscriptionManager, Arc<ScriptedGraph>) {
        let graph = Arc::new(ScriptedGraph::new(fail_patch));
        let store = Arc::new(Store::in_memory().await.unwrap());
        let manager = SubscriptionManager::new(
            graph.clone(),
            store,
            "/me/drive/root",
            "https://callbacks.example/driftfs",
            TransportKind::Webhook,
        );
        (manager, graph)
    }

    #[tokio::test]
    async fn test_ensure_creates_and_persists() {
        let (manager, graph) = manager(false).await;

        let subscription = manager.ensure().await.unwrap();
        assert_eq!(subscription.id, "sub-new");
        assert_eq!(graph.posts.load(Ordering::SeqCst), 1);

        let persisted = manager.store.load_subscriptions().await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, "sub-new");

        // A fresh subscription is reused, not recreated.
        manager.ensure().await.unwrap();
        assert_eq!(graph.posts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_renewal_inside_window() {
        let (manager, graph) = manager(false).await;

        // Seed a subscription that is inside the renewal window.
        let closing = Subscription::new(
            "sub-old",
            "/me/drive/root",
            Utc::now() + ChronoDuration::hours(12),
            TransportKind::Webhook,
        );
        manager
            .store
            .batch(vec![records::subscription_put(&closing).unwrap()])
            .await
            .unwrap();

        let subscription = manager.ensure().await.unwrap();
        assert_eq!(graph.patches.load(Ordering::SeqCst), 1);
        assert_eq!(graph.posts.load(Ordering::SeqCst), 0);
        assert_eq!(subscription.id, "sub-old");
        assert!(!subscription.needs_renewal());
    }

    #[tokio::test]
    async fn test_failed_renewal_recreates() {
        let (manager, graph) = manager(true).await;

        let closing = Subscription::new(
            "sub-old",
            "/me/drive/root",
            Utc::now() + ChronoDuration::hours(12),
            TransportKind::Webhook,
        );
        manager
            .store
            .batch(vec![records::subscription_put(&closing).unwrap()])
            .await
            .unwrap();

        let subscription = manager.ensure().await.unwrap();
        assert_eq!(subscription.id, "sub-new");
        assert_eq!(graph.patches.load(Ordering::SeqCst), 1);
        assert_eq!(graph.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(graph.posts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_deletes_subscription() {
        let (manager, graph) = manager(false).await;
        manager.ensure().await.unwrap();

        manager.shutdown().await;
        assert_eq!(graph.deletes.load(Ordering::SeqCst), 1);
        assert!(manager.store.load_subscriptions().await.unwrap().is_empty());
    }
}
