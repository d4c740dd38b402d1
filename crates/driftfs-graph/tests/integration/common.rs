//! Shared fixtures for Graph adapter integration tests

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use driftfs_core::domain::DriftError;
use driftfs_core::ports::graph::TokenProvider;
use driftfs_graph::HttpGraphClient;

/// Token provider returning a fixed token, counting refreshes
pub struct TestTokens {
    refreshes: AtomicU32,
}

impl TestTokens {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            refreshes: AtomicU32::new(0),
        })
    }

    pub fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TokenProvider for TestTokens {
    async fn bearer_token(&self) -> Result<String, DriftError> {
        Ok("test-token".into())
    }

    async fn refresh(&self) -> Result<String, DriftError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok("refreshed-token".into())
    }
}

/// Starts a mock server and a client pointed at it
pub async fn setup() -> (MockServer, HttpGraphClient, Arc<TestTokens>) {
    let server = MockServer::start().await;
    let tokens = TestTokens::new();
    let client = HttpGraphClient::with_base_url(tokens.clone(), server.uri());
    (server, client, tokens)
}

/// Mounts a single-page delta response ending with a delta link
pub async fn mount_delta_single_page(
    server: &MockServer,
    items: serde_json::Value,
    next_token: &str,
) {
    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": items,
            "@odata.deltaLink": format!(
                "{}/me/drive/root/delta?token={}",
                server.uri(),
                next_token
            )
        })))
        .mount(server)
        .await;
}
