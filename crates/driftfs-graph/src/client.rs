//! HTTP transport for the Microsoft Graph API
//!
//! [`HttpGraphClient`] implements the `GraphClient` port with `reqwest`.
//! Requests carry the bearer token from the configured [`TokenProvider`];
//! an auth rejection triggers exactly one token refresh before the error
//! surfaces. Transport-level failures map to `DriftError::Network` so the
//! offline state machine can classify them.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use tracing::{debug, warn};

use driftfs_core::domain::DriftError;
use driftfs_core::ports::graph::{GraphClient, GraphResponse, RequestHeaders, TokenProvider};

/// Base URL for Microsoft Graph API v1.0
const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Timeout for metadata-sized requests
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for content transfers; one chunk per request
const CONTENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// `reqwest`-backed implementation of the `GraphClient` port
pub struct HttpGraphClient {
    http: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpGraphClient {
    /// Creates a client against the production Graph endpoint
    pub fn new(tokens: Arc<dyn TokenProvider>) -> Self {
        Self::with_base_url(tokens, GRAPH_BASE_URL)
    }

    /// Creates a client against a custom base URL (used by tests)
    pub fn with_base_url(tokens: Arc<dyn TokenProvider>, base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            tokens,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolves a request path; absolute URLs (upload sessions,
    /// pre-authenticated download URLs) pass through verbatim
    fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        headers: RequestHeaders<'_>,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<GraphResponse, DriftError> {
        let url = self.resolve(path);

        // One refresh attempt on auth rejection, then surface.
        for attempt in 0..2 {
            let token = if attempt == 0 {
                self.tokens.bearer_token().await?
            } else {
                warn!(path, "Auth rejected, refreshing token once");
                self.tokens.refresh().await?
            };

            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&token)
                .timeout(timeout);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }
            if let Some(ref bytes) = body {
                request = request.body(bytes.clone());
            }

            let response = request.send().await.map_err(network_error)?;

            if response.status() == StatusCode::UNAUTHORIZED && attempt == 0 {
                continue;
            }

            let status = response.status().as_u16();
            let response_headers = response
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_ascii_lowercase(),
                        v.to_str().unwrap_or_default().to_string(),
                    )
                })
                .collect();
            let bytes = response.bytes().await.map_err(network_error)?;

            debug!(method = %method, path, status, "Graph request completed");
            return Ok(GraphResponse {
                status,
                headers: response_headers,
                body: bytes.to_vec(),
            });
        }

        Err(DriftError::Auth(format!("token rejected for {path}")))
    }
}

#[async_trait::async_trait]
impl GraphClient for HttpGraphClient {
    async fn get(
        &self,
        path: &str,
        headers: RequestHeaders<'_>,
    ) -> Result<GraphResponse, DriftError> {
        self.send(Method::GET, path, headers, None, METADATA_TIMEOUT)
            .await
    }

    async fn put(
        &self,
        path: &str,
        headers: RequestHeaders<'_>,
        body: Vec<u8>,
    ) -> Result<GraphResponse, DriftError> {
        self.send(Method::PUT, path, headers, Some(body), CONTENT_TIMEOUT)
            .await
    }

    async fn post(
        &self,
        path: &str,
        headers: RequestHeaders<'_>,
        body: Vec<u8>,
    ) -> Result<GraphResponse, DriftError> {
        self.send(Method::POST, path, headers, Some(body), METADATA_TIMEOUT)
            .await
    }

    async fn patch(
        &self,
        path: &str,
        headers: RequestHeaders<'_>,
        body: Vec<u8>,
    ) -> Result<GraphResponse, DriftError> {
        self.send(Method::PATCH, path, headers, Some(body), METADATA_TIMEOUT)
            .await
    }

    async fn delete(
        &self,
        path: &str,
        headers: RequestHeaders<'_>,
    ) -> Result<GraphResponse, DriftError> {
        self.send(Method::DELETE, path, headers, None, METADATA_TIMEOUT)
            .await
    }

    async fn get_stream(
        &self,
        url: &str,
        headers: RequestHeaders<'_>,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Vec<u8>, DriftError> {
        let range = match length {
            Some(len) if len > 0 => format!("bytes={}-{}", offset, offset + len - 1),
            _ => format!("bytes={offset}-"),
        };

        let mut request = self
            .http
            .get(self.resolve(url))
            .header("Range", &range)
            .timeout(CONTENT_TIMEOUT);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request.send().await.map_err(network_error)?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(network_error)?;

        let checked = GraphResponse {
            status,
            headers: Vec::new(),
            body: bytes.to_vec(),
        }
        .into_result()?;

        debug!(url, range, received = checked.body.len(), "Ranged content fetch");
        Ok(checked.body)
    }
}

/// Maps a transport-level failure to the error taxonomy
///
/// Everything `reqwest` reports without an HTTP status is a connectivity
/// problem; the message keeps the source chain so the offline state machine
/// can pattern-match it.
fn network_error(e: reqwest::Error) -> DriftError {
    let mut message = e.to_string();
    let mut source = std::error::Error::source(&e);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    DriftError::Network(message)
}
