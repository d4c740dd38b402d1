//! Remote store transport port (driven/secondary port)
//!
//! [`GraphClient`] is the abstract boundary between the engine and the
//! remote store's REST surface. It deliberately stays at the request level:
//! typed drive operations (delta pages, upload sessions, item metadata) are
//! built on top of it in `driftfs-graph`, so the engine never hard-codes a
//! concrete HTTP stack.
//!
//! ## Semantics expected of implementations
//!
//! - Responses are returned for any HTTP status; status-to-error mapping is
//!   the caller's job via [`GraphResponse::into_result`].
//! - Transport-level failures (DNS, refused connections, timeouts) surface
//!   as `DriftError::Network` so passive offline detection can classify
//!   them.
//! - `get_stream` fetches a byte window of an absolute (usually
//!   pre-authenticated) URL. Pre-authenticated URLs may ignore conditional
//!   headers, so cache revalidation relies on delta-driven ETag comparison
//!   instead of per-request conditional GETs.

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::domain::errors::DriftError;

/// A response from the remote store
#[derive(Debug, Clone)]
pub struct GraphResponse {
    pub status: u16,
    /// Lower-cased header names
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl GraphResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header value by case-insensitive name
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == lower)
            .map(|(_, v)| v.as_str())
    }

    /// Parses the `Retry-After` header as a second count
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Deserializes the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, DriftError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| DriftError::Validation(format!("malformed response body: {e}")))
    }

    /// Maps a non-success status to the error taxonomy
    ///
    /// 401/403 → `Auth`, 404/410 → `NotFound`, 409/412 → `Conflict`,
    /// 429 → `RateLimited` (with the `Retry-After` hint), 5xx → `Server`.
    pub fn into_result(self) -> Result<GraphResponse, DriftError> {
        match self.status {
            s if (200..300).contains(&s) => Ok(self),
            401 | 403 => Err(DriftError::Auth(format!("status {}", self.status))),
            404 | 410 => Err(DriftError::NotFound(format!("status {}", self.status))),
            409 | 412 => Err(DriftError::Conflict(format!("status {}", self.status))),
            429 => Err(DriftError::RateLimited {
                retry_after: self.retry_after(),
            }),
            s if s >= 500 => Err(DriftError::Server {
                status: s,
                message: String::from_utf8_lossy(&self.body).into_owned(),
            }),
            s => Err(DriftError::Validation(format!(
                "unexpected status {s}: {}",
                String::from_utf8_lossy(&self.body)
            ))),
        }
    }
}

/// Header list passed with each request
pub type RequestHeaders<'a> = &'a [(&'a str, &'a str)];

/// Port trait for the remote store's REST transport
///
/// `path` values are relative to the implementation's base URL unless they
/// are absolute (`http…`), which implementations must pass through verbatim;
/// upload-session and pre-authenticated download URLs are absolute.
#[async_trait::async_trait]
pub trait GraphClient: Send + Sync {
    async fn get(&self, path: &str, headers: RequestHeaders<'_>)
        -> Result<GraphResponse, DriftError>;

    async fn put(
        &self,
        path: &str,
        headers: RequestHeaders<'_>,
        body: Vec<u8>,
    ) -> Result<GraphResponse, DriftError>;

    async fn post(
        &self,
        path: &str,
        headers: RequestHeaders<'_>,
        body: Vec<u8>,
    ) -> Result<GraphResponse, DriftError>;

    async fn patch(
        &self,
        path: &str,
        headers: RequestHeaders<'_>,
        body: Vec<u8>,
    ) -> Result<GraphResponse, DriftError>;

    async fn delete(
        &self,
        path: &str,
        headers: RequestHeaders<'_>,
    ) -> Result<GraphResponse, DriftError>;

    /// Fetches `[offset, offset + length)` of an absolute content URL;
    /// `length == None` reads to the end
    async fn get_stream(
        &self,
        url: &str,
        headers: RequestHeaders<'_>,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Vec<u8>, DriftError>;
}

/// Port trait for bearer-token access
///
/// Acquisition, persistence, and refresh of credentials belong to the
/// external auth component; the engine only reads tokens and asks for one
/// refresh when the remote store rejects a request with an auth error.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns the current bearer token
    async fn bearer_token(&self) -> Result<String, DriftError>;

    /// Forces a refresh and returns the new token
    ///
    /// Called at most once per failed request; a second auth failure
    /// propagates.
    async fn refresh(&self) -> Result<String, DriftError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, headers: Vec<(String, String)>, body: &[u8]) -> GraphResponse {
        GraphResponse {
            status,
            headers,
            body: body.to_vec(),
        }
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let resp = response(
            200,
            vec![("etag".into(), "\"E1\"".into())],
            b"{}",
        );
        assert_eq!(resp.header("ETag"), Some("\"E1\""));
        assert_eq!(resp.header("missing"), None);
    }

    #[test]
    fn test_retry_after_parsing() {
        let resp = response(429, vec![("retry-after".into(), "17".into())], b"");
        assert_eq!(resp.retry_after(), Some(Duration::from_secs(17)));

        let resp = response(429, vec![("retry-after".into(), "soon".into())], b"");
        assert_eq!(resp.retry_after(), None);
    }

    #[test]
    fn test_status_mapping() {
        assert!(response(204, vec![], b"").into_result().is_ok());

        assert!(matches!(
            response(401, vec![], b"").into_result(),
            Err(DriftError::Auth(_))
        ));
        assert!(matches!(
            response(404, vec![], b"").into_result(),
            Err(DriftError::NotFound(_))
        ));
        assert!(matches!(
            response(412, vec![], b"").into_result(),
            Err(DriftError::Conflict(_))
        ));
        assert!(matches!(
            response(503, vec![], b"oops").into_result(),
            Err(DriftError::Server { status: 503, .. })
        ));
    }

    #[test]
    fn test_rate_limit_carries_hint() {
        let resp = response(429, vec![("retry-after".into(), "42".into())], b"");
        match resp.into_result() {
            Err(DriftError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(42)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn test_json_parse_failure_is_validation() {
        let resp = response(200, vec![], b"not json");
        let err = resp.json::<serde_json::Value>().unwrap_err();
        assert!(matches!(err, DriftError::Validation(_)));
    }
}
