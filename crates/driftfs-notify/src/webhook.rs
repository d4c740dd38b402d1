//! Webhook transport
//!
//! Secondary transport: the remote store POSTs change notifications to a
//! local HTTP listener registered through a subscription. The listener
//! answers the store's validation handshake (echoing `validationToken` as
//! `text/plain`) and turns notification bodies into change hints.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driftfs_core::domain::{DriftError, TransportKind};
use driftfs_core::ports::transport::ChangeHint;

use crate::notifier::ChangeTransport;

/// Notification batch body sent by the remote store
#[derive(Debug, Deserialize)]
struct NotificationBatch {
    #[serde(default)]
    value: Vec<NotificationEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationEntry {
    subscription_id: Option<String>,
    resource: Option<String>,
}

/// HTTP callback listener for subscription notifications
pub struct WebhookTransport {
    bind_addr: SocketAddr,
    /// Resource reported when an entry does not name one
    resource: String,
}

impl WebhookTransport {
    pub fn new(bind_addr: SocketAddr, resource: impl Into<String>) -> Self {
        Self {
            bind_addr,
            resource: resource.into(),
        }
    }
}

#[async_trait::async_trait]
impl ChangeTransport for WebhookTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Webhook
    }

    async fn run_once(
        &self,
        hints: mpsc::Sender<ChangeHint>,
        connected: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> Result<(), DriftError> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| DriftError::Network(format!("webhook bind {}: {e}", self.bind_addr)))?;

        info!(addr = %self.bind_addr, "Webhook listener started");
        connected.store(true, Ordering::Release);

        let default_resource = Arc::new(self.resource.clone());

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => break Err(DriftError::Network(format!("webhook accept: {e}"))),
                    };
                    debug!(%peer, "Webhook connection accepted");

                    let hints = hints.clone();
                    let default_resource = default_resource.clone();
                    let io = TokioIo::new(stream);

                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let hints = hints.clone();
                            let default_resource = default_resource.clone();
                            async move { handle_request(req, hints, &default_resource).await }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!(error = %e, "Webhook connection ended with error");
                        }
                    });
                }
            }
        };

        connected.store(false, Ordering::Release);
        result
    }
}

async fn handle_request(
    req: Request<Incoming>,
    hints: mpsc::Sender<ChangeHint>,
    default_resource: &str,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    // Validation handshake: echo the token back as plain text.
    if let Some(token) = validation_token(req.uri().query()) {
        debug!("Answering subscription validation handshake");
        let mut response = Response::new(Full::new(Bytes::from(token)));
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain"),
        );
        return Ok(response);
    }

    let body = req.into_body().collect().await?.to_bytes();
    match serde_json::from_slice::<NotificationBatch>(&body) {
        Ok(batch) => {
            for entry in batch.value {
                let mut hint = ChangeHint::new(
                    entry
                        .resource
                        .unwrap_or_else(|| default_resource.to_string()),
                    TransportKind::Webhook,
                );
                if let Some(id) = entry.subscription_id {
                    hint = hint.with_subscription(id);
                }
                if hints.send(hint).await.is_err() {
                    break;
                }
            }
        }
        Err(e) => warn!(error = %e, "Undecodable webhook notification body"),
    }

    // The store expects a fast 202 regardless of processing.
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::ACCEPTED;
    Ok(response)
}

/// Extracts `validationToken` from a query string
fn validation_token(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "validationToken")
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_token_extraction() {
        assert_eq!(
            validation_token(Some("validationToken=abc%20def")),
            Some("abc def".to_string())
        );
        assert_eq!(validation_token(Some("other=1")), None);
        assert_eq!(validation_token(None), None);
    }

    #[test]
    fn test_notification_batch_deserialization() {
        let json = r#"{
            "value": [
                { "subscriptionId": "s1", "resource": "/me/drive/root" },
                { "subscriptionId": "s2" }
            ]
        }"#;
        let batch: NotificationBatch = serde_json::from_str(json).unwrap();
        assert_eq!(batch.value.len(), 2);
        assert_eq!(batch.value[0].subscription_id.as_deref(), Some("s1"));
        assert!(batch.value[1].resource.is_none());
    }

    #[test]
    fn test_empty_batch_defaults() {
        let batch: NotificationBatch = serde_json::from_str("{}").unwrap();
        assert!(batch.value.is_empty());
    }

    #[tokio::test]
    async fn test_webhook_round_trip() {
        use std::time::Duration;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Reserve an ephemeral port for the listener.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let transport = Arc::new(WebhookTransport::new(addr, "/me/drive/root"));
        let (tx, mut rx) = mpsc::channel(8);
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let runner = {
            let transport = transport.clone();
            let connected = connected.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { transport.run_once(tx, connected, shutdown).await })
        };

        // Wait for the listener to come up.
        for _ in 0..50 {
            if connected.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(connected.load(Ordering::SeqCst));

        // Validation handshake echoes the token.
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"POST /notify?validationToken=tok-1 HTTP/1.1\r\nHost: t\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("tok-1"));

        // A notification batch becomes a hint.
        let body = r#"{"value":[{"subscriptionId":"s1","resource":"/me/drive/root"}]}"#;
        let request = format!(
            "POST /notify HTTP/1.1\r\nHost: t\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 202"));

        let hint = rx.recv().await.unwrap();
        assert_eq!(hint.subscription_id.as_deref(), Some("s1"));
        assert_eq!(hint.resource, "/me/drive/root");
        assert_eq!(hint.transport, TransportKind::Webhook);

        shutdown.cancel();
        let _ = runner.await;
    }
}
