//! Engine.IO v4 socket transport
//!
//! Preferred transport: a long-lived WebSocket to the remote store's
//! notification endpoint speaking Engine.IO v4 framing with the Socket.IO
//! default namespace.
//!
//! ## Protocol walkthrough
//!
//! 1. Connect to `<endpoint>?EIO=4&transport=websocket&access_token=<tok>`
//! 2. Server sends the open packet `0{"sid":...,"pingInterval":...,"pingTimeout":...}`
//! 3. Client joins the default namespace with `40`, server acks with `40{...}`
//! 4. Client sends ping `2` on the negotiated interval, server answers pong
//!    `3`; two consecutive missed pongs mark the transport unhealthy
//! 5. Change events arrive as `42["notification", {...}]`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driftfs_core::domain::{DriftError, TransportKind};
use driftfs_core::ports::graph::TokenProvider;
use driftfs_core::ports::transport::ChangeHint;

use crate::notifier::ChangeTransport;

/// Missed pongs tolerated before the connection is declared dead
const MAX_MISSED_PONGS: u32 = 2;

/// Engine.IO open packet payload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenPacket {
    #[allow(dead_code)]
    sid: String,
    /// Milliseconds between client pings
    ping_interval: u64,
    /// Milliseconds the server allows a ping to be outstanding
    #[allow(dead_code)]
    ping_timeout: u64,
}

/// Payload of a `notification` event
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationPayload {
    resource: Option<String>,
    subscription_id: Option<String>,
}

/// Engine.IO v4 WebSocket transport
pub struct SocketTransport {
    /// Notification endpoint, `wss://...`
    endpoint: String,
    /// Resource scope reported in emitted hints
    resource: String,
    tokens: Arc<dyn TokenProvider>,
}

impl SocketTransport {
    pub fn new(
        endpoint: impl Into<String>,
        resource: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            resource: resource.into(),
            tokens,
        }
    }

    /// Builds the connection URL with the Engine.IO query and bearer token
    fn connection_url(&self, token: &str) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{}{separator}EIO=4&transport=websocket&access_token={token}",
            self.endpoint
        )
    }
}

#[async_trait::async_trait]
impl ChangeTransport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn run_once(
        &self,
        hints: mpsc::Sender<ChangeHint>,
        connected: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> Result<(), DriftError> {
        // A fresh token every attempt covers token rotation.
        let token = self.tokens.bearer_token().await?;
        let url = self.connection_url(&token);

        let (mut ws, _response) = connect_async(&url)
            .await
            .map_err(|e| DriftError::Network(format!("socket connect failed: {e}")))?;

        // Open packet carries the ping schedule.
        let open = loop {
            match next_text(&mut ws).await? {
                frame if frame.starts_with('0') => break parse_open_packet(&frame)?,
                other => debug!(frame = %other, "Ignoring pre-open frame"),
            }
        };

        // Join the default namespace.
        ws.send(Message::Text("40".into()))
            .await
            .map_err(|e| DriftError::Network(format!("namespace connect failed: {e}")))?;

        let ping_interval = Duration::from_millis(open.ping_interval.max(1000));
        let mut ping_timer = tokio::time::interval(ping_interval);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.tick().await; // first tick fires immediately

        let mut outstanding_pings = 0u32;

        info!(
            endpoint = %self.endpoint,
            ping_interval_ms = open.ping_interval,
            "Socket transport connected"
        );
        connected.store(true, Ordering::Release);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = ws.send(Message::Close(None)).await;
                    break Ok(());
                }

                _ = ping_timer.tick() => {
                    if outstanding_pings >= MAX_MISSED_PONGS {
                        break Err(DriftError::Network(format!(
                            "{outstanding_pings} consecutive pongs missed"
                        )));
                    }
                    outstanding_pings += 1;
                    if let Err(e) = ws.send(Message::Text("2".into())).await {
                        break Err(DriftError::Network(format!("ping send failed: {e}")));
                    }
                }

                frame = ws.next() => {
                    let frame = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            break Err(DriftError::Network("socket closed by server".into()));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            break Err(DriftError::Network(format!("socket read failed: {e}")));
                        }
                    };

                    match classify_frame(&frame) {
                        Frame::Pong => outstanding_pings = 0,
                        Frame::NamespaceAck => debug!("Namespace joined"),
                        Frame::Notification(payload) => {
                            let mut hint = ChangeHint::new(
                                payload.resource.unwrap_or_else(|| self.resource.clone()),
                                TransportKind::Socket,
                            );
                            if let Some(id) = payload.subscription_id {
                                hint = hint.with_subscription(id);
                            }
                            if hints.send(hint).await.is_err() {
                                break Ok(()); // engine shut down
                            }
                        }
                        Frame::NamespaceDisconnect => {
                            break Err(DriftError::Network("namespace disconnected".into()));
                        }
                        Frame::Other => {}
                    }
                }
            }
        };

        connected.store(false, Ordering::Release);
        result
    }
}

async fn next_text(
    ws: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> Result<String, DriftError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(_))) | None => {
                return Err(DriftError::Network("socket closed during handshake".into()));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(DriftError::Network(format!("handshake read failed: {e}")));
            }
        }
    }
}

/// Decoded inbound frame
#[derive(Debug)]
enum Frame {
    Pong,
    NamespaceAck,
    NamespaceDisconnect,
    Notification(NotificationPayload),
    Other,
}

fn parse_open_packet(frame: &str) -> Result<OpenPacket, DriftError> {
    let json = frame
        .strip_prefix('0')
        .ok_or_else(|| DriftError::Validation("open packet without '0' prefix".into()))?;
    serde_json::from_str(json)
        .map_err(|e| DriftError::Validation(format!("malformed open packet: {e}")))
}

fn classify_frame(frame: &str) -> Frame {
    if frame == "3" {
        return Frame::Pong;
    }
    if frame.starts_with("41") {
        return Frame::NamespaceDisconnect;
    }
    if let Some(event_json) = frame.strip_prefix("42") {
        return parse_event(event_json);
    }
    if frame.starts_with("40") {
        return Frame::NamespaceAck;
    }
    Frame::Other
}

/// Parses a Socket.IO event frame body `["<event>", <payload>]`
fn parse_event(event_json: &str) -> Frame {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(event_json) else {
        warn!(frame = %event_json, "Undecodable event frame");
        return Frame::Other;
    };
    let Some(array) = value.as_array() else {
        return Frame::Other;
    };

    match array.first().and_then(|e| e.as_str()) {
        Some("notification") => {
            let payload = array
                .get(1)
                .cloned()
                .and_then(|p| serde_json::from_value::<NotificationPayload>(p).ok())
                .unwrap_or(NotificationPayload {
                    resource: None,
                    subscription_id: None,
                });
            Frame::Notification(payload)
        }
        Some("error") => {
            warn!(frame = %event_json, "Notification service reported an error");
            Frame::Other
        }
        _ => Frame::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_url_query() {
        struct NoTokens;
        #[async_trait::async_trait]
        impl TokenProvider for NoTokens {
            async fn bearer_token(&self) -> Result<String, DriftError> {
                Ok("t".into())
            }
            async fn refresh(&self) -> Result<String, DriftError> {
                Ok("t".into())
            }
        }

        let transport = SocketTransport::new(
            "wss://notify.example/hub",
            "/me/drive/root",
            Arc::new(NoTokens),
        );
        assert_eq!(
            transport.connection_url("tok-1"),
            "wss://notify.example/hub?EIO=4&transport=websocket&access_token=tok-1"
        );

        let with_query = SocketTransport::new(
            "wss://notify.example/hub?app=driftfs",
            "/me/drive/root",
            Arc::new(NoTokens),
        );
        assert!(with_query
            .connection_url("tok-1")
            .starts_with("wss://notify.example/hub?app=driftfs&EIO=4"));
    }

    #[test]
    fn test_parse_open_packet() {
        let open = parse_open_packet(
            r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#,
        )
        .unwrap();
        assert_eq!(open.ping_interval, 25000);
        assert_eq!(open.ping_timeout, 20000);
    }

    #[test]
    fn test_parse_open_packet_rejects_garbage() {
        assert!(parse_open_packet("4nope").is_err());
        assert!(parse_open_packet("0not-json").is_err());
    }

    #[test]
    fn test_classify_pong_and_acks() {
        assert!(matches!(classify_frame("3"), Frame::Pong));
        assert!(matches!(classify_frame("40{\"sid\":\"x\"}"), Frame::NamespaceAck));
        assert!(matches!(classify_frame("41"), Frame::NamespaceDisconnect));
        assert!(matches!(classify_frame("6"), Frame::Other));
    }

    #[test]
    fn test_classify_notification_event() {
        let frame = r#"42["notification",{"resource":"/me/drive/root","subscriptionId":"s1"}]"#;
        match classify_frame(frame) {
            Frame::Notification(payload) => {
                assert_eq!(payload.resource.as_deref(), Some("/me/drive/root"));
                assert_eq!(payload.subscription_id.as_deref(), Some("s1"));
            }
            other => panic!("expected Notification, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_notification_without_payload() {
        match classify_frame(r#"42["notification"]"#) {
            Frame::Notification(payload) => {
                assert!(payload.resource.is_none());
                assert!(payload.subscription_id.is_none());
            }
            other => panic!("expected Notification, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_unknown_event() {
        assert!(matches!(
            classify_frame(r#"42["presence",{"x":1}]"#),
            Frame::Other
        ));
        assert!(matches!(classify_frame("42不是json"), Frame::Other));
    }
}
