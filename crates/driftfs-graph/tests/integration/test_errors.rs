//! Error mapping and auth-refresh integration tests

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use driftfs_core::domain::{DriftError, RemoteId};
use driftfs_core::ports::graph::GraphClient;
use driftfs_graph::items;

use crate::common;

#[tokio::test]
async fn test_auth_rejection_refreshes_once_then_succeeds() {
    let server = MockServer::start().await;

    // Old token is rejected; the refreshed token works.
    Mock::given(method("GET"))
        .and(path("/me/drive/items/item-1"))
        .and(header("Authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/drive/items/item-1"))
        .and(header("Authorization", "Bearer refreshed-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "item-1",
            "name": "x.txt",
            "file": {}
        })))
        .mount(&server)
        .await;

    let tokens = common::TestTokens::new();
    let client = driftfs_graph::HttpGraphClient::with_base_url(tokens.clone(), server.uri());

    let item = items::get_item(&client, &RemoteId::new("item-1").unwrap())
        .await
        .unwrap();
    assert_eq!(item.id, "item-1");
    assert_eq!(tokens.refresh_count(), 1);
}

#[tokio::test]
async fn test_persistent_auth_rejection_surfaces_auth_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/item-2"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let tokens = common::TestTokens::new();
    let client = driftfs_graph::HttpGraphClient::with_base_url(tokens.clone(), server.uri());

    let err = items::get_item(&client, &RemoteId::new("item-2").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, DriftError::Auth(_)));
    // Exactly one refresh attempt, then surface.
    assert_eq!(tokens.refresh_count(), 1);
}

#[tokio::test]
async fn test_missing_item_is_not_found() {
    let (server, client, _tokens) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = items::get_item(&client, &RemoteId::new("gone").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, DriftError::NotFound(_)));
}

#[tokio::test]
async fn test_server_error_is_retryable() {
    let (server, client, _tokens) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/flaky"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = items::get_item(&client, &RemoteId::new("flaky").unwrap())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, DriftError::Server { status: 503, .. }));
}

#[tokio::test]
async fn test_unreachable_host_is_network_error() {
    let tokens = common::TestTokens::new();
    // Nothing listens on this port.
    let client = driftfs_graph::HttpGraphClient::with_base_url(tokens, "http://127.0.0.1:1");

    let err = items::get_item(&client, &RemoteId::new("any").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, DriftError::Network(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_ranged_stream_fetch() {
    let (server, client, _tokens) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/content/blob-1"))
        .and(header("Range", "bytes=10-19"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"0123456789".to_vec()))
        .mount(&server)
        .await;

    let bytes = client
        .get_stream(
            &format!("{}/content/blob-1", server.uri()),
            &[],
            10,
            Some(10),
        )
        .await
        .unwrap();
    assert_eq!(bytes, b"0123456789");
}
