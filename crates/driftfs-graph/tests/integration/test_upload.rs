//! Upload integration tests: small PUT, sessions, chunk resume, prechecks

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use driftfs_core::domain::{DriftError, RemoteId};
use driftfs_graph::upload::{self, ChunkOutcome};

use crate::common;

fn committed_item() -> serde_json::Value {
    serde_json::json!({
        "id": "uploaded-1",
        "name": "big.bin",
        "eTag": "\"E-new\"",
        "size": 300,
        "file": { "hashes": { "quickXorHash": "AAAAAAAAAAAAAAAAAAAAAAAAAAA=" } }
    })
}

#[tokio::test]
async fn test_put_small_returns_committed_item() {
    let (server, client, _tokens) = common::setup().await;

    Mock::given(method("PUT"))
        .and(path("/me/drive/items/parent-1:/a.txt:/content"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": "small-1",
            "name": "a.txt",
            "eTag": "\"E2\"",
            "size": 5,
            "file": {}
        })))
        .mount(&server)
        .await;

    let parent = RemoteId::new("parent-1").unwrap();
    let item = upload::put_small(&client, &parent, "a.txt", b"hello".to_vec(), None)
        .await
        .unwrap();

    assert_eq!(item.id, "small-1");
    assert_eq!(item.etag().unwrap().as_str(), "\"E2\"");
}

#[tokio::test]
async fn test_put_small_precheck_conflict() {
    let (server, client, _tokens) = common::setup().await;

    // The baseline ETag no longer matches; the server rejects the write.
    Mock::given(method("PUT"))
        .and(path("/me/drive/items/parent-1:/a.txt:/content"))
        .and(header("If-Match", "\"E1\""))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let parent = RemoteId::new("parent-1").unwrap();
    let err = upload::put_small(&client, &parent, "a.txt", b"x".to_vec(), Some("\"E1\""))
        .await
        .unwrap_err();

    assert!(matches!(err, DriftError::Conflict(_)));
}

#[tokio::test]
async fn test_create_session_and_upload_chunks() {
    let server = MockServer::start().await;
    let session_url = format!("{}/upload-session/42", server.uri());

    Mock::given(method("POST"))
        .and(path("/me/drive/items/parent-1:/big.bin:/createUploadSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uploadUrl": session_url,
            "expirationDateTime": "2026-08-02T12:00:00Z"
        })))
        .mount(&server)
        .await;

    // First chunk accepted, second chunk completes.
    Mock::given(method("PUT"))
        .and(path("/upload-session/42"))
        .and(header("Content-Range", "bytes 0-149/300"))
        .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({
            "nextExpectedRanges": ["150-299"]
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload-session/42"))
        .and(header("Content-Range", "bytes 150-299/300"))
        .respond_with(ResponseTemplate::new(201).set_body_json(committed_item()))
        .mount(&server)
        .await;

    let tokens = common::TestTokens::new();
    let client = driftfs_graph::HttpGraphClient::with_base_url(tokens, server.uri());
    let parent = RemoteId::new("parent-1").unwrap();

    let session = upload::create_session(&client, &parent, "big.bin", None)
        .await
        .unwrap();
    assert!(session.expiration_date_time.is_some());

    let first = upload::put_chunk(&client, &session.upload_url, vec![0u8; 150], 0, 300)
        .await
        .unwrap();
    match first {
        ChunkOutcome::Accepted { next_offset } => assert_eq!(next_offset, Some(150)),
        other => panic!("expected Accepted, got {other:?}"),
    }

    let second = upload::put_chunk(&client, &session.upload_url, vec![0u8; 150], 150, 300)
        .await
        .unwrap();
    match second {
        ChunkOutcome::Completed(item) => {
            assert_eq!(item.id, "uploaded-1");
            assert_eq!(item.etag().unwrap().as_str(), "\"E-new\"");
        }
        other => panic!("expected Completed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_query_session_reports_resume_offset() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/upload-session/9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "nextExpectedRanges": ["31457280-314572799"]
        })))
        .mount(&server)
        .await;

    let tokens = common::TestTokens::new();
    let client = driftfs_graph::HttpGraphClient::with_base_url(tokens, server.uri());

    let offset = upload::query_session(&client, &format!("{}/upload-session/9", server.uri()))
        .await
        .unwrap();
    assert_eq!(offset, Some(31457280));
}

#[tokio::test]
async fn test_chunk_rate_limit_carries_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/upload-session/7"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "13"))
        .mount(&server)
        .await;

    let tokens = common::TestTokens::new();
    let client = driftfs_graph::HttpGraphClient::with_base_url(tokens, server.uri());

    let err = upload::put_chunk(
        &client,
        &format!("{}/upload-session/7", server.uri()),
        vec![0u8; 10],
        0,
        10,
    )
    .await
    .unwrap_err();

    match err {
        DriftError::RateLimited { retry_after } => {
            assert_eq!(retry_after, Some(std::time::Duration::from_secs(13)));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}
