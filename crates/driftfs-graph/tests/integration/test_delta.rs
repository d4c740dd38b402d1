//! Delta query integration tests: pagination, cursors, deleted items

use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use driftfs_core::domain::DeltaCursor;
use driftfs_graph::delta;

use crate::common;

#[tokio::test]
async fn test_initial_delta_returns_items_and_cursor() {
    let (server, client, _tokens) = common::setup().await;

    let items = serde_json::json!([
        {
            "id": "file-001",
            "name": "document.txt",
            "eTag": "\"E1\"",
            "size": 1024,
            "lastModifiedDateTime": "2026-01-15T10:00:00Z",
            "parentReference": { "id": "root-id", "path": "/drive/root:" },
            "file": { "hashes": { "quickXorHash": "AAAAAAAAAAAAAAAAAAAAAAAAAAA=" } }
        },
        {
            "id": "folder-001",
            "name": "Documents",
            "parentReference": { "id": "root-id", "path": "/drive/root:" },
            "folder": { "childCount": 3 }
        }
    ]);
    common::mount_delta_single_page(&server, items, "cursor-1").await;

    let batch = delta::fetch_all(&client, None).await.unwrap();

    assert_eq!(batch.items.len(), 2);
    assert_eq!(batch.pages, 1);
    assert_eq!(batch.cursor.as_str(), "cursor-1");

    let file = &batch.items[0];
    assert_eq!(file.id, "file-001");
    assert!(!file.is_directory());
    assert_eq!(file.etag().unwrap().as_str(), "\"E1\"");
    assert!(batch.items[1].is_directory());
}

#[tokio::test]
async fn test_delta_with_cursor_sends_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .and(query_param("token", "previous"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [{ "id": "file-002", "name": "new.txt", "file": {} }],
            "@odata.deltaLink": format!("{}/me/drive/root/delta?token=next", server.uri())
        })))
        .mount(&server)
        .await;

    let tokens = common::TestTokens::new();
    let client = driftfs_graph::HttpGraphClient::with_base_url(tokens, server.uri());
    let cursor = DeltaCursor::new("previous").unwrap();

    let batch = delta::fetch_all(&client, Some(&cursor)).await.unwrap();
    assert_eq!(batch.items.len(), 1);
    assert_eq!(batch.cursor.as_str(), "next");
}

#[tokio::test]
async fn test_delta_pagination_drains_all_pages() {
    let server = MockServer::start().await;

    // Page 1 links to page 2; page 2 carries the delta link.
    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [{ "id": "a", "name": "a.txt", "file": {} }],
            "@odata.nextLink": format!("{}/me/drive/root/delta?page=2", server.uri())
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [{ "id": "b", "name": "b.txt", "file": {} }],
            "@odata.deltaLink": format!("{}/me/drive/root/delta?token=done", server.uri())
        })))
        .mount(&server)
        .await;

    let tokens = common::TestTokens::new();
    let client = driftfs_graph::HttpGraphClient::with_base_url(tokens, server.uri());

    let batch = delta::fetch_all(&client, None).await.unwrap();

    assert_eq!(batch.pages, 2);
    let ids: Vec<&str> = batch.items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(batch.cursor.as_str(), "done");
}

#[tokio::test]
async fn test_delta_empty_response() {
    let (server, client, _tokens) = common::setup().await;
    common::mount_delta_single_page(&server, serde_json::json!([]), "empty").await;

    let batch = delta::fetch_all(&client, None).await.unwrap();
    assert!(batch.items.is_empty());
    assert_eq!(batch.cursor.as_str(), "empty");
}

#[tokio::test]
async fn test_delta_deleted_items() {
    let (server, client, _tokens) = common::setup().await;

    let items = serde_json::json!([
        { "id": "gone-1", "name": "removed.txt", "deleted": { "state": "deleted" } },
        { "id": "gone-2", "name": "removed.pdf", "deleted": {} }
    ]);
    common::mount_delta_single_page(&server, items, "del").await;

    let batch = delta::fetch_all(&client, None).await.unwrap();
    assert_eq!(batch.items.len(), 2);
    assert!(batch.items.iter().all(|i| i.is_deleted()));
}

#[tokio::test]
async fn test_expired_cursor_surfaces_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let tokens = common::TestTokens::new();
    let client = driftfs_graph::HttpGraphClient::with_base_url(tokens, server.uri());
    let cursor = DeltaCursor::new("expired").unwrap();

    let err = delta::fetch_all(&client, Some(&cursor)).await.unwrap_err();
    assert!(matches!(
        err,
        driftfs_core::domain::DriftError::NotFound(_)
    ));
}
