//! Upload operations
//!
//! Two strategies, chosen by the upload pipeline:
//! - [`put_small`] - single PUT of the whole body
//! - [`create_session`] / [`put_chunk`] - resumable upload session; the
//!   pipeline persists the acknowledged offset after every chunk so a
//!   restart resumes mid-file
//!
//! Conflict prechecks ride on the `If-Match` header: when a baseline ETag
//! is supplied, the remote store rejects the write with 412 if the item
//! changed underneath us, which surfaces as `DriftError::Conflict`.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use driftfs_core::domain::{DriftError, RemoteId};
use driftfs_core::ports::graph::GraphClient;

use crate::items::DriveItem;

/// Response from creating an upload session
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub upload_url: String,
    pub expiration_date_time: Option<DateTime<Utc>>,
}

/// Result of one chunk PUT
#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    /// Chunk acknowledged; more chunks expected
    Accepted {
        /// Next byte the server expects, parsed from `nextExpectedRanges`
        next_offset: Option<u64>,
    },
    /// Final chunk; the upload is committed
    Completed(DriveItem),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcceptedBody {
    #[serde(default)]
    next_expected_ranges: Vec<String>,
}

/// Uploads a whole body in one PUT
///
/// Targets `/items/{parent}:/{name}:/content`, which creates or replaces
/// the child. With `if_match`, the write only lands when the remote ETag
/// still equals the baseline.
pub async fn put_small(
    client: &dyn GraphClient,
    parent: &RemoteId,
    name: &str,
    body: Vec<u8>,
    if_match: Option<&str>,
) -> Result<DriveItem, DriftError> {
    let path = format!(
        "/me/drive/items/{}:/{}:/content",
        parent.as_str(),
        urlencode(name)
    );

    debug!(parent = %parent, name, bytes = body.len(), "Small upload");

    let mut headers: Vec<(&str, &str)> = vec![("Content-Type", "application/octet-stream")];
    if let Some(etag) = if_match {
        headers.push(("If-Match", etag));
    }

    client.put(&path, &headers, body).await?.into_result()?.json()
}

/// Creates a resumable upload session for a child of `parent`
pub async fn create_session(
    client: &dyn GraphClient,
    parent: &RemoteId,
    name: &str,
    if_match: Option<&str>,
) -> Result<SessionInfo, DriftError> {
    let path = format!(
        "/me/drive/items/{}:/{}:/createUploadSession",
        parent.as_str(),
        urlencode(name)
    );
    let body = serde_json::json!({
        "item": { "@microsoft.graph.conflictBehavior": "replace", "name": name }
    });

    let mut headers: Vec<(&str, &str)> = vec![("Content-Type", "application/json")];
    if let Some(etag) = if_match {
        headers.push(("If-Match", etag));
    }

    let info: SessionInfo = client
        .post(
            &path,
            &headers,
            serde_json::to_vec(&body)
                .map_err(|e| DriftError::Validation(format!("cannot encode session body: {e}")))?,
        )
        .await?
        .into_result()?
        .json()?;

    info!(parent = %parent, name, "Upload session created");
    Ok(info)
}

/// Uploads one chunk to an upload session URL
///
/// `offset` and `total` describe the chunk's position via `Content-Range`.
/// Intermediate chunks return 202 with the next expected ranges; the final
/// chunk returns the committed drive item.
pub async fn put_chunk(
    client: &dyn GraphClient,
    session_url: &str,
    chunk: Vec<u8>,
    offset: u64,
    total: u64,
) -> Result<ChunkOutcome, DriftError> {
    let end = offset + chunk.len() as u64 - 1;
    let content_range = format!("bytes {offset}-{end}/{total}");
    let content_length = chunk.len().to_string();

    debug!(session_url, %content_range, "Uploading chunk");

    let response = client
        .put(
            session_url,
            &[
                ("Content-Length", content_length.as_str()),
                ("Content-Range", content_range.as_str()),
            ],
            chunk,
        )
        .await?;

    match response.status {
        200 | 201 => {
            let item: DriveItem = response.json()?;
            info!(id = %item.id, "Upload session completed");
            Ok(ChunkOutcome::Completed(item))
        }
        202 => {
            let accepted: AcceptedBody = response.json().unwrap_or(AcceptedBody {
                next_expected_ranges: Vec::new(),
            });
            Ok(ChunkOutcome::Accepted {
                next_offset: parse_next_offset(&accepted.next_expected_ranges),
            })
        }
        _ => {
            response.into_result()?;
            Err(DriftError::Validation(
                "unexpected success status for chunk upload".into(),
            ))
        }
    }
}

/// Queries a session for the next expected byte, used when resuming
pub async fn query_session(
    client: &dyn GraphClient,
    session_url: &str,
) -> Result<Option<u64>, DriftError> {
    let body: AcceptedBody = client
        .get(session_url, &[])
        .await?
        .into_result()?
        .json()?;
    Ok(parse_next_offset(&body.next_expected_ranges))
}

/// Abandons a session so the remote store can reclaim it
pub async fn cancel_session(
    client: &dyn GraphClient,
    session_url: &str,
) -> Result<(), DriftError> {
    client.delete(session_url, &[]).await?.into_result()?;
    Ok(())
}

/// Parses the start of the first `nextExpectedRanges` entry
/// (`"26214400-52428799"` or open-ended `"26214400-"`)
fn parse_next_offset(ranges: &[String]) -> Option<u64> {
    ranges
        .first()
        .and_then(|r| r.split('-').next())
        .and_then(|start| start.parse::<u64>().ok())
}

/// Minimal percent-encoding for path segments in item-by-path URLs
fn urlencode(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'(' | b')'
            | b' ' => {
                if b == b' ' {
                    out.push_str("%20");
                } else {
                    out.push(b as char);
                }
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_next_offset() {
        assert_eq!(
            parse_next_offset(&["26214400-52428799".to_string()]),
            Some(26214400)
        );
        assert_eq!(parse_next_offset(&["1048576-".to_string()]), Some(1048576));
        assert_eq!(parse_next_offset(&[]), None);
        assert_eq!(parse_next_offset(&["garbage".to_string()]), None);
    }

    #[test]
    fn test_urlencode_keeps_common_names() {
        assert_eq!(urlencode("report.docx"), "report.docx");
        assert_eq!(urlencode("my file (1).txt"), "my%20file%20(1).txt");
        assert_eq!(urlencode("a#b?.txt"), "a%23b%3F.txt");
    }

    #[test]
    fn test_session_info_deserialization() {
        let json = r#"{
            "uploadUrl": "https://up.example/session/9",
            "expirationDateTime": "2026-06-15T12:00:00Z"
        }"#;
        let info: SessionInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.upload_url, "https://up.example/session/9");
        assert!(info.expiration_date_time.is_some());
    }

    #[test]
    fn test_accepted_body_defaults() {
        let body: AcceptedBody = serde_json::from_str("{}").unwrap();
        assert!(body.next_expected_ranges.is_empty());
    }
}
