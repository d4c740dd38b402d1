//! Delta (incremental change) queries
//!
//! The delta endpoint returns pages of changed items plus either a
//! `@odata.nextLink` (more pages follow) or a `@odata.deltaLink` (the new
//! cursor for the next cycle). [`fetch_all`] drains the pagination; the
//! caller applies items and persists the returned cursor atomically with
//! them so a crash never splits a cycle.

use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use driftfs_core::domain::{DeltaCursor, DriftError};
use driftfs_core::ports::graph::GraphClient;

use crate::items::DriveItem;

/// One page of a delta query
#[derive(Debug, Clone)]
pub struct DeltaPage {
    pub items: Vec<DriveItem>,
    /// Present while more pages follow
    pub next_link: Option<String>,
    /// Present on the final page; the cursor for the next cycle
    pub delta_link: Option<String>,
}

/// A fully drained delta query
#[derive(Debug, Clone)]
pub struct DeltaBatch {
    pub items: Vec<DriveItem>,
    /// Cursor extracted from the final page's delta link
    pub cursor: DeltaCursor,
    pub pages: u32,
}

#[derive(Debug, Deserialize)]
struct DeltaResponseBody {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

/// Fetches one delta page
///
/// Priority of the request target: an explicit `page_link` (pagination),
/// then the stored `cursor` (incremental), then a full enumeration.
pub async fn fetch_page(
    client: &dyn GraphClient,
    cursor: Option<&DeltaCursor>,
    page_link: Option<&str>,
) -> Result<DeltaPage, DriftError> {
    let path = match (page_link, cursor) {
        (Some(link), _) => link.to_string(),
        (None, Some(cursor)) => format!("/me/drive/root/delta?token={}", cursor.as_str()),
        (None, None) => "/me/drive/root/delta".to_string(),
    };

    let body: DeltaResponseBody = client.get(&path, &[]).await?.into_result()?.json()?;

    debug!(
        items = body.value.len(),
        has_next = body.next_link.is_some(),
        has_delta = body.delta_link.is_some(),
        "Delta page fetched"
    );

    Ok(DeltaPage {
        items: body.value,
        next_link: body.next_link,
        delta_link: body.delta_link,
    })
}

/// Drains a delta query across all pages
///
/// A cancelled fetch leaves the stored cursor untouched; the next cycle
/// repeats the whole query, which is safe because delta application is
/// idempotent.
pub async fn fetch_all(
    client: &dyn GraphClient,
    cursor: Option<&DeltaCursor>,
) -> Result<DeltaBatch, DriftError> {
    let mut items = Vec::new();
    let mut page_link: Option<String> = None;
    let mut pages = 0u32;

    loop {
        let page = fetch_page(client, cursor, page_link.as_deref()).await?;
        pages += 1;
        items.extend(page.items);

        match (page.next_link, page.delta_link) {
            (Some(next), _) => page_link = Some(next),
            (None, Some(delta)) => {
                let cursor = cursor_from_delta_link(&delta)?;
                info!(items = items.len(), pages, "Delta query drained");
                return Ok(DeltaBatch {
                    items,
                    cursor,
                    pages,
                });
            }
            (None, None) => {
                return Err(DriftError::Validation(
                    "delta response carried neither nextLink nor deltaLink".into(),
                ));
            }
        }
    }
}

/// Extracts the opaque cursor token from a delta link URL
fn cursor_from_delta_link(delta_link: &str) -> Result<DeltaCursor, DriftError> {
    let url = Url::parse(delta_link)
        .map_err(|e| DriftError::Validation(format!("malformed delta link: {e}")))?;
    let token = url
        .query_pairs()
        .find(|(name, _)| name == "token")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| {
            DriftError::Validation(format!("delta link without token parameter: {delta_link}"))
        })?;
    DeltaCursor::new(token)
}
