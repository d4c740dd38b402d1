//! Drive item operations
//!
//! DTOs for the Graph `driveItem` resource and the metadata/content
//! operations the engine needs: fetch an item (with its fresh
//! pre-authenticated download URL), delete, rename/move, and create
//! folders. All operations are generic over the `GraphClient` port.
//!
//! The DTO mirrors the wire format; mapping to `Inode` records is the
//! metadata index's job.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use driftfs_core::domain::{DriftError, ETag, QuickXorHash, RemoteId};
use driftfs_core::ports::graph::GraphClient;

/// A `driveItem` as returned by metadata, delta, and upload responses
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    #[serde(rename = "eTag")]
    pub etag: Option<String>,
    pub size: Option<u64>,
    pub last_modified_date_time: Option<DateTime<Utc>>,
    pub parent_reference: Option<ParentReference>,
    pub file: Option<FileFacet>,
    pub folder: Option<serde_json::Value>,
    pub deleted: Option<serde_json::Value>,
    /// Time-limited direct content URL; does not honor conditional headers
    #[serde(rename = "@microsoft.graph.downloadUrl")]
    pub download_url: Option<String>,
}

/// Parent folder reference
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentReference {
    pub id: Option<String>,
    pub path: Option<String>,
}

/// File facet carrying content hashes
#[derive(Debug, Clone, Deserialize)]
pub struct FileFacet {
    pub hashes: Option<FileHashes>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHashes {
    pub quick_xor_hash: Option<String>,
}

impl DriveItem {
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.folder.is_some()
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }

    pub fn remote_id(&self) -> Result<RemoteId, DriftError> {
        RemoteId::new(self.id.clone())
    }

    /// Typed ETag, when the item carries one
    pub fn etag(&self) -> Option<ETag> {
        self.etag.as_deref().and_then(|t| ETag::new(t).ok())
    }

    /// Typed quick-xor hash, when the file facet carries one
    pub fn quick_xor_hash(&self) -> Option<QuickXorHash> {
        self.file
            .as_ref()
            .and_then(|f| f.hashes.as_ref())
            .and_then(|h| h.quick_xor_hash.as_deref())
            .and_then(|h| QuickXorHash::new(h).ok())
    }

    /// Parent remote id, absent for the drive root
    pub fn parent_remote_id(&self) -> Option<&str> {
        self.parent_reference.as_ref().and_then(|p| p.id.as_deref())
    }
}

/// Fetches item metadata, including a fresh pre-authenticated download URL
pub async fn get_item(
    client: &dyn GraphClient,
    remote_id: &RemoteId,
) -> Result<DriveItem, DriftError> {
    let path = format!("/me/drive/items/{}", remote_id.as_str());
    debug!(remote_id = %remote_id, "Fetching item metadata");
    client.get(&path, &[]).await?.into_result()?.json()
}

/// Fetches the drive root item
pub async fn get_root(client: &dyn GraphClient) -> Result<DriveItem, DriftError> {
    client.get("/me/drive/root", &[]).await?.into_result()?.json()
}

/// Fetches one child of a folder by name
///
/// Backs scoped lookup invalidation: a missed name refreshes only itself,
/// never the whole parent listing.
pub async fn get_child(
    client: &dyn GraphClient,
    parent: &RemoteId,
    name: &str,
) -> Result<Option<DriveItem>, DriftError> {
    let path = format!("/me/drive/items/{}:/{}", parent.as_str(), name);
    match client.get(&path, &[]).await?.into_result() {
        Ok(response) => Ok(Some(response.json()?)),
        Err(DriftError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[derive(Debug, serde::Deserialize)]
struct ChildrenPage {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Lists the children of a folder, draining pagination
pub async fn list_children(
    client: &dyn GraphClient,
    remote_id: &RemoteId,
) -> Result<Vec<DriveItem>, DriftError> {
    let mut path = format!("/me/drive/items/{}/children", remote_id.as_str());
    let mut children = Vec::new();

    loop {
        let page: ChildrenPage = client.get(&path, &[]).await?.into_result()?.json()?;
        children.extend(page.value);
        match page.next_link {
            Some(next) => path = next,
            None => break,
        }
    }

    debug!(remote_id = %remote_id, count = children.len(), "Listed folder children");
    Ok(children)
}

/// Deletes an item
pub async fn delete_item(
    client: &dyn GraphClient,
    remote_id: &RemoteId,
) -> Result<(), DriftError> {
    let path = format!("/me/drive/items/{}", remote_id.as_str());
    debug!(remote_id = %remote_id, "Deleting remote item");
    client.delete(&path, &[]).await?.into_result()?;
    Ok(())
}

/// Renames and/or moves an item
///
/// `new_parent == None` renames in place.
pub async fn move_item(
    client: &dyn GraphClient,
    remote_id: &RemoteId,
    new_parent: Option<&RemoteId>,
    new_name: &str,
) -> Result<DriveItem, DriftError> {
    let path = format!("/me/drive/items/{}", remote_id.as_str());
    let mut body = serde_json::json!({ "name": new_name });
    if let Some(parent) = new_parent {
        body["parentReference"] = serde_json::json!({ "id": parent.as_str() });
    }

    debug!(remote_id = %remote_id, new_name, moved = new_parent.is_some(), "Patching item");
    client
        .patch(
            &path,
            &[("Content-Type", "application/json")],
            serde_json::to_vec(&body)
                .map_err(|e| DriftError::Validation(format!("cannot encode patch body: {e}")))?,
        )
        .await?
        .into_result()?
        .json()
}

/// Creates a folder under `parent`
pub async fn create_folder(
    client: &dyn GraphClient,
    parent: &RemoteId,
    name: &str,
) -> Result<DriveItem, DriftError> {
    let path = format!("/me/drive/items/{}/children", parent.as_str());
    let body = serde_json::json!({
        "name": name,
        "folder": {},
        "@microsoft.graph.conflictBehavior": "fail",
    });

    debug!(parent = %parent, name, "Creating remote folder");
    client
        .post(
            &path,
            &[("Content-Type", "application/json")],
            serde_json::to_vec(&body)
                .map_err(|e| DriftError::Validation(format!("cannot encode folder body: {e}")))?,
        )
        .await?
        .into_result()?
        .json()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_item_file_deserialization() {
        let json = r#"{
            "id": "01ITEM",
            "name": "report.docx",
            "eTag": "\"{E1}\"",
            "size": 2048,
            "lastModifiedDateTime": "2026-06-15T10:30:00Z",
            "parentReference": { "id": "01PARENT", "path": "/drive/root:/Documents" },
            "file": { "hashes": { "quickXorHash": "AAAAAAAAAAAAAAAAAAAAAAAAAAA=" } },
            "@microsoft.graph.downloadUrl": "https://content.example/pre-auth/1"
        }"#;

        let item: DriveItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.id, "01ITEM");
        assert!(!item.is_directory());
        assert!(!item.is_deleted());
        assert_eq!(item.etag().unwrap().as_str(), "\"{E1}\"");
        assert_eq!(
            item.quick_xor_hash().unwrap().as_str(),
            "AAAAAAAAAAAAAAAAAAAAAAAAAAA="
        );
        assert_eq!(item.parent_remote_id(), Some("01PARENT"));
        assert_eq!(
            item.download_url.as_deref(),
            Some("https://content.example/pre-auth/1")
        );
    }

    #[test]
    fn test_drive_item_folder() {
        let json = r#"{
            "id": "01DIR",
            "name": "Photos",
            "folder": { "childCount": 4 }
        }"#;

        let item: DriveItem = serde_json::from_str(json).unwrap();
        assert!(item.is_directory());
        assert!(item.quick_xor_hash().is_none());
        assert!(item.download_url.is_none());
    }

    #[test]
    fn test_drive_item_deleted() {
        let json = r#"{
            "id": "01GONE",
            "name": "old.txt",
            "deleted": { "state": "deleted" }
        }"#;

        let item: DriveItem = serde_json::from_str(json).unwrap();
        assert!(item.is_deleted());
        assert!(item.etag().is_none());
    }

    #[test]
    fn test_malformed_hash_is_dropped_not_fatal() {
        let json = r#"{
            "id": "01BAD",
            "name": "f.bin",
            "file": { "hashes": { "quickXorHash": "!!not-base64!!" } }
        }"#;

        let item: DriveItem = serde_json::from_str(json).unwrap();
        assert!(item.quick_xor_hash().is_none());
    }
}
