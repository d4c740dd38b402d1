//! Extended attribute surface
//!
//! Read-only status attributes in the `user.driftfs.` namespace:
//! - `user.driftfs.status` - current item state name
//! - `user.driftfs.size` - content size in bytes
//! - `user.driftfs.remote_id` - remote item id, when bound
//! - `user.driftfs.progress` - hydration percentage, only while Hydrating

use driftfs_core::domain::{Inode, ItemState};

/// Current sync/hydration state
pub const XATTR_STATUS: &str = "user.driftfs.status";
/// Content size in bytes (decimal string)
pub const XATTR_SIZE: &str = "user.driftfs.size";
/// Remote item id
pub const XATTR_REMOTE_ID: &str = "user.driftfs.remote_id";
/// Hydration progress percentage, present only during Hydrating
pub const XATTR_PROGRESS: &str = "user.driftfs.progress";

/// All attribute names, for `listxattr`
#[must_use]
pub fn list_xattrs() -> Vec<&'static str> {
    vec![XATTR_STATUS, XATTR_SIZE, XATTR_REMOTE_ID, XATTR_PROGRESS]
}

/// Reads one attribute from an inode
///
/// `hydration_progress` is the live value from the status map; it only
/// surfaces while the item is actually Hydrating.
#[must_use]
pub fn get_xattr(inode: &Inode, name: &str, hydration_progress: Option<u8>) -> Option<Vec<u8>> {
    match name {
        XATTR_STATUS => Some(inode.state().name().as_bytes().to_vec()),
        XATTR_SIZE => Some(inode.size().to_string().into_bytes()),
        XATTR_REMOTE_ID => inode.remote_id().map(|r| r.as_str().as_bytes().to_vec()),
        XATTR_PROGRESS => {
            if matches!(inode.state(), ItemState::Hydrating) {
                Some(hydration_progress.unwrap_or(0).to_string().into_bytes())
            } else {
                None
            }
        }
        _ => None,
    }
}
