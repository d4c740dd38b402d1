//! Inode domain entity
//!
//! An [`Inode`] is one entry of the projected filesystem tree. Content
//! availability is tracked per item with the hydration state machine:
//!
//! ```text
//!   ┌───────┐  open/pin   ┌───────────┐    ok     ┌──────────┐
//!   │ Ghost │ ──────────► │ Hydrating │ ────────► │ Hydrated │
//!   └───────┘             └───────────┘           └──────────┘
//!       ▲                       │ err                 │ local write
//!       │ evict                 ▼                     ▼
//!       │                  ┌───────┐  retry     ┌────────────┐
//!       └──────────────────│ Error │ ◄───────── │ DirtyLocal │
//!                          └───────┘            └────────────┘
//!                                                    │ remote changed
//!                                                    ▼
//!                                               ┌──────────┐
//!                                               │ Conflict │
//!                                               └──────────┘
//! ```
//!
//! The tree is an arena: children point at parents by [`NodeId`], reverse
//! child lookups are maintained by the metadata index. The root's parent is
//! the sentinel id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::DriftError;
use super::newtypes::{ETag, NodeId, QuickXorHash, RemoteId};

// ============================================================================
// ItemKind / OverlayPolicy
// ============================================================================

/// File or directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    File,
    Directory,
}

impl ItemKind {
    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self, ItemKind::Directory)
    }
}

/// How a virtual overlay entry interacts with remote state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayPolicy {
    /// The local entry shadows any remote item of the same name
    LocalWins,
    /// A remote item of the same name replaces the local entry
    #[default]
    RemoteWins,
    /// Directory listings merge local and remote entries
    Merged,
}

// ============================================================================
// ItemState
// ============================================================================

/// Hydration / synchronization state of an item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Metadata known, no local content
    #[default]
    Ghost,
    /// Download in progress
    Hydrating,
    /// Local bytes match the remote ETag
    Hydrated,
    /// Local edits pending upload
    DirtyLocal,
    /// Local delete queued for the remote store
    DeletedLocal,
    /// Local and remote diverged
    Conflict,
    /// Last operation failed
    Error(String),
}

impl ItemState {
    /// Returns true if content is available locally
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ItemState::Hydrated | ItemState::DirtyLocal | ItemState::Conflict
        )
    }

    /// Returns true if an upload or delete is pending
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        matches!(self, ItemState::DirtyLocal | ItemState::DeletedLocal)
    }

    /// Returns true for states that need operator attention
    #[must_use]
    pub fn needs_attention(&self) -> bool {
        matches!(self, ItemState::Conflict | ItemState::Error(_))
    }

    /// State name without error details; also the xattr status value
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ItemState::Ghost => "Ghost",
            ItemState::Hydrating => "Hydrating",
            ItemState::Hydrated => "Hydrated",
            ItemState::DirtyLocal => "DirtyLocal",
            ItemState::DeletedLocal => "DeletedLocal",
            ItemState::Conflict => "Conflict",
            ItemState::Error(_) => "Error",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Error(reason) => write!(f, "error: {reason}"),
            other => write!(f, "{}", other.name().to_lowercase()),
        }
    }
}

// ============================================================================
// Inode
// ============================================================================

/// One entry of the projected filesystem tree
///
/// Every lookup, transfer, and delta application goes through this record.
/// State transitions are validated; persistence is the metadata index's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inode {
    /// Arena index and filesystem node number
    id: NodeId,
    /// Remote store identifier; absent for purely local or virtual items
    remote_id: Option<RemoteId>,
    /// Parent node; sentinel for the root
    parent: NodeId,
    /// Entry name within the parent directory
    name: String,
    kind: ItemKind,
    /// Content size in bytes; 0 for directories
    size: u64,
    /// ETag of the content currently in the local cache
    local_etag: Option<ETag>,
    /// Latest ETag observed from the remote store
    remote_etag: Option<ETag>,
    /// Quick-xor hash from the remote store
    content_hash: Option<QuickXorHash>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    accessed_at: DateTime<Utc>,
    state: ItemState,
    /// Virtual entries exist only locally and are never uploaded
    #[serde(rename = "virtual")]
    virtual_item: bool,
    /// Pinned entries are excluded from cache eviction
    pinned: bool,
    overlay_policy: OverlayPolicy,
}

impl Inode {
    /// Creates an inode for an item discovered on the remote store
    pub fn from_remote(
        id: NodeId,
        parent: NodeId,
        name: impl Into<String>,
        kind: ItemKind,
        remote_id: RemoteId,
        size: u64,
        remote_etag: Option<ETag>,
        content_hash: Option<QuickXorHash>,
        modified_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            remote_id: Some(remote_id),
            parent,
            name: name.into(),
            kind,
            size,
            local_etag: None,
            remote_etag,
            content_hash,
            created_at: now,
            modified_at,
            accessed_at: now,
            state: ItemState::Ghost,
            virtual_item: false,
            pinned: false,
            overlay_policy: OverlayPolicy::default(),
        }
    }

    /// Creates an inode for a locally created item that has not been
    /// uploaded yet
    pub fn new_local(id: NodeId, parent: NodeId, name: impl Into<String>, kind: ItemKind) -> Self {
        let now = Utc::now();
        Self {
            id,
            remote_id: None,
            parent,
            name: name.into(),
            kind,
            size: 0,
            local_etag: None,
            remote_etag: None,
            content_hash: None,
            created_at: now,
            modified_at: now,
            accessed_at: now,
            state: ItemState::DirtyLocal,
            virtual_item: false,
            pinned: false,
            overlay_policy: OverlayPolicy::default(),
        }
    }

    /// Creates a virtual overlay entry; never emitted to the upload queue
    pub fn new_virtual(
        id: NodeId,
        parent: NodeId,
        name: impl Into<String>,
        kind: ItemKind,
        policy: OverlayPolicy,
    ) -> Self {
        let mut inode = Self::new_local(id, parent, name, kind);
        inode.virtual_item = true;
        inode.overlay_policy = policy;
        inode.state = ItemState::Hydrated;
        inode
    }

    /// The mount root
    pub fn root() -> Self {
        let now = Utc::now();
        Self {
            id: NodeId::ROOT,
            remote_id: None,
            parent: NodeId::SENTINEL,
            name: String::new(),
            kind: ItemKind::Directory,
            size: 0,
            local_etag: None,
            remote_etag: None,
            content_hash: None,
            created_at: now,
            modified_at: now,
            accessed_at: now,
            state: ItemState::Ghost,
            virtual_item: false,
            pinned: false,
            overlay_policy: OverlayPolicy::default(),
        }
    }

    // --- Getters ---

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn remote_id(&self) -> Option<&RemoteId> {
        self.remote_id.as_ref()
    }

    pub fn parent(&self) -> NodeId {
        self.parent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn is_directory(&self) -> bool {
        self.kind.is_directory()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn local_etag(&self) -> Option<&ETag> {
        self.local_etag.as_ref()
    }

    pub fn remote_etag(&self) -> Option<&ETag> {
        self.remote_etag.as_ref()
    }

    pub fn content_hash(&self) -> Option<&QuickXorHash> {
        self.content_hash.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    pub fn accessed_at(&self) -> DateTime<Utc> {
        self.accessed_at
    }

    pub fn state(&self) -> &ItemState {
        &self.state
    }

    pub fn is_virtual(&self) -> bool {
        self.virtual_item
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn overlay_policy(&self) -> OverlayPolicy {
        self.overlay_policy
    }

    /// Local and remote ETags agree; content in cache is current
    pub fn etags_match(&self) -> bool {
        match (&self.local_etag, &self.remote_etag) {
            (Some(l), Some(r)) => l == r,
            _ => false,
        }
    }

    // --- Setters ---

    pub fn set_remote_id(&mut self, remote_id: RemoteId) {
        self.remote_id = Some(remote_id);
    }

    /// Drops the remote binding; the next upload creates a fresh item
    pub fn strip_remote_id(&mut self) {
        self.remote_id = None;
    }

    pub fn set_parent(&mut self, parent: NodeId) {
        self.parent = parent;
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn set_local_etag(&mut self, etag: Option<ETag>) {
        self.local_etag = etag;
    }

    pub fn set_remote_etag(&mut self, etag: Option<ETag>) {
        self.remote_etag = etag;
    }

    pub fn set_content_hash(&mut self, hash: Option<QuickXorHash>) {
        self.content_hash = hash;
    }

    pub fn set_modified_at(&mut self, at: DateTime<Utc>) {
        self.modified_at = at;
    }

    pub fn touch_accessed(&mut self) {
        self.accessed_at = Utc::now();
    }

    pub fn set_pinned(&mut self, pinned: bool) {
        self.pinned = pinned;
    }

    pub fn set_overlay_policy(&mut self, policy: OverlayPolicy) {
        self.overlay_policy = policy;
    }

    /// Checks the structural invariants that must hold after every batch
    pub fn validate(&self) -> Result<(), DriftError> {
        if self.id == NodeId::SENTINEL {
            return Err(DriftError::Validation(
                "inode id must not be the sentinel".into(),
            ));
        }
        if self.id != NodeId::ROOT && self.parent.is_sentinel() {
            return Err(DriftError::Validation(format!(
                "non-root inode {} has sentinel parent",
                self.id
            )));
        }
        if self.virtual_item && self.remote_id.is_some() {
            return Err(DriftError::Validation(format!(
                "virtual inode {} must not carry a remote id",
                self.id
            )));
        }
        Ok(())
    }
}

// ============================================================================
// State transitions
// ============================================================================

impl Inode {
    /// Checks whether a state transition is allowed
    ///
    /// `Error` may return to any active state (retry); `DeletedLocal` only
    /// leaves via removal from the index.
    pub fn can_transition_to(&self, target: &ItemState) -> bool {
        // Error returns to any state so a retry can resume where it left off.
        if matches!(self.state, ItemState::Error(_)) {
            return true;
        }

        match (&self.state, target) {
            (ItemState::Ghost, ItemState::Hydrating) => true,
            // Whole-file replacement (truncate) skips hydration entirely.
            (ItemState::Ghost, ItemState::DirtyLocal) => true,
            (ItemState::Ghost, ItemState::DeletedLocal) => true,
            (ItemState::Ghost, ItemState::Error(_)) => true,

            (ItemState::Hydrating, ItemState::Hydrated) => true,
            (ItemState::Hydrating, ItemState::Error(_)) => true,

            (ItemState::Hydrated, ItemState::DirtyLocal) => true,
            (ItemState::Hydrated, ItemState::Ghost) => true, // evict
            (ItemState::Hydrated, ItemState::DeletedLocal) => true,
            (ItemState::Hydrated, ItemState::Error(_)) => true,

            (ItemState::DirtyLocal, ItemState::Hydrated) => true, // upload ok
            (ItemState::DirtyLocal, ItemState::Conflict) => true, // remote changed
            (ItemState::DirtyLocal, ItemState::DeletedLocal) => true,
            (ItemState::DirtyLocal, ItemState::Error(_)) => true,

            (ItemState::Conflict, ItemState::Hydrated) => true, // resolved
            (ItemState::Conflict, ItemState::Ghost) => true, // local side discarded
            (ItemState::Conflict, ItemState::DirtyLocal) => true, // local side re-queued
            (ItemState::Conflict, ItemState::DeletedLocal) => true,
            (ItemState::Conflict, ItemState::Error(_)) => true,

            _ => false,
        }
    }

    /// Applies a state transition, rejecting invalid ones
    pub fn transition_to(&mut self, target: ItemState) -> Result<(), DriftError> {
        if !self.can_transition_to(&target) {
            return Err(DriftError::InvalidTransition {
                from: self.state.name().to_string(),
                to: target.name().to_string(),
            });
        }
        self.state = target;
        Ok(())
    }

    /// Resets a transient in-flight state after a crash; re-hydration is
    /// idempotent so `Hydrating` always falls back to `Ghost`.
    pub fn reset_transient(&mut self) {
        if matches!(self.state, ItemState::Hydrating) {
            self.state = ItemState::Ghost;
        }
    }

    pub fn start_hydrating(&mut self) -> Result<(), DriftError> {
        self.transition_to(ItemState::Hydrating)
    }

    /// Commits a completed download: content hash, matching ETags, Hydrated
    pub fn complete_hydration(
        &mut self,
        etag: ETag,
        hash: QuickXorHash,
        size: u64,
    ) -> Result<(), DriftError> {
        self.transition_to(ItemState::Hydrated)?;
        self.local_etag = Some(etag.clone());
        self.remote_etag = Some(etag);
        self.content_hash = Some(hash);
        self.size = size;
        Ok(())
    }

    pub fn mark_dirty(&mut self) -> Result<(), DriftError> {
        self.transition_to(ItemState::DirtyLocal)
    }

    pub fn mark_conflict(&mut self) -> Result<(), DriftError> {
        self.transition_to(ItemState::Conflict)
    }

    pub fn mark_deleted(&mut self) -> Result<(), DriftError> {
        self.transition_to(ItemState::DeletedLocal)
    }

    /// Evicts cached content; the inode returns to a placeholder
    pub fn evict(&mut self) -> Result<(), DriftError> {
        self.transition_to(ItemState::Ghost)?;
        self.local_etag = None;
        Ok(())
    }

    pub fn mark_error(&mut self, reason: impl Into<String>) {
        self.state = ItemState::Error(reason.into());
    }
}

/// Validates an entry name for the filesystem surface
pub fn validate_name(name: &str) -> Result<(), DriftError> {
    if name.is_empty() {
        return Err(DriftError::InvalidName("empty name".into()));
    }
    if name == "." || name == ".." {
        return Err(DriftError::InvalidName(name.into()));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(DriftError::InvalidName(format!(
            "name contains forbidden character: {name:?}"
        )));
    }
    if name.len() > 255 {
        return Err(DriftError::InvalidName("name longer than 255 bytes".into()));
    }
    Ok(())
}
