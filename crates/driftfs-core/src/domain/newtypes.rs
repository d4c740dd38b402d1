//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for the identifiers and opaque tokens that flow
//! between subsystems. Each newtype validates at construction so the rest of
//! the engine can assume well-formed values.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DriftError;

// ============================================================================
// Node identifiers
// ============================================================================

/// Local node identifier: the arena index of an inode and the number exposed
/// through the filesystem callback surface.
///
/// `NodeId::ROOT` (1) is the mount root; its parent is the sentinel
/// `NodeId::SENTINEL` (0), which is never a real node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// The sentinel parent of the root node
    pub const SENTINEL: NodeId = NodeId(0);
    /// The mount root
    pub const ROOT: NodeId = NodeId(1);

    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns true for the sentinel value
    #[must_use]
    pub const fn is_sentinel(&self) -> bool {
        self.0 == 0
    }

    /// Fixed-width key representation; keeps store range scans in node order
    #[must_use]
    pub fn as_key(&self) -> String {
        format!("{:020}", self.0)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = DriftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| DriftError::Validation(format!("invalid node id '{s}': {e}")))
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// ============================================================================
// Remote identifiers and version tags
// ============================================================================

/// Identifier assigned by the remote store to each drive item
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Result<Self, DriftError> {
        let id = id.into();
        if id.is_empty() {
            return Err(DriftError::Validation("remote id must not be empty".into()));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RemoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque version tag assigned by the remote store, mutated on every content
/// or metadata change. Compared for equality only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    pub fn new(tag: impl Into<String>) -> Result<Self, DriftError> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(DriftError::Validation("etag must not be empty".into()));
        }
        Ok(Self(tag))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ETag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque incremental-sync token: everything up to this point has been
/// observed against the remote store. One per mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaCursor(String);

impl DeltaCursor {
    pub fn new(token: impl Into<String>) -> Result<Self, DriftError> {
        let token = token.into();
        if token.is_empty() {
            return Err(DriftError::Validation(
                "delta cursor must not be empty".into(),
            ));
        }
        Ok(Self(token))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeltaCursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Content hash
// ============================================================================

/// Base64 encoding of a 20-byte quick-xor digest, the content-hash algorithm
/// the remote store uses for integrity checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuickXorHash(String);

impl QuickXorHash {
    /// Validates that the value is Base64 and decodes to the 20-byte digest
    /// width.
    pub fn new(encoded: impl Into<String>) -> Result<Self, DriftError> {
        let encoded = encoded.into();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .map_err(|e| DriftError::Validation(format!("invalid quick-xor hash: {e}")))?;
        if decoded.len() != super::quickxor::DIGEST_BYTES {
            return Err(DriftError::Validation(format!(
                "quick-xor hash must decode to {} bytes, got {}",
                super::quickxor::DIGEST_BYTES,
                decoded.len()
            )));
        }
        Ok(Self(encoded))
    }

    /// Wraps an already-computed digest without re-validating
    pub(crate) fn from_digest(digest: &[u8; super::quickxor::DIGEST_BYTES]) -> Self {
        Self(base64::engine::general_purpose::STANDARD.encode(digest))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QuickXorHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Correlation IDs
// ============================================================================

/// Correlates the log lines of one pipeline operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
