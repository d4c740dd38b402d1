//! Domain entities and business rules
//!
//! Core types for the DriftFS synchronization engine:
//! - Validated newtypes for identifiers, version tags, and hashes
//! - The `Inode` entity and its hydration state machine
//! - Transfer session records for crash-resumable uploads and downloads
//! - Offline change records with coalescing
//! - Change-notification subscriptions
//! - The quick-xor content hash
//! - The typed error taxonomy

pub mod errors;
pub mod inode;
pub mod newtypes;
pub mod offline;
pub mod quickxor;
pub mod session;
pub mod subscription;

// Re-export commonly used types
pub use errors::{DriftError, ErrorKind};
pub use inode::{validate_name, Inode, ItemKind, ItemState, OverlayPolicy};
pub use newtypes::{CorrelationId, DeltaCursor, ETag, NodeId, QuickXorHash, RemoteId};
pub use offline::{OfflineChange, OfflineOpKind};
pub use quickxor::QuickXorHasher;
pub use session::{DownloadSession, UploadSession, UploadStrategy};
pub use subscription::{Subscription, TransportKind};
