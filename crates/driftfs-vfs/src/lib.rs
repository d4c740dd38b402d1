//! DriftFS mount and filesystem surface
//!
//! [`Mount`] assembles one isolated instance of the engine - store, cache,
//! index, pipelines, notifier, connectivity, conflict policy - and exposes
//! the node-id-addressed operations an OS filesystem adapter translates
//! kernel callbacks into: `lookup`, `readdir`, `open`, `read`, `write`,
//! `rename`, and friends, plus the status xattr surface.
//!
//! Multiple mounts are independent; nothing here is process-global.

pub mod fs;
pub mod handle;
pub mod mount;
pub mod xattr;

pub use fs::{DirEntry, FsStats, NodeAttributes, OpenFlags, SetAttrs};
pub use handle::{Handle, HandleId, HandleTable};
pub use mount::{Mount, MountOptions, SubscriptionSpec};
