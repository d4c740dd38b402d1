//! DriftFS Core - Domain model and subsystem contracts
//!
//! This crate contains the shared vocabulary of the DriftFS synchronization
//! engine:
//! - **Domain entities** - `Inode`, transfer sessions, offline changes,
//!   change subscriptions, the quick-xor content hash
//! - **Error taxonomy** - `DriftError`, the typed error classification used
//!   by every subsystem
//! - **Configuration** - the mount configuration with validation
//! - **Port definitions** - traits for external collaborators:
//!   `GraphClient`, `TokenProvider`
//!
//! # Architecture
//!
//! Adapter crates (`driftfs-store`, `driftfs-graph`, `driftfs-cache`, ...)
//! implement or consume the contracts defined here. The domain module has no
//! runtime dependencies; ports are async traits wired together by the mount.

pub mod config;
pub mod domain;
pub mod ports;
