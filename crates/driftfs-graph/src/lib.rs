//! DriftFS Microsoft Graph adapter
//!
//! Implements the `GraphClient` transport port with `reqwest` and layers the
//! typed drive operations the engine needs on top of it:
//! - [`client`] - HTTP transport with bearer auth, single-refresh retry on
//!   auth failures, and typed error mapping
//! - [`items`] - drive item DTOs and metadata/content operations
//! - [`delta`] - incremental change queries with pagination
//! - [`upload`] - small-file PUT and resumable upload sessions
//! - [`pacing`] - per-category request pacing driven by throttle signals
//!
//! Every typed operation is generic over `dyn GraphClient`, so tests and
//! alternative transports plug in without touching the engine.

pub mod client;
pub mod delta;
pub mod items;
pub mod pacing;
pub mod upload;

pub use client::HttpGraphClient;
