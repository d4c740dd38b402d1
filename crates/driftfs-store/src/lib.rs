//! DriftFS persistent store
//!
//! Crash-safe storage for all long-lived engine state: inodes, the delta
//! cursor, transfer sessions, the offline change queue, and notification
//! subscriptions. Built on SQLite (WAL, synchronous commits) behind a
//! bucketed key-value surface with atomic write batches and single-owner
//! lock-file semantics.

pub mod records;
pub mod store;

pub use store::{BatchOp, Bucket, LockOptions, Store};
