//! Port definitions
//!
//! Traits and data contracts implemented by adapter crates or external
//! collaborators:
//! - `GraphClient` / `TokenProvider` - the remote store boundary
//! - `ChangeHint` - transport-agnostic change notification payload

pub mod graph;
pub mod transport;

pub use graph::{GraphClient, GraphResponse, RequestHeaders, TokenProvider};
pub use transport::ChangeHint;
