//! Change-notification data types
//!
//! The notifier crate drives the actual transports; this module holds the
//! transport-agnostic hint record that flows from a transport to the delta
//! sync loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::subscription::TransportKind;

/// A near-real-time hint that something changed on the remote store
///
/// Hints carry no item detail; the delta sync loop treats them purely as a
/// trigger to run a cycle ahead of its polling cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeHint {
    /// Resource scope the hint applies to
    pub resource: String,
    /// Subscription that produced the hint, when known
    pub subscription_id: Option<String>,
    /// Transport that delivered the hint
    pub transport: TransportKind,
    pub received_at: DateTime<Utc>,
}

impl ChangeHint {
    pub fn new(resource: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            resource: resource.into(),
            subscription_id: None,
            transport,
            received_at: Utc::now(),
        }
    }

    pub fn with_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.subscription_id = Some(subscription_id.into());
        self
    }
}
