//! Change-notification subscription records

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Which transport delivers notifications for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Long-lived Engine.IO socket to the notification endpoint
    Socket,
    /// HTTP subscription with remote-initiated callbacks
    Webhook,
    /// No push transport; the delta loop polls on the fallback cadence
    Polling,
}

/// A persisted change-notification subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Identifier assigned by the remote store
    pub id: String,
    /// Resource scope the subscription covers (e.g. the drive root)
    pub resource: String,
    pub expires_at: DateTime<Utc>,
    pub transport: TransportKind,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        id: impl Into<String>,
        resource: impl Into<String>,
        expires_at: DateTime<Utc>,
        transport: TransportKind,
    ) -> Self {
        Self {
            id: id.into(),
            resource: resource.into(),
            expires_at,
            transport,
            created_at: Utc::now(),
        }
    }

    /// Renewal is proactive: within 24 hours of expiration
    #[must_use]
    pub fn needs_renewal(&self) -> bool {
        Utc::now() + Duration::hours(24) >= self.expires_at
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_renewal_window() {
        let fresh = Subscription::new(
            "sub-1",
            "/me/drive/root",
            Utc::now() + Duration::days(3),
            TransportKind::Webhook,
        );
        assert!(!fresh.needs_renewal());
        assert!(!fresh.is_expired());

        let closing = Subscription::new(
            "sub-2",
            "/me/drive/root",
            Utc::now() + Duration::hours(12),
            TransportKind::Webhook,
        );
        assert!(closing.needs_renewal());
        assert!(!closing.is_expired());

        let expired = Subscription::new(
            "sub-3",
            "/me/drive/root",
            Utc::now() - Duration::minutes(1),
            TransportKind::Socket,
        );
        assert!(expired.needs_renewal());
        assert!(expired.is_expired());
    }
}
