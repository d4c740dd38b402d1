//! DriftFS change notification
//!
//! Delivers near-real-time change hints to the delta sync loop through
//! pluggable transports, ordered by preference:
//! 1. [`socket`] - long-lived Engine.IO v4 WebSocket to the notification
//!    endpoint
//! 2. [`webhook`] - HTTP subscription with remote-initiated callbacks
//! 3. pure polling - no transport at all; the delta loop falls back to its
//!    shorter cadence
//!
//! The [`notifier::ChangeNotifier`] owns reconnect backoff, transport
//! fallback, and the constant-time `healthy()` signal the delta loop reads
//! for cadence decisions. [`subscriptions`] keeps the remote subscription
//! alive for whichever transport is active.

pub mod notifier;
pub mod socket;
pub mod subscriptions;
pub mod webhook;

pub use notifier::{ChangeNotifier, ChangeTransport, NotifierHandle};
pub use socket::SocketTransport;
pub use subscriptions::SubscriptionManager;
pub use webhook::WebhookTransport;
