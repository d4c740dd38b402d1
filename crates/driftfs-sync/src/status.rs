//! Transfer status channel
//!
//! A broadcast stream of typed events for status consumers (the callback
//! surface, desktop integration, logs) plus the live hydration-progress
//! map backing the progress xattr.

use dashmap::DashMap;
use tokio::sync::broadcast;

use driftfs_core::domain::NodeId;

/// Broadcast capacity; late subscribers only care about recent events
const CHANNEL_CAPACITY: usize = 256;

/// A status event emitted by the pipelines
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    HydrationStarted { node: NodeId },
    HydrationProgress { node: NodeId, percent: u8 },
    HydrationCompleted { node: NodeId },
    HydrationFailed { node: NodeId, error: String },
    UploadStarted { node: NodeId },
    UploadCompleted { node: NodeId },
    UploadFailed { node: NodeId, error: String },
    ConflictDetected { node: NodeId },
    StateChanged { node: NodeId, state: String },
}

impl TransferEvent {
    /// The node this event concerns
    #[must_use]
    pub fn node(&self) -> NodeId {
        match self {
            TransferEvent::HydrationStarted { node }
            | TransferEvent::HydrationProgress { node, .. }
            | TransferEvent::HydrationCompleted { node }
            | TransferEvent::HydrationFailed { node, .. }
            | TransferEvent::UploadStarted { node }
            | TransferEvent::UploadCompleted { node }
            | TransferEvent::UploadFailed { node, .. }
            | TransferEvent::ConflictDetected { node }
            | TransferEvent::StateChanged { node, .. } => *node,
        }
    }
}

/// Shared status state of one mount
pub struct TransferStatus {
    events: broadcast::Sender<TransferEvent>,
    /// Hydration progress (0-100) per node, present only mid-download
    progress: DashMap<NodeId, u8>,
}

impl TransferStatus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            events,
            progress: DashMap::new(),
        }
    }

    /// Subscribes to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Emits an event; progress events also maintain the progress map
    pub fn emit(&self, event: TransferEvent) {
        match &event {
            TransferEvent::HydrationStarted { node } => {
                self.progress.insert(*node, 0);
            }
            TransferEvent::HydrationProgress { node, percent } => {
                self.progress.insert(*node, *percent);
            }
            TransferEvent::HydrationCompleted { node }
            | TransferEvent::HydrationFailed { node, .. } => {
                self.progress.remove(node);
            }
            _ => {}
        }
        // Send errors only mean nobody is listening right now.
        let _ = self.events.send(event);
    }

    /// Current hydration progress of a node, if a download is running
    #[must_use]
    pub fn progress(&self, node: NodeId) -> Option<u8> {
        self.progress.get(&node).map(|p| *p)
    }
}

impl Default for TransferStatus {
    fn default() -> Self {
        Self::new()
    }
}
