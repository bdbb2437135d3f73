//! Item change notifications for live-tail subscribers.
//!
//! Delivery (websockets, SSE...) is the embedding service's concern; the engine
//! only publishes. Slow subscribers lag and miss events rather than blocking
//! ingestion.

use tokio::sync::broadcast;

use crate::item::ItemType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemEventKind {
    /// New content was buffered.
    Updated,
    /// The item reached Completed.
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemEvent {
    pub kind: ItemEventKind,
    pub item_id: String,
    pub item_type: ItemType,
    pub api_ref_hash: String,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ItemEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish; having no subscriber is fine.
    pub fn publish(&self, event: ItemEvent) {
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ItemEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
