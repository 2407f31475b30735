//! Engine-emitted events for the surrounding node / API layer.

use tokio::sync::broadcast;

use crate::error::IndexerError;
use crate::types::BlockHash;

/// Observable engine events, emitted after the commit they describe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    /// A block was applied to the serial track.
    AddBlock { hash: BlockHash, height: u64 },
    /// A block was undone on the serial track.
    RemoveBlock { hash: BlockHash, height: u64 },
    /// The forward-sync serial stage reached a new height.
    Indexed { height: u64 },
    /// The serial tip caught up with the source's best block.
    Synced { height: u64 },
    /// A reorg plan was computed; rewinding starts next.
    Reorg { common_ancestor: BlockHash },
    Error(IndexerError),
}

/// Broadcast side of the event stream.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<IndexEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<IndexEvent>) {
        let (tx, rx) = broadcast::channel(capacity);
        (Self { tx }, rx)
    }

    /// Subscribe before syncing to avoid missing events.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: IndexEvent) {
        // No subscribers is fine; the engine does not depend on being observed.
        if self.tx.send(event).is_err() {
            tracing::trace!("no event subscribers");
        }
    }
}
