//! One index frontier (concurrent or serial) behind a common interface, so
//! the reorg resolver runs the same rewind/fast-forward code for both.

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::events::{EventSink, IndexEvent};
use crate::service::{Direction, ServiceRegistry};
use crate::source::ChainSource;
use crate::store::{IndexStore, Operation};
use crate::tips::TipTracker;
use crate::types::{Block, ChainPointer, Track};

/// What the reorg resolver needs from a track.
#[async_trait]
pub trait ChainTrack: Send + Sync {
    fn track(&self) -> Track;

    fn tip(&self) -> &ChainPointer;

    /// Operations every service on this track produces for `block`.
    async fn operations(&self, block: &Block, direction: Direction) -> Result<Vec<Operation>, IndexerError>;

    /// Commit `operations` for one block together with the tip move that
    /// `direction` implies: onto the block for `Apply`, onto its parent for
    /// `Undo`.
    async fn commit(
        &mut self,
        operations: Vec<Operation>,
        block: &Block,
        direction: Direction,
    ) -> Result<(), IndexerError>;
}

/// Everything a sync or reorg step touches, borrowed from the engine.
pub struct SyncContext<'a> {
    pub source: &'a dyn ChainSource,
    pub store: &'a dyn IndexStore,
    pub services: &'a ServiceRegistry,
    pub tips: &'a mut TipTracker,
    pub events: &'a EventSink,
}

impl<'a> SyncContext<'a> {
    /// A handle on one track; holds the tip tracker until dropped.
    pub fn track(&mut self, track: Track) -> IndexTrack<'_> {
        IndexTrack {
            track,
            store: self.store,
            services: self.services,
            tips: &mut *self.tips,
            events: self.events,
        }
    }
}

/// [`ChainTrack`] over the engine's store, services, and tips.
pub struct IndexTrack<'a> {
    track: Track,
    store: &'a dyn IndexStore,
    services: &'a ServiceRegistry,
    tips: &'a mut TipTracker,
    events: &'a EventSink,
}

#[async_trait]
impl ChainTrack for IndexTrack<'_> {
    fn track(&self) -> Track {
        self.track
    }

    fn tip(&self) -> &ChainPointer {
        self.tips.tip(self.track)
    }

    async fn operations(&self, block: &Block, direction: Direction) -> Result<Vec<Operation>, IndexerError> {
        self.services
            .operations_for(self.track, block, direction, self.store)
            .await
    }

    async fn commit(
        &mut self,
        operations: Vec<Operation>,
        block: &Block,
        direction: Direction,
    ) -> Result<(), IndexerError> {
        let pointer = match direction {
            Direction::Apply => block.pointer(),
            Direction::Undo => {
                let prev = block.prev_hash().ok_or_else(|| {
                    IndexerError::Other(format!("cannot undo genesis block {}", block.hash()))
                })?;
                ChainPointer::new(prev, block.height().saturating_sub(1))
            }
        };
        self.tips.commit(self.store, self.track, operations, pointer).await?;

        if self.track == Track::Serial {
            let (hash, height) = (block.hash().to_string(), block.height());
            self.events.emit(match direction {
                Direction::Apply => IndexEvent::AddBlock { hash, height },
                Direction::Undo => IndexEvent::RemoveBlock { hash, height },
            });
        }
        Ok(())
    }
}
