//! Tip tracker: durable bookkeeping for the concurrent and serial tips.
//!
//! Tips are persisted in the same batch as the index operations that move
//! them, so a crash can never leave a tip ahead of (or behind) its indexes.

use crate::error::IndexerError;
use crate::store::{IndexStore, Operation};
use crate::types::{ChainPointer, Track};

pub const CONCURRENT_TIP_KEY: &[u8] = b"meta/tip/concurrent";
pub const SERIAL_TIP_KEY: &[u8] = b"meta/tip/serial";

/// Owns both chain pointers.
///
/// Only the single sync/reorg flow mutates the tips, so no locking is done
/// here beyond the store's batch atomicity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipTracker {
    concurrent: ChainPointer,
    serial: ChainPointer,
}

impl TipTracker {
    /// Both tips at `genesis`, nothing persisted yet.
    pub fn at_genesis(genesis: ChainPointer) -> Self {
        Self {
            concurrent: genesis.clone(),
            serial: genesis,
        }
    }

    /// Read persisted tips; a missing tip defaults to `genesis`.
    pub async fn load(store: &dyn IndexStore, genesis: &ChainPointer) -> Result<Self, IndexerError> {
        let concurrent = Self::read(store, CONCURRENT_TIP_KEY).await?;
        let serial = Self::read(store, SERIAL_TIP_KEY).await?;
        let tips = Self {
            concurrent: concurrent.unwrap_or_else(|| genesis.clone()),
            serial: serial.unwrap_or_else(|| genesis.clone()),
        };
        tracing::info!(
            concurrent = %tips.concurrent,
            serial = %tips.serial,
            "loaded tips"
        );
        Ok(tips)
    }

    async fn read(store: &dyn IndexStore, key: &[u8]) -> Result<Option<ChainPointer>, IndexerError> {
        match store.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn tip(&self, track: Track) -> &ChainPointer {
        match track {
            Track::Concurrent => &self.concurrent,
            Track::Serial => &self.serial,
        }
    }

    pub fn concurrent(&self) -> &ChainPointer {
        &self.concurrent
    }

    pub fn serial(&self) -> &ChainPointer {
        &self.serial
    }

    /// The operation that persists `track` at `pointer`.
    pub fn tip_operation(track: Track, pointer: &ChainPointer) -> Result<Operation, IndexerError> {
        let key = match track {
            Track::Concurrent => CONCURRENT_TIP_KEY,
            Track::Serial => SERIAL_TIP_KEY,
        };
        Ok(Operation::put(key, serde_json::to_vec(pointer)?))
    }

    /// Commit `operations` plus the tip update in one batch, then move the
    /// in-memory pointer. On failure nothing moves.
    pub async fn commit(
        &mut self,
        store: &dyn IndexStore,
        track: Track,
        mut operations: Vec<Operation>,
        pointer: ChainPointer,
    ) -> Result<(), IndexerError> {
        operations.push(Self::tip_operation(track, &pointer)?);
        let count = operations.len();
        store.batch(operations).await?;
        tracing::debug!(%track, tip = %pointer, operations = count, "batch committed");
        self.advance(track, pointer);
        Ok(())
    }

    fn advance(&mut self, track: Track, pointer: ChainPointer) {
        match track {
            Track::Concurrent => self.concurrent = pointer,
            Track::Serial => self.serial = pointer,
        }
    }
}
