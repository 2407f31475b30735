//! Chain source contract plus an in-memory, reorganisable implementation.
//!
//! The engine trusts the source for validity and best-chain selection; it
//! only ever asks for blocks, headers, and the current best head.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::IndexerError;
use crate::types::{Block, BlockHash, BlockHeader, HashOrHeight};

/// Trait for the consensus-validating node the indexes follow.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Fetch a block. Fails with [`IndexerError::NotFound`] if unknown at the
    /// current chain state (a height lookup only resolves on the best chain).
    async fn get_block(&self, at: HashOrHeight) -> Result<Block, IndexerError>;

    /// Fetch a header by hash. Side-branch headers resolve too.
    async fn get_block_header(&self, hash: &str) -> Result<BlockHeader, IndexerError>;

    async fn best_hash(&self) -> Result<BlockHash, IndexerError>;

    async fn best_height(&self) -> Result<u64, IndexerError>;

    /// Hash of the best-chain block at `height`, if there is one.
    async fn block_hash_at(&self, height: u64) -> Result<Option<BlockHash>, IndexerError> {
        match self.get_block(HashOrHeight::Height(height)).await {
            Ok(block) => Ok(Some(block.header.hash)),
            Err(IndexerError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ─── In-memory source ─────────────────────────────────────────────────────────

#[derive(Default)]
struct ChainState {
    blocks: HashMap<BlockHash, Block>,
    /// Best chain, indexed by height.
    best: Vec<BlockHash>,
}

/// In-memory chain for tests and embedders that already hold blocks.
///
/// Every inserted block stays resolvable by hash; only the best chain is
/// resolvable by height.
pub struct MemoryChainSource {
    state: Mutex<ChainState>,
}

impl MemoryChainSource {
    /// Start a chain from `genesis`, which must have no parent.
    pub fn new(genesis: Block) -> Self {
        let mut state = ChainState::default();
        state.best.push(genesis.header.hash.clone());
        state.blocks.insert(genesis.header.hash.clone(), genesis);
        Self {
            state: Mutex::new(state),
        }
    }

    /// Make a block known without changing the best chain.
    pub fn insert(&self, block: Block) {
        let mut state = self.state.lock().unwrap();
        state.blocks.insert(block.header.hash.clone(), block);
    }

    /// Append a block on top of the current best chain.
    pub fn push(&self, block: Block) -> Result<(), IndexerError> {
        let mut state = self.state.lock().unwrap();
        let tip = state.best.last().cloned().unwrap_or_default();
        if block.prev_hash() != Some(tip.as_str()) {
            return Err(IndexerError::Other(format!(
                "block {} does not extend best tip {tip}",
                block.hash()
            )));
        }
        state.best.push(block.header.hash.clone());
        state.blocks.insert(block.header.hash.clone(), block);
        Ok(())
    }

    /// Switch the best chain to end at `hash`, as the node does on a reorg.
    pub fn set_best(&self, hash: &str) -> Result<(), IndexerError> {
        let mut state = self.state.lock().unwrap();
        let mut chain = Vec::new();
        let mut cursor = Some(hash.to_string());
        while let Some(h) = cursor {
            let block = state
                .blocks
                .get(&h)
                .ok_or_else(|| IndexerError::not_found(format!("block {h}")))?;
            cursor = block.header.prev_hash.clone();
            chain.push(h);
        }
        chain.reverse();
        state.best = chain;
        Ok(())
    }

    /// Forget a block entirely, so lookups by hash fail.
    pub fn forget(&self, hash: &str) {
        let mut state = self.state.lock().unwrap();
        state.blocks.remove(hash);
    }

    pub fn best_chain(&self) -> Vec<BlockHash> {
        self.state.lock().unwrap().best.clone()
    }
}

#[async_trait]
impl ChainSource for MemoryChainSource {
    async fn get_block(&self, at: HashOrHeight) -> Result<Block, IndexerError> {
        let state = self.state.lock().unwrap();
        let hash = match &at {
            HashOrHeight::Hash(h) => Some(h.clone()),
            HashOrHeight::Height(n) => usize::try_from(*n)
                .ok()
                .and_then(|i| state.best.get(i).cloned()),
        };
        hash.and_then(|h| state.blocks.get(&h).cloned())
            .ok_or_else(|| IndexerError::not_found(at.to_string()))
    }

    async fn get_block_header(&self, hash: &str) -> Result<BlockHeader, IndexerError> {
        let state = self.state.lock().unwrap();
        state
            .blocks
            .get(hash)
            .map(|b| b.header.clone())
            .ok_or_else(|| IndexerError::not_found(format!("header {hash}")))
    }

    async fn best_hash(&self) -> Result<BlockHash, IndexerError> {
        let state = self.state.lock().unwrap();
        state
            .best
            .last()
            .cloned()
            .ok_or_else(|| IndexerError::not_found("best block"))
    }

    async fn best_height(&self) -> Result<u64, IndexerError> {
        let state = self.state.lock().unwrap();
        Ok(state.best.len().saturating_sub(1) as u64)
    }
}
