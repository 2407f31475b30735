//! Shared types for the indexing engine.

use serde::{Deserialize, Serialize};

/// Block hashes are carried as their hex string form (`0x…`).
pub type BlockHash = String;

// ─── Block ────────────────────────────────────────────────────────────────────

/// Header fields the engine needs to walk and verify the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: BlockHash,
    /// `None` only for genesis.
    pub prev_hash: Option<BlockHash>,
    pub height: u64,
    /// Unix timestamp (seconds) as stated by the block.
    pub timestamp: i64,
}

/// A transaction as far as the engine is concerned: an id plus raw bytes for
/// index services that want to look inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    #[serde(default)]
    pub raw: Vec<u8>,
}

impl Transaction {
    pub fn new(txid: impl Into<String>) -> Self {
        Self {
            txid: txid.into(),
            raw: Vec::new(),
        }
    }
}

/// A full block from the chain source. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> &str {
        &self.header.hash
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn prev_hash(&self) -> Option<&str> {
        self.header.prev_hash.as_deref()
    }

    /// Returns `true` if this block sits directly on top of `tip`.
    pub fn extends(&self, tip: &ChainPointer) -> bool {
        self.height() == tip.height + 1 && self.prev_hash() == Some(tip.hash.as_str())
    }

    /// The pointer this block moves a track to once it is applied.
    pub fn pointer(&self) -> ChainPointer {
        ChainPointer::new(self.header.hash.clone(), self.header.height)
    }
}

// ─── HashOrHeight ─────────────────────────────────────────────────────────────

/// Block lookup key for [`crate::source::ChainSource::get_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashOrHeight {
    Hash(BlockHash),
    Height(u64),
}

impl From<u64> for HashOrHeight {
    fn from(height: u64) -> Self {
        Self::Height(height)
    }
}

impl From<&str> for HashOrHeight {
    fn from(hash: &str) -> Self {
        Self::Hash(hash.to_string())
    }
}

impl From<BlockHash> for HashOrHeight {
    fn from(hash: BlockHash) -> Self {
        Self::Hash(hash)
    }
}

impl std::fmt::Display for HashOrHeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hash(h) => write!(f, "block {h}"),
            Self::Height(n) => write!(f, "block at height {n}"),
        }
    }
}

// ─── ChainPointer ─────────────────────────────────────────────────────────────

/// How far an index track has been advanced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainPointer {
    pub hash: BlockHash,
    pub height: u64,
}

impl ChainPointer {
    pub fn new(hash: impl Into<BlockHash>, height: u64) -> Self {
        Self {
            hash: hash.into(),
            height,
        }
    }
}

impl std::fmt::Display for ChainPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.hash, self.height)
    }
}

// ─── Track ────────────────────────────────────────────────────────────────────

/// The two index frontiers the engine maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    /// Order-independent indexes; may commit several blocks per batch.
    Concurrent,
    /// Order-dependent indexes; one block per batch, the reported sync height.
    Serial,
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Concurrent => write!(f, "concurrent"),
            Self::Serial => write!(f, "serial"),
        }
    }
}

// ─── ReorgPlan ────────────────────────────────────────────────────────────────

/// Result of a common-ancestor search. Transient; discarded after execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgPlan {
    pub common_ancestor: BlockHash,
    pub rewind_from: BlockHash,
    /// Hashes from ancestor+1 up to the new tip, in forward order.
    pub new_chain: Vec<BlockHash>,
}

impl ReorgPlan {
    /// `true` when the old tip already sits on the new chain.
    pub fn is_fast_forward(&self) -> bool {
        self.common_ancestor == self.rewind_from
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
