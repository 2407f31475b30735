//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use blockindex_core::tips::{CONCURRENT_TIP_KEY, SERIAL_TIP_KEY};
use blockindex_core::{
    Block, BlockHash, BlockHashService, BlockHeader, ChainPointer, ChainSource, Engine, EngineConfig,
    EngineHandle, HashOrHeight, IndexEvent, IndexStore, IndexerError, MemoryChainSource, MemoryStore,
    Operation, ServiceRegistry, TimestampService, Transaction,
};
use tokio::sync::broadcast;

pub const GENESIS: &str = "0xgenesis";

pub fn genesis() -> Block {
    Block {
        header: BlockHeader {
            hash: GENESIS.into(),
            prev_hash: None,
            height: 0,
            timestamp: 1_500_000_000,
        },
        transactions: vec![],
    }
}

/// Child of `parent` on branch `tag`, e.g. `0xa03` for the third `a` block.
pub fn child(parent: &Block, tag: &str, timestamp: i64) -> Block {
    let height = parent.height() + 1;
    let hash = format!("0x{tag}{height:02}");
    Block {
        header: BlockHeader {
            hash: hash.clone(),
            prev_hash: Some(parent.hash().to_string()),
            height,
            timestamp,
        },
        transactions: vec![Transaction::new(format!("{hash}-coinbase"))],
    }
}

/// `count` blocks on top of `parent`, ten minutes apart.
pub fn branch(parent: &Block, tag: &str, count: usize) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count);
    let mut prev = parent.clone();
    for _ in 0..count {
        let b = child(&prev, tag, prev.header.timestamp + 600);
        blocks.push(b.clone());
        prev = b;
    }
    blocks
}

pub fn push_all(source: &MemoryChainSource, blocks: &[Block]) {
    for b in blocks {
        source.push(b.clone()).unwrap();
    }
}

pub fn insert_all(source: &MemoryChainSource, blocks: &[Block]) {
    for b in blocks {
        source.insert(b.clone());
    }
}

pub fn services() -> ServiceRegistry {
    ServiceRegistry::new()
        .with(Arc::new(BlockHashService))
        .with(Arc::new(TimestampService))
}

pub fn config(group_size: usize, high_water_mark: usize) -> EngineConfig {
    EngineConfig {
        concurrent_group_size: group_size,
        high_water_mark,
        ..Default::default()
    }
}

pub async fn open(
    config: EngineConfig,
    source: Arc<dyn ChainSource>,
    store: Arc<dyn IndexStore>,
) -> (Engine, EngineHandle) {
    Engine::open(config, source, store, services()).await.unwrap()
}

pub fn drain(rx: &mut broadcast::Receiver<IndexEvent>) -> Vec<IndexEvent> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

/// Events without the per-height `Indexed` noise.
pub fn block_events(events: Vec<IndexEvent>) -> Vec<IndexEvent> {
    events
        .into_iter()
        .filter(|e| !matches!(e, IndexEvent::Indexed { .. }))
        .collect()
}

pub fn add(b: &Block) -> IndexEvent {
    IndexEvent::AddBlock {
        hash: b.hash().to_string(),
        height: b.height(),
    }
}

pub fn remove(b: &Block) -> IndexEvent {
    IndexEvent::RemoveBlock {
        hash: b.hash().to_string(),
        height: b.height(),
    }
}

// ─── Recording / failing wrappers ────────────────────────────────────────────

/// Shared, ordered log of what the source and store were asked to do.
pub type Journal = Arc<Mutex<Vec<String>>>;

/// Store that journals tip moves and can reject batches touching given keys.
pub struct RecordingStore {
    pub inner: MemoryStore,
    pub journal: Journal,
    poisoned: Mutex<HashSet<Vec<u8>>>,
}

impl RecordingStore {
    pub fn new(journal: Journal) -> Self {
        Self {
            inner: MemoryStore::new(),
            journal,
            poisoned: Mutex::new(HashSet::new()),
        }
    }

    /// Fail every batch that writes `key`.
    pub fn poison(&self, key: impl Into<Vec<u8>>) {
        self.poisoned.lock().unwrap().insert(key.into());
    }

    pub fn heal(&self) {
        self.poisoned.lock().unwrap().clear();
    }
}

#[async_trait]
impl IndexStore for RecordingStore {
    async fn batch(&self, operations: Vec<Operation>) -> Result<(), IndexerError> {
        {
            let poisoned = self.poisoned.lock().unwrap();
            if operations.iter().any(|op| poisoned.contains(op.key())) {
                return Err(IndexerError::Storage("write rejected".into()));
            }
        }
        let mut entries = Vec::new();
        for op in &operations {
            if let Operation::Put { key, value } = op {
                let track = if key.as_slice() == CONCURRENT_TIP_KEY {
                    "concurrent"
                } else if key.as_slice() == SERIAL_TIP_KEY {
                    "serial"
                } else {
                    continue;
                };
                let tip: ChainPointer = serde_json::from_slice(value).unwrap();
                entries.push(format!("{track} {}", tip.height));
            }
        }
        self.inner.batch(operations).await?;
        self.journal.lock().unwrap().extend(entries);
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError> {
        self.inner.get(key).await
    }

    async fn scan_range(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IndexerError> {
        self.inner.scan_range(start, end).await
    }
}

/// Source that journals height fetches and can simulate an outage.
pub struct RecordingSource {
    pub inner: MemoryChainSource,
    pub journal: Journal,
    pub offline: AtomicBool,
}

impl RecordingSource {
    pub fn new(inner: MemoryChainSource, journal: Journal) -> Self {
        Self {
            inner,
            journal,
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), IndexerError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(IndexerError::ChainSource("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for RecordingSource {
    async fn get_block(&self, at: HashOrHeight) -> Result<Block, IndexerError> {
        self.check()?;
        if let HashOrHeight::Height(n) = &at {
            self.journal.lock().unwrap().push(format!("fetch {n}"));
        }
        self.inner.get_block(at).await
    }

    async fn get_block_header(&self, hash: &str) -> Result<BlockHeader, IndexerError> {
        self.check()?;
        self.inner.get_block_header(hash).await
    }

    async fn best_hash(&self) -> Result<BlockHash, IndexerError> {
        self.check()?;
        self.inner.best_hash().await
    }

    async fn best_height(&self) -> Result<u64, IndexerError> {
        self.check()?;
        self.inner.best_height().await
    }
}
