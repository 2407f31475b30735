//! Key-value store contract shared by the tip tracker and every index service.
//!
//! The engine never writes outside of [`IndexStore::batch`]; the store's own
//! all-or-nothing batch guarantee is the only mutual exclusion relied upon.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::IndexerError;

/// A single key-value mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Operation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Smallest key greater than every key starting with `prefix`, if any.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Trait for the persistent store behind the indexes.
///
/// Implementations include [`MemoryStore`] and the SQLite backend in
/// `blockindex-storage`.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Apply every operation atomically, in order. Either all land or none do.
    async fn batch(&self, operations: Vec<Operation>) -> Result<(), IndexerError>;

    /// Read a single key.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError>;

    /// Entries with `start <= key < end` in ascending key order. `None` means
    /// no upper bound.
    async fn scan_range(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IndexerError>;

    /// All entries whose key starts with `prefix`, in ascending key order.
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IndexerError> {
        self.scan_range(prefix, prefix_end(prefix).as_deref()).await
    }
}

// ─── In-memory store ──────────────────────────────────────────────────────────

/// In-memory store for tests and ephemeral indexers.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the full contents, for comparing index state in tests.
    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.data.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn batch(&self, operations: Vec<Operation>) -> Result<(), IndexerError> {
        // Single lock for the whole batch; readers never see half of it.
        let mut data = self.data.lock().unwrap();
        for op in operations {
            match op {
                Operation::Put { key, value } => {
                    data.insert(key, value);
                }
                Operation::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn scan_range(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IndexerError> {
        let data = self.data.lock().unwrap();
        Ok(data
            .range(start.to_vec()..)
            .take_while(|(k, _)| end.map_or(true, |end| k.as_slice() < end))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
