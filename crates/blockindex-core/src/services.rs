//! Reference index services.
//!
//! [`BlockHashService`] is order-independent and rides the concurrent track.
//! [`TimestampService`] depends on the previous block and rides the serial
//! track. Both read prior state from the store only, so the operations they
//! produce are a pure function of the block and committed state.

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::service::{Direction, IndexService};
use crate::store::{prefix_end, IndexStore, Operation};
use crate::types::{Block, BlockHash};

fn parse_i64(service: &str, bytes: &[u8]) -> Result<i64, IndexerError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| IndexerError::service(service, "corrupt integer value"))
}

fn parse_string(service: &str, bytes: Vec<u8>) -> Result<String, IndexerError> {
    String::from_utf8(bytes).map_err(|_| IndexerError::service(service, "corrupt string value"))
}

// ─── BlockHashService ─────────────────────────────────────────────────────────

/// Hash ↔ height lookup for indexed blocks.
///
/// Keys: `block/h/<hash>` → height, `block/n/<height as 16 hex digits>` → hash.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockHashService;

impl BlockHashService {
    const NAME: &'static str = "block";

    fn hash_key(hash: &str) -> Vec<u8> {
        format!("block/h/{hash}").into_bytes()
    }

    fn height_key(height: u64) -> Vec<u8> {
        format!("block/n/{height:016x}").into_bytes()
    }

    pub async fn height_of(store: &dyn IndexStore, hash: &str) -> Result<Option<u64>, IndexerError> {
        match store.get(&Self::hash_key(hash)).await? {
            Some(v) => Ok(Some(parse_i64(Self::NAME, &v)? as u64)),
            None => Ok(None),
        }
    }

    pub async fn hash_at(store: &dyn IndexStore, height: u64) -> Result<Option<BlockHash>, IndexerError> {
        match store.get(&Self::height_key(height)).await? {
            Some(v) => Ok(Some(parse_string(Self::NAME, v)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl IndexService for BlockHashService {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_order_dependent(&self) -> bool {
        false
    }

    async fn operations_for(
        &self,
        block: &Block,
        direction: Direction,
        _store: &dyn IndexStore,
    ) -> Result<Vec<Operation>, IndexerError> {
        let hash_key = Self::hash_key(block.hash());
        let height_key = Self::height_key(block.height());
        Ok(match direction {
            Direction::Apply => vec![
                Operation::put(hash_key, block.height().to_string()),
                Operation::put(height_key, block.hash()),
            ],
            Direction::Undo => vec![Operation::delete(hash_key), Operation::delete(height_key)],
        })
    }
}

// ─── TimestampService ─────────────────────────────────────────────────────────

/// Strictly increasing logical timestamps per block.
///
/// Block timestamps may go backwards; each block is assigned
/// `max(block.timestamp, last + 1)`. Keys: `ts/b/<hash>` → ts,
/// `ts/t/<ts with the sign bit flipped, 16 hex digits>` → hash, `ts/last` →
/// last assigned ts. Flipping the sign bit keeps byte order equal to numeric
/// order for negative timestamps too.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampService;

impl TimestampService {
    const NAME: &'static str = "timestamp";
    const LAST_KEY: &'static [u8] = b"ts/last";

    fn block_key(hash: &str) -> Vec<u8> {
        format!("ts/b/{hash}").into_bytes()
    }

    const TIME_PREFIX: &'static [u8] = b"ts/t/";

    fn time_key(ts: i64) -> Vec<u8> {
        format!("ts/t/{:016x}", (ts as u64) ^ (1 << 63)).into_bytes()
    }

    /// Logical timestamp assigned to `hash`, if indexed.
    pub async fn timestamp_of(store: &dyn IndexStore, hash: &str) -> Result<Option<i64>, IndexerError> {
        match store.get(&Self::block_key(hash)).await? {
            Some(v) => Ok(Some(parse_i64(Self::NAME, &v)?)),
            None => Ok(None),
        }
    }

    /// Hashes of indexed blocks with `from <= ts <= to`, oldest first.
    pub async fn blocks_between(store: &dyn IndexStore, from: i64, to: i64) -> Result<Vec<BlockHash>, IndexerError> {
        if from > to {
            return Ok(vec![]);
        }
        let end = match to.checked_add(1) {
            Some(next) => Some(Self::time_key(next)),
            None => prefix_end(Self::TIME_PREFIX),
        };
        store
            .scan_range(&Self::time_key(from), end.as_deref())
            .await?
            .into_iter()
            .map(|(_, v)| parse_string(Self::NAME, v))
            .collect()
    }
}

#[async_trait]
impl IndexService for TimestampService {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_order_dependent(&self) -> bool {
        true
    }

    async fn operations_for(
        &self,
        block: &Block,
        direction: Direction,
        store: &dyn IndexStore,
    ) -> Result<Vec<Operation>, IndexerError> {
        match direction {
            Direction::Apply => {
                let last = match store.get(Self::LAST_KEY).await? {
                    Some(v) => Some(parse_i64(Self::NAME, &v)?),
                    None => None,
                };
                let ts = match last {
                    Some(last) if block.header.timestamp <= last => last + 1,
                    _ => block.header.timestamp,
                };
                Ok(vec![
                    Operation::put(Self::block_key(block.hash()), ts.to_string()),
                    Operation::put(Self::time_key(ts), block.hash()),
                    Operation::put(Self::LAST_KEY, ts.to_string()),
                ])
            }
            Direction::Undo => {
                let ts = Self::timestamp_of(store, block.hash()).await?.ok_or_else(|| {
                    IndexerError::service(Self::NAME, format!("block {} was never indexed", block.hash()))
                })?;
                let parent_ts = match block.prev_hash() {
                    Some(prev) => Self::timestamp_of(store, prev).await?,
                    None => None,
                };
                let restore_last = match parent_ts {
                    Some(p) => Operation::put(Self::LAST_KEY, p.to_string()),
                    None => Operation::delete(Self::LAST_KEY),
                };
                Ok(vec![
                    Operation::delete(Self::block_key(block.hash())),
                    Operation::delete(Self::time_key(ts)),
                    restore_last,
                ])
            }
        }
    }
}
