//! Forward sync from the serial tip to the chain source's best block.
//!
//! Three stages share one task:
//!
//! ```text
//! source ──► in-flight queue (≤ high_water_mark) ──► concurrent stage ──► serial stage
//!            fetch by height or take the               groups of N blocks,  one block per
//!            announced block, stop on fork             one batch per group  batch, waits for
//!                                                                           the concurrent tip
//! ```
//!
//! Grouping only amortises commit overhead for order-independent indexes;
//! nothing runs in parallel.

use std::collections::VecDeque;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::IndexerError;
use crate::events::IndexEvent;
use crate::service::Direction;
use crate::track::{ChainTrack, SyncContext};
use crate::types::{Block, BlockHash, ChainPointer, HashOrHeight, Track};

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Serial tip equals the source's best block.
    Synced(ChainPointer),
    /// A fetched block did not extend the local chain; in-flight blocks were
    /// committed and the resolver should run next.
    ForkDetected { height: u64 },
    /// Shutdown was requested between commits.
    Stopped(ChainPointer),
}

/// Forward-sync state machine. Lives as long as the engine so that an
/// announced block survives between runs.
pub struct BlockSyncPipeline {
    group_size: usize,
    high_water_mark: usize,
    /// Most recent block announced by the chain source.
    announced: Option<Block>,

    // Per-run state.
    /// Fetched but not yet serially committed, oldest first.
    in_flight: VecDeque<Block>,
    /// Leading blocks of `in_flight` already on the concurrent tip.
    grouped: usize,
    next_height: u64,
    last_hash: BlockHash,
    best_hash: BlockHash,
    source_done: bool,
    fork_at: Option<u64>,
}

impl BlockSyncPipeline {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            group_size: config.concurrent_group_size,
            high_water_mark: config.high_water_mark,
            announced: None,
            in_flight: VecDeque::new(),
            grouped: 0,
            next_height: 0,
            last_hash: BlockHash::new(),
            best_hash: BlockHash::new(),
            source_done: false,
            fork_at: None,
        }
    }

    /// Queue a block the chain source just announced. It is only a hint: it
    /// is used if it turns up at the next expected height.
    pub fn announce(&mut self, block: Block) {
        debug!(hash = %block.hash(), height = block.height(), "block announced");
        self.announced = Some(block);
    }

    /// Blocks fetched but not yet serially committed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn reset(&mut self, tip: &ChainPointer) {
        self.in_flight.clear();
        self.grouped = 0;
        self.next_height = tip.height + 1;
        self.last_hash = tip.hash.clone();
        self.best_hash = BlockHash::new();
        self.source_done = false;
        self.fork_at = None;
    }

    /// Stream blocks until the serial tip reaches the source's best block, a
    /// fork shows up, or `stop` flips to `true`.
    ///
    /// Both tips must be equal on entry. [`crate::engine::Engine::sync`] runs
    /// `align_tracks` and `apply_reorg` first to get there.
    pub async fn run(
        &mut self,
        ctx: &mut SyncContext<'_>,
        stop: &watch::Receiver<bool>,
    ) -> Result<SyncOutcome, IndexerError> {
        if ctx.tips.concurrent() != ctx.tips.serial() {
            return Err(IndexerError::Other(format!(
                "tips not aligned: concurrent {} serial {}",
                ctx.tips.concurrent(),
                ctx.tips.serial()
            )));
        }
        let start = ctx.tips.serial().clone();
        self.reset(&start);
        info!(from = start.height + 1, "forward sync starting");

        loop {
            let stopping = *stop.borrow();
            if stopping {
                info!(tip = %ctx.tips.serial(), "forward sync stopped");
                return Ok(SyncOutcome::Stopped(ctx.tips.serial().clone()));
            }

            // Source stage.
            let suspended = self.in_flight.len() >= self.high_water_mark;
            if !self.source_done && !suspended {
                match self.next_block(ctx).await? {
                    Some(block) => {
                        self.last_hash = block.hash().to_string();
                        self.next_height += 1;
                        self.in_flight.push_back(block);
                    }
                    None => self.source_done = true,
                }
            }

            // Concurrent stage. A partial group is flushed once nothing more
            // will arrive for it, either at end of stream or while the source
            // waits on backpressure.
            let pending = self.in_flight.len() - self.grouped;
            let stalled = self.source_done || self.in_flight.len() >= self.high_water_mark;
            if pending >= self.group_size || (pending > 0 && stalled) {
                self.commit_group(ctx, pending.min(self.group_size)).await?;
            }

            // Serial stage.
            let concurrent_height = ctx.tips.concurrent().height;
            let serial_ready = self.grouped > 0
                && self
                    .in_flight
                    .front()
                    .map_or(false, |front| concurrent_height >= front.height());
            if serial_ready {
                self.commit_serial(ctx).await?;
            }

            if self.source_done && self.in_flight.is_empty() {
                break;
            }
        }

        let tip = ctx.tips.serial().clone();
        match self.fork_at {
            Some(height) => Ok(SyncOutcome::ForkDetected { height }),
            None => {
                info!(tip = %tip, "synced");
                ctx.events.emit(IndexEvent::Synced { height: tip.height });
                Ok(SyncOutcome::Synced(tip))
            }
        }
    }

    /// Next block to emit, or `None` when caught up or a fork was seen.
    async fn next_block(&mut self, ctx: &SyncContext<'_>) -> Result<Option<Block>, IndexerError> {
        if self.last_hash == self.best_hash || self.best_hash.is_empty() {
            // Refresh once we reach the head we knew about; it may have moved.
            self.best_hash = ctx.source.best_hash().await?;
            if self.last_hash == self.best_hash {
                return Ok(None);
            }
        }

        let block = match self.take_announced() {
            Some(block) => block,
            None => match ctx.source.get_block(HashOrHeight::Height(self.next_height)).await {
                Ok(block) => block,
                // The best chain got shorter under us.
                Err(IndexerError::NotFound { .. }) => {
                    warn!(height = self.next_height, "best chain no longer reaches next height");
                    self.fork_at = Some(self.next_height);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            },
        };

        if block.prev_hash() != Some(self.last_hash.as_str()) {
            warn!(
                height = block.height(),
                hash = %block.hash(),
                prev = ?block.prev_hash(),
                expected = %self.last_hash,
                "fork detected"
            );
            self.fork_at = Some(block.height());
            return Ok(None);
        }
        Ok(Some(block))
    }

    fn take_announced(&mut self) -> Option<Block> {
        match &self.announced {
            Some(b) if b.height() == self.next_height => self.announced.take(),
            Some(b) if b.height() < self.next_height => {
                self.announced = None;
                None
            }
            _ => None,
        }
    }

    async fn commit_group(&mut self, ctx: &mut SyncContext<'_>, count: usize) -> Result<(), IndexerError> {
        let group: Vec<&Block> = self.in_flight.iter().skip(self.grouped).take(count).collect();
        let Some(last) = group.last() else {
            return Ok(());
        };
        let pointer = last.pointer();

        let mut operations = Vec::new();
        for block in &group {
            operations.extend(
                ctx.services
                    .operations_for(Track::Concurrent, block, Direction::Apply, ctx.store)
                    .await?,
            );
        }
        ctx.tips
            .commit(ctx.store, Track::Concurrent, operations, pointer)
            .await?;
        self.grouped += count;
        debug!(blocks = count, tip = %ctx.tips.concurrent(), "concurrent group committed");
        Ok(())
    }

    async fn commit_serial(&mut self, ctx: &mut SyncContext<'_>) -> Result<(), IndexerError> {
        let Some(block) = self.in_flight.front() else {
            return Ok(());
        };
        let mut track = ctx.track(Track::Serial);
        let operations = track.operations(block, Direction::Apply).await?;
        track.commit(operations, block, Direction::Apply).await?;

        let height = block.height();
        self.in_flight.pop_front();
        self.grouped -= 1;
        ctx.events.emit(IndexEvent::Indexed { height });
        Ok(())
    }
}
