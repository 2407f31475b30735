//! Reorg resolution.
//!
//! Finds the common ancestor between a local tip and a competing head, walks
//! a track back to it one block per commit, and replays the new branch one
//! block per commit. The same code drives both tracks through [`ChainTrack`].
//!
//! A failure or a shutdown part-way leaves the track at its last committed
//! block. Running [`ReorgResolver::align_tracks`] and
//! [`ReorgResolver::plan_reorg`] again from the persisted tips picks the work
//! back up.

use std::collections::{HashSet, VecDeque};

use tokio::sync::watch;

use tracing::{debug, info, warn};

use crate::error::IndexerError;
use crate::events::IndexEvent;
use crate::service::Direction;
use crate::source::ChainSource;
use crate::track::{ChainTrack, SyncContext};
use crate::types::{BlockHash, HashOrHeight, ReorgPlan, Track};

/// Detects forks and moves tracks between branches.
pub struct ReorgResolver<'a> {
    source: &'a dyn ChainSource,
    stop: Option<&'a watch::Receiver<bool>>,
}

impl<'a> ReorgResolver<'a> {
    pub fn new(source: &'a dyn ChainSource) -> Self {
        Self { source, stop: None }
    }

    /// Check `stop` before every per-block commit. Once it reads `true`,
    /// rewinds and replays end with [`IndexerError::Aborted`].
    pub fn with_stop(mut self, stop: &'a watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn check_stop(&self, track: &dyn ChainTrack) -> Result<(), IndexerError> {
        if self.stop.map_or(false, |rx| *rx.borrow()) {
            info!(track = %track.track(), tip = %track.tip(), "shutdown requested, leaving reorg");
            return Err(IndexerError::Aborted {
                reason: "shutdown requested".into(),
            });
        }
        Ok(())
    }

    /// Walk back from `old` and `new` in lock step until one cursor lands on
    /// a hash the other has visited.
    ///
    /// The returned plan's `new_chain` runs from ancestor+1 to `new`. Fails
    /// with [`IndexerError::UnknownCommonAncestor`] if both walks run out of
    /// parents without meeting; a header the source cannot find ends that
    /// cursor's walk.
    pub async fn find_common_ancestor(&self, old: &str, new: &str) -> Result<ReorgPlan, IndexerError> {
        let unknown = || IndexerError::UnknownCommonAncestor {
            old: old.to_string(),
            new: new.to_string(),
        };

        let mut main_pos = Some(old.to_string());
        let mut fork_pos = Some(new.to_string());
        let mut main_seen: HashSet<BlockHash> = HashSet::from([old.to_string()]);
        let mut fork_seen: HashSet<BlockHash> = HashSet::from([new.to_string()]);
        let mut new_chain: VecDeque<BlockHash> = VecDeque::from([new.to_string()]);

        let ancestor = loop {
            if let Some(pos) = fork_pos.as_ref().filter(|p| main_seen.contains(*p)) {
                break pos.clone();
            }
            if let Some(pos) = main_pos.as_ref().filter(|p| fork_seen.contains(*p)) {
                break pos.clone();
            }
            if main_pos.is_none() && fork_pos.is_none() {
                warn!(old, new, "chains share no reachable ancestor");
                return Err(unknown());
            }

            if let Some(pos) = main_pos.take() {
                main_pos = self.parent_of(&pos).await?;
                if let Some(prev) = &main_pos {
                    main_seen.insert(prev.clone());
                }
            }
            if let Some(pos) = fork_pos.take() {
                fork_pos = self.parent_of(&pos).await?;
                if let Some(prev) = &fork_pos {
                    fork_seen.insert(prev.clone());
                    new_chain.push_front(prev.clone());
                }
            }
        };

        // The fork cursor may have walked past the ancestor; keep only what follows it.
        let start = new_chain
            .iter()
            .position(|h| *h == ancestor)
            .ok_or_else(unknown)?;
        let new_chain: Vec<BlockHash> = new_chain.into_iter().skip(start + 1).collect();

        debug!(old, new, ancestor = %ancestor, new_blocks = new_chain.len(), "common ancestor found");
        Ok(ReorgPlan {
            common_ancestor: ancestor,
            rewind_from: old.to_string(),
            new_chain,
        })
    }

    /// Parent hash of `hash`, or `None` at genesis or for an unknown header.
    async fn parent_of(&self, hash: &str) -> Result<Option<BlockHash>, IndexerError> {
        match self.source.get_block_header(hash).await {
            Ok(header) => Ok(header.prev_hash),
            Err(IndexerError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Undo blocks on `track`, newest first, until its tip is `ancestor`.
    /// Returns the number of blocks undone.
    pub async fn rewind_to(&self, track: &mut dyn ChainTrack, ancestor: &str) -> Result<u64, IndexerError> {
        let mut undone = 0;
        while track.tip().hash != ancestor {
            let tip = track.tip().clone();
            if tip.height == 0 {
                return Err(IndexerError::UnknownCommonAncestor {
                    old: tip.hash,
                    new: ancestor.to_string(),
                });
            }
            self.check_stop(track)?;
            let block = self.source.get_block(HashOrHeight::Hash(tip.hash.clone())).await?;
            let operations = track.operations(&block, Direction::Undo).await?;
            track.commit(operations, &block, Direction::Undo).await?;
            debug!(track = %track.track(), hash = %tip.hash, height = tip.height, "block undone");
            undone += 1;
        }
        Ok(undone)
    }

    /// Apply `hashes` to `track` in order, one commit per block.
    pub async fn fast_forward_along(
        &self,
        track: &mut dyn ChainTrack,
        hashes: &[BlockHash],
    ) -> Result<u64, IndexerError> {
        let mut applied = 0;
        for hash in hashes {
            self.check_stop(track)?;
            let block = self.source.get_block(HashOrHeight::Hash(hash.clone())).await?;
            if !block.extends(track.tip()) {
                return Err(IndexerError::Other(format!(
                    "block {hash} does not extend {} tip {}",
                    track.track(),
                    track.tip()
                )));
            }
            let operations = track.operations(&block, Direction::Apply).await?;
            track.commit(operations, &block, Direction::Apply).await?;
            debug!(track = %track.track(), hash = %hash, height = block.height(), "block replayed");
            applied += 1;
        }
        Ok(applied)
    }

    /// Bring the concurrent tip onto the serial tip.
    ///
    /// The concurrent track may run ahead of the serial one after forward
    /// sync is interrupted, or sit on another branch after a failed reorg.
    pub async fn align_tracks(&self, ctx: &mut SyncContext<'_>) -> Result<Option<ReorgPlan>, IndexerError> {
        let concurrent = ctx.tips.concurrent().clone();
        let serial = ctx.tips.serial().clone();
        if concurrent == serial {
            return Ok(None);
        }

        let plan = self.find_common_ancestor(&concurrent.hash, &serial.hash).await?;
        info!(
            concurrent = %concurrent,
            serial = %serial,
            ancestor = %plan.common_ancestor,
            "aligning concurrent tip with serial tip"
        );
        let mut track = ctx.track(Track::Concurrent);
        self.rewind_to(&mut track, &plan.common_ancestor).await?;
        self.fast_forward_along(&mut track, &plan.new_chain).await?;
        Ok(Some(plan))
    }

    /// Plan a reorg if the serial tip is no longer on the source's best chain.
    ///
    /// A tip that is merely behind the best chain needs no plan; forward sync
    /// handles it. With `fork_seen` set the height lookup is skipped and the
    /// ancestor search always runs, since forward sync already found the
    /// best chain disagreeing with the tip.
    pub async fn plan_reorg(
        &self,
        ctx: &SyncContext<'_>,
        fork_seen: bool,
    ) -> Result<Option<ReorgPlan>, IndexerError> {
        let serial = ctx.tips.serial();
        let best_hash = self.source.best_hash().await?;
        if best_hash == serial.hash {
            return Ok(None);
        }
        if !fork_seen
            && self.source.block_hash_at(serial.height).await?.as_deref() == Some(serial.hash.as_str())
        {
            return Ok(None);
        }

        warn!(tip = %serial, best = %best_hash, "local tip is off the best chain");
        let plan = self.find_common_ancestor(&serial.hash, &best_hash).await?;
        Ok(Some(plan))
    }

    /// Move both tracks onto the branch in `plan`.
    ///
    /// Undo runs serial-first and replay concurrent-first, since serial
    /// indexes may read concurrent state for the same block.
    ///
    /// A fast-forward plan only replays and emits no `Reorg` event.
    pub async fn apply_reorg(&self, ctx: &mut SyncContext<'_>, plan: &ReorgPlan) -> Result<(), IndexerError> {
        if !plan.is_fast_forward() {
            ctx.events.emit(IndexEvent::Reorg {
                common_ancestor: plan.common_ancestor.clone(),
            });
        }

        let removed = self.rewind_to(&mut ctx.track(Track::Serial), &plan.common_ancestor).await?;
        self.rewind_to(&mut ctx.track(Track::Concurrent), &plan.common_ancestor).await?;

        self.fast_forward_along(&mut ctx.track(Track::Concurrent), &plan.new_chain).await?;
        let added = self.fast_forward_along(&mut ctx.track(Track::Serial), &plan.new_chain).await?;

        info!(
            ancestor = %plan.common_ancestor,
            removed,
            added,
            tip = %ctx.tips.serial(),
            "reorg complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryChainSource;
    use crate::types::{Block, BlockHeader};

    fn block(height: u64, hash: &str, prev: Option<&str>) -> Block {
        Block {
            header: BlockHeader {
                hash: hash.into(),
                prev_hash: prev.map(Into::into),
                height,
                timestamp: height as i64 * 600,
            },
            transactions: vec![],
        }
    }

    /// g ← a1 ← a2 ← a3 ← a4 (best) and a2 ← b3 ← b4 ← b5
    fn forked() -> MemoryChainSource {
        let src = MemoryChainSource::new(block(0, "g", None));
        src.push(block(1, "a1", Some("g"))).unwrap();
        src.push(block(2, "a2", Some("a1"))).unwrap();
        src.push(block(3, "a3", Some("a2"))).unwrap();
        src.push(block(4, "a4", Some("a3"))).unwrap();
        src.insert(block(3, "b3", Some("a2")));
        src.insert(block(4, "b4", Some("b3")));
        src.insert(block(5, "b5", Some("b4")));
        src
    }

    #[tokio::test]
    async fn finds_fork_point_and_new_branch() {
        let src = forked();
        let plan = ReorgResolver::new(&src)
            .find_common_ancestor("a4", "b5")
            .await
            .unwrap();
        assert_eq!(plan.common_ancestor, "a2");
        assert_eq!(plan.rewind_from, "a4");
        assert_eq!(plan.new_chain, vec!["b3", "b4", "b5"]);
    }

    #[tokio::test]
    async fn shorter_new_branch() {
        let src = forked();
        let plan = ReorgResolver::new(&src)
            .find_common_ancestor("b5", "a3")
            .await
            .unwrap();
        assert_eq!(plan.common_ancestor, "a2");
        assert_eq!(plan.new_chain, vec!["a3"]);
    }

    #[tokio::test]
    async fn ancestor_is_old_tip_when_new_extends_it() {
        let src = forked();
        let plan = ReorgResolver::new(&src)
            .find_common_ancestor("a1", "a4")
            .await
            .unwrap();
        assert_eq!(plan.common_ancestor, "a1");
        assert!(plan.is_fast_forward());
        assert_eq!(plan.new_chain, vec!["a2", "a3", "a4"]);
    }

    #[tokio::test]
    async fn ancestor_is_new_head_when_old_is_ahead() {
        let src = forked();
        let plan = ReorgResolver::new(&src)
            .find_common_ancestor("a4", "a2")
            .await
            .unwrap();
        assert_eq!(plan.common_ancestor, "a2");
        assert!(plan.new_chain.is_empty());
    }

    #[tokio::test]
    async fn same_hash_is_its_own_ancestor() {
        let src = forked();
        let plan = ReorgResolver::new(&src)
            .find_common_ancestor("a3", "a3")
            .await
            .unwrap();
        assert_eq!(plan.common_ancestor, "a3");
        assert!(plan.new_chain.is_empty());
    }

    #[tokio::test]
    async fn disconnected_chains_have_no_ancestor() {
        let src = forked();
        src.insert(block(7, "x7", Some("x6")));
        let err = ReorgResolver::new(&src)
            .find_common_ancestor("a4", "x7")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            IndexerError::UnknownCommonAncestor {
                old: "a4".into(),
                new: "x7".into()
            }
        );
    }

    #[tokio::test]
    async fn align_plan_apply_moves_both_tracks_to_new_branch() {
        use crate::events::EventSink;
        use crate::service::ServiceRegistry;
        use crate::store::MemoryStore;
        use crate::tips::TipTracker;
        use crate::types::ChainPointer;

        let src = forked();
        let store = MemoryStore::new();
        let services = ServiceRegistry::new();
        let mut tips = TipTracker::at_genesis(ChainPointer::new("g", 0));
        let (events, mut rx) = EventSink::new(32);
        let mut ctx = SyncContext {
            source: &src,
            store: &store,
            services: &services,
            tips: &mut tips,
            events: &events,
        };
        let resolver = ReorgResolver::new(&src);
        let path: Vec<BlockHash> = vec!["a1".into(), "a2".into(), "a3".into(), "a4".into()];
        resolver
            .fast_forward_along(&mut ctx.track(Track::Concurrent), &path)
            .await
            .unwrap();
        resolver
            .fast_forward_along(&mut ctx.track(Track::Serial), &path)
            .await
            .unwrap();
        assert!(resolver.align_tracks(&mut ctx).await.unwrap().is_none());
        assert!(resolver.plan_reorg(&ctx, false).await.unwrap().is_none());

        src.set_best("b5").unwrap();
        let plan = resolver.plan_reorg(&ctx, false).await.unwrap().unwrap();
        resolver.apply_reorg(&mut ctx, &plan).await.unwrap();
        assert_eq!(plan.common_ancestor, "a2");
        assert_eq!(ctx.tips.serial(), &ChainPointer::new("b5", 5));
        assert_eq!(ctx.tips.concurrent(), &ChainPointer::new("b5", 5));

        let mut reorgs = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, IndexEvent::Reorg { .. }) {
                reorgs += 1;
            }
        }
        assert_eq!(reorgs, 1);
    }
}
