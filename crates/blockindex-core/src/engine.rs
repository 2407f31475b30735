//! The engine: one logical worker that alternates between reorg resolution
//! and forward sync.
//!
//! # Cycle
//! 1. Align the concurrent tip with the serial tip.
//! 2. If the serial tip fell off the source's best chain, emit `Reorg`,
//!    rewind both tracks to the common ancestor and replay the new branch.
//! 3. Stream forward to the best block. A fork seen mid-stream sends the
//!    cycle back to step 1.
//!
//! Exactly one of {forward sync, reorg} runs at a time. Notifications that
//! arrive meanwhile wait in the queue and are looked at once the cycle ends.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, EngineState};
use crate::error::IndexerError;
use crate::events::{EventSink, IndexEvent};
use crate::pipeline::{BlockSyncPipeline, SyncOutcome};
use crate::reorg::ReorgResolver;
use crate::service::ServiceRegistry;
use crate::source::ChainSource;
use crate::store::IndexStore;
use crate::tips::TipTracker;
use crate::track::SyncContext;
use crate::types::{Block, ChainPointer, HashOrHeight};

/// Cloneable control handle for a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    notify_tx: mpsc::Sender<Block>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    state_rx: watch::Receiver<EngineState>,
    events: EventSink,
}

impl EngineHandle {
    /// Pass on a "new best block" announcement from the chain source.
    ///
    /// The block is a hint. If the queue is full the hint is dropped; the
    /// next sync asks the source for its best block anyway.
    pub fn notify_block(&self, block: Block) -> Result<(), IndexerError> {
        match self.notify_tx.try_send(block) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(block)) => {
                debug!(hash = %block.hash(), "notification queue full, dropping hint");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(IndexerError::Aborted {
                reason: "engine stopped".into(),
            }),
        }
    }

    /// Ask the engine to stop after its current commit.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Wait until the engine reports `state`.
    pub async fn wait_for(&self, state: EngineState) -> Result<(), IndexerError> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| IndexerError::Aborted {
                reason: "engine dropped".into(),
            })
    }
}

/// The block indexing and reorg-consistency engine.
pub struct Engine {
    config: EngineConfig,
    source: Arc<dyn ChainSource>,
    store: Arc<dyn IndexStore>,
    services: ServiceRegistry,
    tips: TipTracker,
    pipeline: BlockSyncPipeline,
    events: EventSink,
    notify_rx: mpsc::Receiver<Block>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
}

impl Engine {
    /// Open the engine on top of persisted tips, or at genesis on first start.
    ///
    /// The returned handle (and its clones) is the only way to feed
    /// notifications in; once every handle is dropped, [`Engine::run`] ends.
    pub async fn open(
        config: EngineConfig,
        source: Arc<dyn ChainSource>,
        store: Arc<dyn IndexStore>,
        services: ServiceRegistry,
    ) -> Result<(Self, EngineHandle), IndexerError> {
        config.validate()?;
        let genesis = source.get_block(HashOrHeight::Height(0)).await?.pointer();
        let tips = TipTracker::load(store.as_ref(), &genesis).await?;

        let (events, _) = EventSink::new(config.event_capacity);
        let (notify_tx, notify_rx) = mpsc::channel(config.notification_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(EngineState::Idle);

        info!(
            genesis = %genesis,
            services = services.len(),
            group_size = config.concurrent_group_size,
            high_water_mark = config.high_water_mark,
            "engine opened"
        );
        let shutdown_tx = Arc::new(shutdown_tx);
        let handle = EngineHandle {
            notify_tx,
            shutdown_tx: Arc::clone(&shutdown_tx),
            state_rx: state_rx.clone(),
            events: events.clone(),
        };
        let engine = Self {
            pipeline: BlockSyncPipeline::new(&config),
            config,
            source,
            store,
            services,
            tips,
            events,
            notify_rx,
            shutdown_tx,
            shutdown_rx,
            state_tx,
            state_rx,
        };
        Ok((engine, handle))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tips(&self) -> &TipTracker {
        &self.tips
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Queue an announced block directly (when driving [`Engine::sync`] by hand).
    pub fn announce(&mut self, block: Block) {
        self.pipeline.announce(block);
    }

    /// Same as [`EngineHandle::shutdown`].
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn set_state(&self, state: EngineState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "engine state");
        }
    }

    fn stop_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Reconcile and sync forward until the serial tip matches the source's
    /// best block. Returns the serial tip.
    ///
    /// Errors leave both tips at their last committed values. A shutdown seen
    /// mid-cycle, including in the middle of a rewind, returns the serial tip
    /// with the state set to `Stopping`.
    pub async fn sync(&mut self) -> Result<ChainPointer, IndexerError> {
        let mut fork_seen = false;
        loop {
            while let Ok(block) = self.notify_rx.try_recv() {
                self.pipeline.announce(block);
            }
            if self.stop_requested() {
                self.set_state(EngineState::Stopping);
                return Ok(self.tips.serial().clone());
            }

            match self.sync_once(fork_seen).await {
                Ok(SyncOutcome::Synced(tip)) => {
                    self.set_state(EngineState::Synced);
                    return Ok(tip);
                }
                Ok(SyncOutcome::ForkDetected { height }) => {
                    debug!(height, "fork seen during forward sync, reconciling");
                    fork_seen = true;
                }
                Ok(SyncOutcome::Stopped(tip)) => {
                    self.set_state(EngineState::Stopping);
                    return Ok(tip);
                }
                Err(IndexerError::Aborted { reason }) if self.stop_requested() => {
                    debug!(%reason, "reorg interrupted by shutdown");
                    self.set_state(EngineState::Stopping);
                    return Ok(self.tips.serial().clone());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One align, reorg and forward pass.
    async fn sync_once(&mut self, fork_seen: bool) -> Result<SyncOutcome, IndexerError> {
        let mut ctx = SyncContext {
            source: self.source.as_ref(),
            store: self.store.as_ref(),
            services: &self.services,
            tips: &mut self.tips,
            events: &self.events,
        };
        let resolver = ReorgResolver::new(ctx.source).with_stop(&self.shutdown_rx);

        let state = if ctx.tips.concurrent() == ctx.tips.serial() {
            EngineState::Syncing
        } else {
            EngineState::Reorging
        };
        self.state_tx.send_replace(state);
        resolver.align_tracks(&mut ctx).await?;
        if let Some(plan) = resolver.plan_reorg(&ctx, fork_seen).await? {
            if !plan.is_fast_forward() {
                self.state_tx.send_replace(EngineState::Reorging);
            }
            resolver.apply_reorg(&mut ctx, &plan).await?;
        }

        self.state_tx.send_replace(EngineState::Syncing);
        self.pipeline.run(&mut ctx, &self.shutdown_rx).await
    }

    /// Drive the engine until shutdown or a fatal error. Returns the final
    /// state (`Stopped` or `Error`).
    pub async fn run(mut self) -> EngineState {
        loop {
            if self.stop_requested() {
                break;
            }
            if let Err(e) = self.sync().await {
                self.events.emit(IndexEvent::Error(e.clone()));
                if e.is_fatal() {
                    error!(error = %e, tip = %self.tips.serial(), "engine halted");
                    self.set_state(EngineState::Error);
                    return EngineState::Error;
                }
                warn!(error = %e, "sync attempt failed, waiting for next notification");
                self.set_state(EngineState::Idle);
            }
            if self.stop_requested() {
                break;
            }

            tokio::select! {
                maybe = self.notify_rx.recv() => match maybe {
                    Some(block) => self.pipeline.announce(block),
                    None => {
                        info!("all engine handles dropped");
                        break;
                    }
                },
                _ = self.shutdown_rx.changed() => {}
            }
        }

        self.set_state(EngineState::Stopping);
        info!(tip = %self.tips.serial(), "engine stopped");
        self.set_state(EngineState::Stopped);
        EngineState::Stopped
    }
}
