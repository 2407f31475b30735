//! blockindex-core: block indexing and reorg-consistency engine.
//!
//! # Architecture
//!
//! ```text
//! ChainSource ──► Engine
//!                   ├── ReorgResolver      (common ancestor, rewind, fast-forward)
//!                   ├── BlockSyncPipeline  (source → concurrent groups → serial)
//!                   ├── TipTracker         (concurrent + serial tips, persisted atomically)
//!                   ├── ServiceRegistry    (pluggable IndexServices, split by track)
//!                   └── IndexStore         (memory / SQLite)
//! ```

pub mod builder;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod reorg;
pub mod service;
pub mod services;
pub mod source;
pub mod store;
pub mod tips;
pub mod track;
pub mod types;

pub use builder::EngineBuilder;
pub use config::{EngineConfig, EngineState};
pub use engine::{Engine, EngineHandle};
pub use error::IndexerError;
pub use events::{EventSink, IndexEvent};
pub use observability::{init_tracing, LogConfig};
pub use pipeline::{BlockSyncPipeline, SyncOutcome};
pub use reorg::ReorgResolver;
pub use service::{Direction, IndexService, ServiceRegistry};
pub use services::{BlockHashService, TimestampService};
pub use source::{ChainSource, MemoryChainSource};
pub use store::{IndexStore, MemoryStore, Operation};
pub use tips::TipTracker;
pub use track::{ChainTrack, IndexTrack, SyncContext};
pub use types::{Block, BlockHash, BlockHeader, ChainPointer, HashOrHeight, ReorgPlan, Track, Transaction};
