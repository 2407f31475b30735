//! Index service contract and registry.

use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;

use crate::error::IndexerError;
use crate::store::{IndexStore, Operation};
use crate::types::{Block, Track};

/// Which way a block is being moved through the indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Connect the block.
    Apply,
    /// Disconnect the block.
    Undo,
}

/// Trait for pluggable secondary indexes.
///
/// `operations_for` must be deterministic given the block and the service's
/// already-committed state in `store`. Applying the `Undo` operations of a
/// block right after its `Apply` operations must leave the service's keys as
/// they were. Services must keep their keys under their own prefix.
#[async_trait]
pub trait IndexService: Send + Sync {
    /// Short name used in logs and errors (e.g. `"timestamp"`).
    fn name(&self) -> &str;

    /// Order-dependent services run on the serial track, the rest on the
    /// concurrent track.
    fn is_order_dependent(&self) -> bool;

    async fn operations_for(
        &self,
        block: &Block,
        direction: Direction,
        store: &dyn IndexStore,
    ) -> Result<Vec<Operation>, IndexerError>;
}

/// Registry of index services, split by track.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    concurrent: Vec<Arc<dyn IndexService>>,
    serial: Vec<Arc<dyn IndexService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service on the track its order dependence calls for.
    pub fn register(&mut self, service: Arc<dyn IndexService>) {
        tracing::debug!(
            service = service.name(),
            order_dependent = service.is_order_dependent(),
            "registering index service"
        );
        if service.is_order_dependent() {
            self.serial.push(service);
        } else {
            self.concurrent.push(service);
        }
    }

    pub fn with(mut self, service: Arc<dyn IndexService>) -> Self {
        self.register(service);
        self
    }

    pub fn services(&self, track: Track) -> &[Arc<dyn IndexService>] {
        match track {
            Track::Concurrent => &self.concurrent,
            Track::Serial => &self.serial,
        }
    }

    pub fn len(&self) -> usize {
        self.concurrent.len() + self.serial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collect one block's operations from every service on `track`, in
    /// registration order. Any service failure fails the whole block.
    pub async fn operations_for(
        &self,
        track: Track,
        block: &Block,
        direction: Direction,
        store: &dyn IndexStore,
    ) -> Result<Vec<Operation>, IndexerError> {
        let per_service = try_join_all(self.services(track).iter().map(|service| async move {
            service
                .operations_for(block, direction, store)
                .await
                .map_err(|e| match e {
                    e @ IndexerError::Service { .. } => e,
                    other => IndexerError::service(service.name(), other),
                })
        }))
        .await?;
        Ok(per_service.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::BlockHeader;

    struct Fixed {
        name: &'static str,
        ordered: bool,
        fail: bool,
    }

    #[async_trait]
    impl IndexService for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn is_order_dependent(&self) -> bool {
            self.ordered
        }
        async fn operations_for(
            &self,
            block: &Block,
            direction: Direction,
            _store: &dyn IndexStore,
        ) -> Result<Vec<Operation>, IndexerError> {
            if self.fail {
                return Err(IndexerError::Other("bad block".into()));
            }
            let key = format!("{}/{}", self.name, block.hash());
            Ok(match direction {
                Direction::Apply => vec![Operation::put(key, "1")],
                Direction::Undo => vec![Operation::delete(key)],
            })
        }
    }

    fn block() -> Block {
        Block {
            header: BlockHeader {
                hash: "0xa".into(),
                prev_hash: Some("0x0".into()),
                height: 1,
                timestamp: 0,
            },
            transactions: vec![],
        }
    }

    fn svc(name: &'static str, ordered: bool, fail: bool) -> Arc<dyn IndexService> {
        Arc::new(Fixed { name, ordered, fail })
    }

    #[test]
    fn register_splits_by_order_dependence() {
        let reg = ServiceRegistry::new()
            .with(svc("block", false, false))
            .with(svc("tx", false, false))
            .with(svc("timestamp", true, false));
        assert_eq!(reg.services(Track::Concurrent).len(), 2);
        assert_eq!(reg.services(Track::Serial).len(), 1);
        assert_eq!(reg.len(), 3);
    }

    #[tokio::test]
    async fn operations_concatenate_in_registration_order() {
        let reg = ServiceRegistry::new()
            .with(svc("a", false, false))
            .with(svc("b", false, false));
        let store = MemoryStore::new();
        let ops = reg
            .operations_for(Track::Concurrent, &block(), Direction::Apply, &store)
            .await
            .unwrap();
        assert_eq!(ops, vec![Operation::put("a/0xa", "1"), Operation::put("b/0xa", "1")]);
    }

    #[tokio::test]
    async fn failing_service_fails_block() {
        let reg = ServiceRegistry::new()
            .with(svc("ok", true, false))
            .with(svc("broken", true, true));
        let store = MemoryStore::new();
        let err = reg
            .operations_for(Track::Serial, &block(), Direction::Apply, &store)
            .await
            .unwrap_err();
        assert_eq!(err, IndexerError::service("broken", "bad block"));
    }
}
