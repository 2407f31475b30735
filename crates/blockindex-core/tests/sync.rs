//! Forward sync through the engine: single blocks, grouped commits,
//! backpressure and failed batches.

mod common;

use std::sync::{Arc, Mutex};

use blockindex_core::services::{BlockHashService, TimestampService};
use blockindex_core::{ChainPointer, IndexEvent, IndexerError, MemoryChainSource, MemoryStore};
use common::*;

#[tokio::test]
async fn single_block_after_genesis() {
    let g = genesis();
    let source = Arc::new(MemoryChainSource::new(g.clone()));
    let store = Arc::new(MemoryStore::new());
    let (mut engine, handle) = open(config(5, 10), source.clone(), store.clone()).await;
    let mut rx = engine.subscribe();

    let h1 = child(&g, "a", g.header.timestamp + 600);
    source.push(h1.clone()).unwrap();
    handle.notify_block(h1.clone()).unwrap();

    let tip = engine.sync().await.unwrap();
    assert_eq!(tip, ChainPointer::new(h1.hash(), 1));
    assert_eq!(engine.tips().serial(), &tip);
    assert_eq!(engine.tips().concurrent(), &tip);
    assert_eq!(
        drain(&mut rx),
        vec![add(&h1), IndexEvent::Indexed { height: 1 }, IndexEvent::Synced { height: 1 }]
    );
    assert_eq!(
        BlockHashService::height_of(store.as_ref(), h1.hash()).await.unwrap(),
        Some(1)
    );
}

#[tokio::test]
async fn add_block_events_follow_height_order() {
    let g = genesis();
    let blocks = branch(&g, "a", 12);
    let source = Arc::new(MemoryChainSource::new(g.clone()));
    push_all(&source, &blocks);
    let (mut engine, _handle) = open(config(5, 4), source.clone(), Arc::new(MemoryStore::new())).await;
    let mut rx = engine.subscribe();

    engine.sync().await.unwrap();

    let added: Vec<IndexEvent> = block_events(drain(&mut rx))
        .into_iter()
        .filter(|e| matches!(e, IndexEvent::AddBlock { .. }))
        .collect();
    assert_eq!(added, blocks.iter().map(add).collect::<Vec<_>>());
}

#[tokio::test]
async fn serial_tip_never_passes_concurrent_tip() {
    let g = genesis();
    let source = Arc::new(MemoryChainSource::new(g.clone()));
    push_all(&source, &branch(&g, "a", 17));
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(RecordingStore::new(journal.clone()));
    let (mut engine, _handle) = open(config(4, 6), source.clone(), store.clone()).await;

    engine.sync().await.unwrap();
    assert_eq!(engine.tips().serial().height, 17);

    let (mut concurrent, mut serial) = (0u64, 0u64);
    for entry in journal.lock().unwrap().iter() {
        let (track, height) = entry.split_once(' ').unwrap();
        let height: u64 = height.parse().unwrap();
        match track {
            "concurrent" => {
                assert!(height >= concurrent);
                concurrent = height;
            }
            "serial" => {
                assert_eq!(height, serial + 1, "serial commits one block at a time");
                serial = height;
            }
            _ => unreachable!(),
        }
        assert!(serial <= concurrent, "serial {serial} ahead of concurrent {concurrent}");
    }
}

#[tokio::test]
async fn failed_group_commit_keeps_concurrent_tip() {
    let g = genesis();
    let blocks = branch(&g, "a", 5);
    let source = Arc::new(MemoryChainSource::new(g.clone()));
    push_all(&source, &blocks);
    let store = Arc::new(RecordingStore::new(Arc::default()));
    store.poison(format!("block/h/{}", blocks[2].hash()));
    let (mut engine, _handle) = open(config(5, 10), source.clone(), store.clone()).await;

    let err = engine.sync().await.unwrap_err();
    assert_eq!(err, IndexerError::Storage("write rejected".into()));
    assert_eq!(engine.tips().concurrent(), &ChainPointer::new(g.hash(), 0));
    assert_eq!(engine.tips().serial(), &ChainPointer::new(g.hash(), 0));
    assert!(store.inner.is_empty(), "nothing from the group may be visible");
}

#[tokio::test]
async fn failed_serial_commit_stops_at_previous_block() {
    let g = genesis();
    let blocks = branch(&g, "a", 4);
    let source = Arc::new(MemoryChainSource::new(g.clone()));
    push_all(&source, &blocks);
    let store = Arc::new(RecordingStore::new(Arc::default()));
    store.poison(format!("ts/b/{}", blocks[2].hash()));
    let (mut engine, _handle) = open(config(2, 10), source.clone(), store.clone()).await;

    assert!(engine.sync().await.is_err());
    assert_eq!(engine.tips().serial(), &blocks[1].pointer());
    assert!(engine.tips().concurrent().height >= 2);
    assert_eq!(
        TimestampService::timestamp_of(store.as_ref(), blocks[2].hash()).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn backpressure_bounds_blocks_in_flight() {
    let g = genesis();
    let inner = MemoryChainSource::new(g.clone());
    push_all(&inner, &branch(&g, "a", 5));
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let source = Arc::new(RecordingSource::new(inner, journal.clone()));
    let store = Arc::new(RecordingStore::new(journal.clone()));
    let (mut engine, _handle) = open(config(5, 3), source.clone(), store.clone()).await;

    let tip = engine.sync().await.unwrap();
    assert_eq!(tip.height, 5);

    let journal = journal.lock().unwrap();
    let (mut fetched, mut serial) = (0usize, 0usize);
    for entry in journal.iter() {
        // height 0 is looked up at open and while reconciling, never synced
        if entry.starts_with("fetch ") && entry != "fetch 0" {
            fetched += 1;
        } else if entry.starts_with("serial ") {
            serial += 1;
        }
        assert!(fetched <= serial + 3, "{fetched} fetched with {serial} indexed");
    }
    assert_eq!(fetched, 5);

    let fourth = journal.iter().position(|e| e == "fetch 4").unwrap();
    let first_serial = journal.iter().position(|e| e == "serial 1").unwrap();
    assert!(first_serial < fourth);
}

#[tokio::test]
async fn restart_resumes_from_persisted_tips() {
    let g = genesis();
    let blocks = branch(&g, "a", 6);
    let source = Arc::new(MemoryChainSource::new(g.clone()));
    push_all(&source, &blocks[..3]);
    let store = Arc::new(MemoryStore::new());

    let (mut engine, _handle) = open(config(2, 4), source.clone(), store.clone()).await;
    engine.sync().await.unwrap();
    drop(engine);

    push_all(&source, &blocks[3..]);
    let (mut engine, _handle) = open(config(2, 4), source.clone(), store.clone()).await;
    assert_eq!(engine.tips().serial(), &blocks[2].pointer());
    let mut rx = engine.subscribe();
    engine.sync().await.unwrap();

    let added: Vec<IndexEvent> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, IndexEvent::AddBlock { .. }))
        .collect();
    assert_eq!(added, blocks[3..].iter().map(add).collect::<Vec<_>>());
}
