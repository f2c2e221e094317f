//! Integration tests for the replicated log: compaction, snapshot
//! substitution and commit bookkeeping.

use std::sync::Arc;

use clusterup::log::{LogEntry, ReplicatedLog, SnapshotSource};
use clusterup::store::{MemoryStore, StateStore};

struct CountingSnapshots {
    built: std::sync::atomic::AtomicUsize,
}

impl CountingSnapshots {
    fn new() -> Arc<Self> {
        Arc::new(Self { built: std::sync::atomic::AtomicUsize::new(0) })
    }

    fn count(&self) -> usize {
        self.built.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SnapshotSource for CountingSnapshots {
    async fn build_snapshot(&self, through_index: u64) -> anyhow::Result<Vec<u8>> {
        self.built.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(format!("state-through-{through_index}").into_bytes())
    }
}

fn entry(index: u64, term: u64) -> LogEntry {
    LogEntry::new(index, term, format!("cmd-{index}").into_bytes())
}

async fn filled_log(entries: u64, threshold: usize) -> (Arc<ReplicatedLog>, Arc<CountingSnapshots>) {
    logger::try_init_tracing();
    let store = Arc::new(MemoryStore::new());
    let log = Arc::new(ReplicatedLog::new(store, threshold));
    let source = CountingSnapshots::new();
    log.set_snapshot_source(source.clone()).await;

    let batch: Vec<LogEntry> = (1..=entries).map(|i| entry(i, 1)).collect();
    log.append(batch, 1, false).await.unwrap();
    log.commit(None).await.unwrap();
    (log, source)
}

#[tokio::test]
async fn test_compaction_substitutes_snapshot_on_read() {
    let (log, source) = filled_log(5, 100).await;

    log.compact(3).await.unwrap();
    assert_eq!(source.count(), 1);

    // Any read at or below the compaction point yields the snapshot entry
    let entries = log.read(1, Some(5)).await.unwrap();
    assert!(entries[0].is_snapshot);
    assert_eq!(entries[0].index, 3, "snapshot tells the reader where to skip to");
    assert_eq!(entries.len(), 3, "snapshot plus entries 4 and 5");
    assert_eq!(entries[1].index, 4);

    let below = log.read(2, Some(2)).await.unwrap();
    assert_eq!(below.len(), 1);
    assert!(below[0].is_snapshot);

    // At most one snapshot per read result
    let all = log.read(1, None).await.unwrap();
    assert_eq!(all.iter().filter(|e| e.is_snapshot).count(), 1);
}

#[tokio::test]
async fn test_repeated_compaction_is_noop() {
    let (log, source) = filled_log(5, 100).await;

    log.compact(3).await.unwrap();
    let retained = log.retained_len().await;

    log.compact(3).await.unwrap();
    assert_eq!(source.count(), 1, "second compaction with the same index builds nothing");
    assert_eq!(log.retained_len().await, retained);
}

#[tokio::test]
async fn test_commit_triggers_automatic_compaction() {
    let (log, source) = filled_log(10, 5).await;

    // The commit saw the log grow past the threshold and compacted it
    assert_eq!(source.count(), 1);
    assert_eq!(log.retained_len().await, 1);
    assert_eq!(log.commit_index().await, 10);
    assert_eq!(log.highest_index().await, 10);
}

#[tokio::test]
async fn test_compacting_uncommitted_range_fails() {
    logger::try_init_tracing();
    let store = Arc::new(MemoryStore::new());
    let log = ReplicatedLog::new(store, 100);
    log.set_snapshot_source(CountingSnapshots::new()).await;

    log.append(vec![entry(1, 1), entry(2, 1)], 1, false).await.unwrap();
    log.commit(Some(1)).await.unwrap();

    assert!(log.compact(2).await.is_err());
    assert!(log.compact(1).await.is_ok());
}

#[tokio::test]
async fn test_snapshot_blob_is_persisted_to_store() {
    logger::try_init_tracing();
    let store = Arc::new(MemoryStore::new());
    let log = ReplicatedLog::new(store.clone(), 100);
    log.set_snapshot_source(CountingSnapshots::new()).await;

    log.append(vec![entry(1, 1), entry(2, 1)], 1, false).await.unwrap();
    log.commit(None).await.unwrap();
    log.compact(2).await.unwrap();

    let (through, blob) = store.load_snapshot().await.unwrap().expect("snapshot persisted");
    assert_eq!(through, 2);
    assert_eq!(blob, b"state-through-2");
}
