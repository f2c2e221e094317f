//! Replicated command log.
//!
//! An ordered, durably-backed log of opaque command entries with terms,
//! a monotonic commit index, vote bookkeeping and snapshot compaction.

mod entry;
mod replicated;

pub use entry::LogEntry;
pub use replicated::ReplicatedLog;

/// Hook invoked for every entry the log commits, in index order
#[async_trait::async_trait]
pub trait CommitHook: Send + Sync {
    /// Called under the log's exclusive lock; must not call back into the
    /// log's commit path.
    async fn entry_committed(&self, entry: &LogEntry) -> anyhow::Result<()>;
}

/// Builds the replacement entry a compaction installs.
///
/// The application layer serializes its durable state up to the given
/// index; the log wraps the blob in a snapshot entry.
#[async_trait::async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn build_snapshot(&self, through_index: u64) -> anyhow::Result<Vec<u8>>;
}
