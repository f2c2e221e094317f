//! Durable store abstraction.
//!
//! The core does not persist anything itself; it records commit markers,
//! snapshot blobs and status history rows through this contract. Failures
//! on the compaction bookkeeping path are tolerated by callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::probe::ServiceStatus;

/// One durable row per status transition of a monitor
#[derive(Debug, Clone)]
pub struct StatusHistoryRow {
    pub monitor_id: Uuid,
    pub from: DateTime<Utc>,
    pub status: ServiceStatus,
}

/// Trait for the durable storage backend
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist the `(index, term)` marker of the latest applied commit
    async fn save_commit_marker(
        &self,
        index: u64,
        term: u64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Load the marker persisted by the previous run, if any
    async fn load_commit_marker(
        &self,
    ) -> Result<Option<(u64, u64)>, Box<dyn std::error::Error + Send + Sync>>;

    /// Store the full application-state snapshot taken at a compaction
    async fn save_snapshot(
        &self,
        through_index: u64,
        blob: Vec<u8>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Load the latest snapshot blob, if any
    async fn load_snapshot(
        &self,
    ) -> Result<Option<(u64, Vec<u8>)>, Box<dyn std::error::Error + Send + Sync>>;

    /// Append one status-history row
    async fn append_status_history(
        &self,
        row: StatusHistoryRow,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// In-memory store implementation (for testing)
#[derive(Default)]
pub struct MemoryStore {
    inner: tokio::sync::RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    commit_marker: Option<(u64, u64)>,
    snapshot: Option<(u64, Vec<u8>)>,
    history: Vec<StatusHistoryRow>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status history captured so far
    pub async fn history(&self) -> Vec<StatusHistoryRow> {
        self.inner.read().await.history.clone()
    }

    /// Latest persisted commit marker
    pub async fn commit_marker(&self) -> Option<(u64, u64)> {
        self.inner.read().await.commit_marker
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_commit_marker(
        &self,
        index: u64,
        term: u64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.inner.write().await.commit_marker = Some((index, term));
        Ok(())
    }

    async fn load_commit_marker(
        &self,
    ) -> Result<Option<(u64, u64)>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.inner.read().await.commit_marker)
    }

    async fn save_snapshot(
        &self,
        through_index: u64,
        blob: Vec<u8>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.inner.write().await.snapshot = Some((through_index, blob));
        Ok(())
    }

    async fn load_snapshot(
        &self,
    ) -> Result<Option<(u64, Vec<u8>)>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.inner.read().await.snapshot.clone())
    }

    async fn append_status_history(
        &self,
        row: StatusHistoryRow,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.inner.write().await.history.push(row);
        Ok(())
    }
}
