//! The replicated log state machine.

use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use super::{CommitHook, LogEntry, SnapshotSource};
use crate::error::ClusterError;
use crate::store::StateStore;
use crate::Result;

/// Replicated, durable-backed log of opaque command entries.
///
/// One read-write lock guards all state transitions; reads take the shared
/// side. Commits are strictly index-ordered and every committed entry is
/// handed to the registered commit hook before the next one is considered.
pub struct ReplicatedLog {
    state: RwLock<LogState>,
    commit_tx: watch::Sender<u64>,
    hook: RwLock<Option<Arc<dyn CommitHook>>>,
    snapshot_source: RwLock<Option<Arc<dyn SnapshotSource>>>,
    store: Arc<dyn StateStore>,
    compaction_threshold: usize,
}

struct LogState {
    /// Retained entries, contiguous by index; `entries[0]` may be a snapshot
    entries: Vec<LogEntry>,
    highest_index: u64,
    commit_index: u64,
    term: u64,
    voted_for: Option<String>,
}

impl LogState {
    fn first_index(&self) -> u64 {
        self.entries.first().map(|e| e.index).unwrap_or(self.highest_index + 1)
    }

    fn position_of(&self, index: u64) -> Option<usize> {
        let first = self.entries.first()?.index;
        if index < first || index > self.highest_index {
            return None;
        }
        Some((index - first) as usize)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        self.position_of(index).map(|pos| self.entries[pos].term)
    }
}

impl ReplicatedLog {
    pub fn new(store: Arc<dyn StateStore>, compaction_threshold: usize) -> Self {
        let (commit_tx, _) = watch::channel(0);
        Self {
            state: RwLock::new(LogState {
                entries: Vec::new(),
                highest_index: 0,
                commit_index: 0,
                term: 0,
                voted_for: None,
            }),
            commit_tx,
            hook: RwLock::new(None),
            snapshot_source: RwLock::new(None),
            store,
            compaction_threshold,
        }
    }

    /// Seed the term from the commit marker persisted by a previous run
    pub async fn recover(&self) {
        match self.store.load_commit_marker().await {
            Ok(Some((index, term))) => {
                let mut state = self.state.write().await;
                state.term = state.term.max(term);
                info!(index, term, "recovered commit marker");
            }
            Ok(None) => {}
            Err(error) => warn!("failed to load commit marker: {error}"),
        }
    }

    /// Register the hook applied to every committed entry
    pub async fn set_commit_hook(&self, hook: Arc<dyn CommitHook>) {
        *self.hook.write().await = Some(hook);
    }

    /// Register the snapshot builder used by compaction
    pub async fn set_snapshot_source(&self, source: Arc<dyn SnapshotSource>) {
        *self.snapshot_source.write().await = Some(source);
    }

    /// Write `entries` starting at `start_index`.
    ///
    /// Fails with [`ClusterError::AlreadyCommitted`] when `start_index`
    /// falls inside the committed range, unless `skip_committed` is set, in
    /// which case the already-committed prefix of `entries` is ignored.
    /// A snapshot entry wipes all prior entries and resets the log to its
    /// own index. Gapped appends are programming errors.
    pub async fn append(
        &self,
        entries: Vec<LogEntry>,
        start_index: u64,
        skip_committed: bool,
    ) -> Result<bool> {
        if entries.is_empty() {
            return Ok(false);
        }
        if entries[0].index != start_index {
            return Err(ClusterError::InvalidRange(format!(
                "entries start at {} but append was addressed to {}",
                entries[0].index, start_index
            )));
        }

        let mut state = self.state.write().await;

        if start_index <= state.commit_index && !skip_committed {
            return Err(ClusterError::AlreadyCommitted(start_index));
        }
        if start_index > state.highest_index + 1 {
            return Err(ClusterError::InvalidRange(format!(
                "append at {} would leave a gap after {}",
                start_index, state.highest_index
            )));
        }

        let mut appended = false;
        for entry in entries {
            if entry.is_snapshot {
                let index = entry.index;
                state.entries = vec![entry];
                state.highest_index = index;
                state.commit_index = index;
                let _ = self.commit_tx.send(index);
                debug!(index, "installed snapshot entry");
                appended = true;
                continue;
            }

            if entry.index <= state.commit_index {
                // Tolerated only under skip_committed, checked above
                continue;
            }

            // Overwrite any conflicting uncommitted suffix
            if let Some(pos) = state.position_of(entry.index) {
                state.entries.truncate(pos);
            }
            state.highest_index = entry.index;
            state.entries.push(entry);
            appended = true;
        }

        Ok(appended)
    }

    /// Commit all entries from `commit_index + 1` through `end_index`
    /// (default: the highest index), returning how many entries were
    /// committed and the term of the last one.
    ///
    /// Each committed entry is handed to the commit hook; a hook error
    /// stops the commit at the preceding entry and propagates.
    pub async fn commit(&self, end_index: Option<u64>) -> Result<(u64, u64)> {
        let hook = self.hook.read().await.clone();
        let mut state = self.state.write().await;

        let end = end_index.unwrap_or(state.highest_index).min(state.highest_index);
        let mut committed = 0u64;
        let mut last_term = state.term_at(state.commit_index).unwrap_or(0);

        while state.commit_index < end {
            let next = state.commit_index + 1;
            let pos = match state.position_of(next) {
                Some(pos) => pos,
                None => {
                    return Err(ClusterError::InvalidRange(format!(
                        "commit reached {} but the entry was compacted away",
                        next
                    )))
                }
            };
            let entry = state.entries[pos].clone();

            if let Some(hook) = &hook {
                if let Err(error) = hook.entry_committed(&entry).await {
                    let _ = self.commit_tx.send(state.commit_index);
                    return Err(ClusterError::CommandRejected(format!(
                        "commit hook failed at index {next}: {error:#}"
                    )));
                }
            }

            state.commit_index = next;
            last_term = entry.term;
            committed += 1;
        }

        let commit_index = state.commit_index;
        let over_threshold = state.entries.len() > self.compaction_threshold;
        drop(state);

        if committed > 0 {
            let _ = self.commit_tx.send(commit_index);
        }

        if over_threshold {
            debug!(commit_index, "log grew past compaction threshold");
            if let Err(error) = self.compact(commit_index).await {
                // In-memory state stays authoritative; repaired on the
                // next compaction attempt
                warn!("automatic compaction failed: {error}");
            }
        }

        Ok((committed, last_term))
    }

    /// Discard the uncommitted suffix from `start_index` onward
    pub async fn drop_from(&self, start_index: u64) -> Result<u64> {
        let mut state = self.state.write().await;
        if start_index <= state.commit_index {
            return Err(ClusterError::AlreadyCommitted(start_index));
        }
        let Some(pos) = state.position_of(start_index) else {
            return Ok(0);
        };
        let dropped = (state.entries.len() - pos) as u64;
        state.entries.truncate(pos);
        state.highest_index = start_index - 1;
        Ok(dropped)
    }

    /// Read entries in `[start_index, end_index]` (default: log head).
    ///
    /// Indices compacted into a snapshot are represented by the snapshot
    /// entry itself, which appears at most once and carries the index it
    /// summarizes so callers can skip forward.
    pub async fn read(&self, start_index: u64, end_index: Option<u64>) -> Result<Vec<LogEntry>> {
        let state = self.state.read().await;
        let end = end_index.unwrap_or(state.highest_index);

        if start_index == 0 || start_index > state.highest_index {
            return Err(ClusterError::InvalidRange(format!(
                "read at {} is outside the log (highest {})",
                start_index, state.highest_index
            )));
        }
        if end > state.highest_index {
            return Err(ClusterError::InvalidRange(format!(
                "read through {} is past the log head {}",
                end, state.highest_index
            )));
        }

        let mut result = Vec::new();
        let first = state.first_index();
        let mut cursor = start_index;

        if cursor < first {
            // Everything below `first` lives in the snapshot entry
            if let Some(snapshot) = state.entries.first().filter(|e| e.is_snapshot) {
                result.push(snapshot.clone());
                cursor = snapshot.index + 1;
            } else {
                return Err(ClusterError::InvalidRange(format!(
                    "read at {} precedes the retained log at {}",
                    cursor, first
                )));
            }
        }

        while cursor <= end {
            match state.position_of(cursor) {
                Some(pos) => result.push(state.entries[pos].clone()),
                None => break,
            }
            cursor += 1;
        }

        Ok(result)
    }

    /// Replace everything up to `end_index` with one snapshot entry.
    ///
    /// Asks the registered snapshot source for the replacement payload.
    /// Store bookkeeping failures are logged and swallowed; the in-memory
    /// log remains authoritative.
    pub async fn compact(&self, end_index: u64) -> Result<()> {
        let source = self.snapshot_source.read().await.clone();
        let Some(source) = source else {
            debug!("no snapshot source registered, skipping compaction");
            return Ok(());
        };

        {
            let state = self.state.read().await;
            if end_index > state.commit_index {
                return Err(ClusterError::InvalidRange(format!(
                    "cannot compact uncommitted index {} (commit index {})",
                    end_index, state.commit_index
                )));
            }
            // Idempotent: already summarized at or past this point
            if state
                .entries
                .first()
                .map(|e| e.is_snapshot && e.index >= end_index)
                .unwrap_or(false)
            {
                return Ok(());
            }
        }

        let blob = source
            .build_snapshot(end_index)
            .await
            .map_err(|error| ClusterError::Store(format!("snapshot build failed: {error:#}")))?;

        let mut state = self.state.write().await;
        let term = state.term_at(end_index).unwrap_or(state.term);
        let snapshot = LogEntry::snapshot(end_index, term, blob.clone());

        let keep_from = state.position_of(end_index).map(|pos| pos + 1).unwrap_or(0);
        let mut retained: Vec<LogEntry> = state.entries.split_off(keep_from);
        let dropped = state.entries.len();
        state.entries = Vec::with_capacity(retained.len() + 1);
        state.entries.push(snapshot);
        state.entries.append(&mut retained);
        info!(end_index, dropped, "compacted log");
        drop(state);

        if let Err(error) = self.store.save_snapshot(end_index, blob).await {
            warn!("failed to persist snapshot through {end_index}: {error}");
        }

        Ok(())
    }

    /// Suspend until `index` (default: the highest index right now) is
    /// committed
    pub async fn wait_for_commit(&self, index: Option<u64>) -> Result<u64> {
        let target = match index {
            Some(index) => index,
            None => self.state.read().await.highest_index,
        };
        let mut rx = self.commit_tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current >= target {
                return Ok(current);
            }
            rx.changed().await.map_err(|_| ClusterError::Cancelled)?;
        }
    }

    /// Block until the local term matches the term of the last committed
    /// entry, so leader-only reads observe everything decided so far
    pub async fn wait_until_consistent(&self) -> Result<()> {
        let mut rx = self.commit_tx.subscribe();
        loop {
            {
                let state = self.state.read().await;
                let committed_term = state.term_at(state.commit_index).unwrap_or(state.term);
                if committed_term == state.term {
                    return Ok(());
                }
            }
            rx.changed().await.map_err(|_| ClusterError::Cancelled)?;
        }
    }

    /// Start a new term, clearing the vote
    pub async fn increment_term(&self) -> u64 {
        let mut state = self.state.write().await;
        state.term += 1;
        state.voted_for = None;
        state.term
    }

    /// Adopt `term` if newer; optionally clears the vote
    pub async fn update_term(&self, term: u64, reset_vote: bool) -> u64 {
        let mut state = self.state.write().await;
        if term > state.term {
            state.term = term;
            if reset_vote {
                state.voted_for = None;
            }
        }
        state.term
    }

    /// Record a vote for `member_id` in the current term, if not yet cast
    pub async fn vote_for(&self, member_id: &str) -> bool {
        let mut state = self.state.write().await;
        match &state.voted_for {
            Some(existing) => existing == member_id,
            None => {
                state.voted_for = Some(member_id.to_string());
                true
            }
        }
    }

    /// Whether this node's current vote went to `member_id`
    pub async fn is_voted_for(&self, member_id: &str) -> bool {
        self.state.read().await.voted_for.as_deref() == Some(member_id)
    }

    pub async fn current_term(&self) -> u64 {
        self.state.read().await.term
    }

    pub async fn commit_index(&self) -> u64 {
        self.state.read().await.commit_index
    }

    pub async fn highest_index(&self) -> u64 {
        self.state.read().await.highest_index
    }

    /// Number of retained entries (snapshot entry included)
    pub async fn retained_len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    /// Next free index for a leader-side append
    pub async fn next_index(&self) -> u64 {
        self.state.read().await.highest_index + 1
    }
}
