//! Log entry type.

use serde::{Deserialize, Serialize};

/// A single entry in the replicated log.
///
/// Entries are append-only by index; a committed index never changes its
/// contents. A snapshot entry replaces every entry at or before its index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log (1-based; 0 means "before the first entry")
    pub index: u64,

    /// Term in which the entry was created
    pub term: u64,

    /// Whether this entry summarizes all state up to its index
    pub is_snapshot: bool,

    /// Opaque serialized command (or snapshot blob)
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Create a new command entry
    pub fn new(index: u64, term: u64, payload: Vec<u8>) -> Self {
        Self { index, term, is_snapshot: false, payload }
    }

    /// Create a snapshot entry replacing everything at or before `index`
    pub fn snapshot(index: u64, term: u64, payload: Vec<u8>) -> Self {
        Self { index, term, is_snapshot: true, payload }
    }
}
