//! Error types for ClusterUP.

use thiserror::Error;

/// Errors surfaced by the coordination core.
///
/// Range violations are programming errors and are never retried; transient
/// delivery failures are retried by the owning loops.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// An append or drop addressed an index range the log cannot accept
    #[error("invalid log range: {0}")]
    InvalidRange(String),

    /// The addressed index is already committed and immutable
    #[error("index {0} is already committed")]
    AlreadyCommitted(u64),

    /// A request could not be delivered to a member
    #[error("delivery to {endpoint} failed: {reason}")]
    DeliveryFailed { endpoint: String, reason: String },

    /// No reachable member is currently flagged leader
    #[error("no cluster leader is reachable")]
    LeaderUnavailable,

    /// A bounded wait elapsed before the operation could run
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The owning loop was cancelled by shutdown
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// Durable store failure outside the tolerated compaction path
    #[error("store error: {0}")]
    Store(String),

    /// A replicated command was rejected by the command handler
    #[error("command rejected: {0}")]
    CommandRejected(String),

    /// Payload could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
