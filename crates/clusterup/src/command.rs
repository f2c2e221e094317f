//! Replicated command set.
//!
//! Every cluster-wide decision travels the log as one of these tagged
//! commands and is applied through the registered command handler on all
//! nodes, in commit order.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::monitor::MonitorConfig;
use crate::probe::ServiceStatus;
use crate::scheduler::TaskAssignment;

/// Commands that mutate replicated cluster state.
///
/// All nodes apply these in the same order; the handler must match
/// exhaustively so new kinds cannot be silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusterCommand {
    /// Create a monitor or replace its scheduling-relevant fields
    CreateOrUpdateMonitor { monitor: MonitorConfig },

    /// Remove a monitor and stop scheduling it
    DeleteMonitor { monitor_id: Uuid },

    /// Record a task assignment (or un-assignment, as a superseding record)
    Assign { assignment: TaskAssignment },

    /// Leader's quorum decision about a monitor's status at a point in time
    UpdateServiceStatus {
        monitor_id: Uuid,
        from: DateTime<Utc>,
        status: ServiceStatus,
        /// Assignment that produced the deciding worker group, kept so
        /// stale assignment records can be pruned later
        decided_by: Option<Uuid>,
    },

    /// A member finished the join protocol
    MemberJoined {
        endpoint: String,
        member_id: String,
        tags: BTreeSet<String>,
    },

    /// A member departed (gracefully or by removal)
    MemberLeft { endpoint: String },
}

impl ClusterCommand {
    /// Serialize for a log entry payload
    pub fn to_payload(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from a log entry payload
    pub fn from_payload(payload: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Short tag for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterCommand::CreateOrUpdateMonitor { .. } => "create_or_update_monitor",
            ClusterCommand::DeleteMonitor { .. } => "delete_monitor",
            ClusterCommand::Assign { .. } => "assign",
            ClusterCommand::UpdateServiceStatus { .. } => "update_service_status",
            ClusterCommand::MemberJoined { .. } => "member_joined",
            ClusterCommand::MemberLeft { .. } => "member_left",
        }
    }
}

/// Handler invoked for every committed command.
///
/// On the leader the call happens synchronously during replication; on
/// followers it runs on the replicator's drain worker, strictly in index
/// order.
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: ClusterCommand) -> anyhow::Result<()>;

    /// Replace local applied state with a compaction snapshot blob
    async fn restore_snapshot(&self, _blob: Vec<u8>) -> anyhow::Result<()> {
        Ok(())
    }
}
