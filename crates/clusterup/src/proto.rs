//! Protocol type definitions for ClusterUP.
//!
//! This module defines the request/response envelope exchanged between
//! members. The wire transport itself is a collaborator behind the
//! [`crate::transport::Transport`] trait.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::log::LogEntry;
use crate::probe::ServiceStatus;
use crate::timeline::TimelineSegment;

/// A request sent to a cluster member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRequest {
    /// Endpoint of the requesting member
    pub requested_by: String,

    /// What is being asked
    pub kind: RequestKind,
}

impl ClusterRequest {
    pub fn new(requested_by: impl Into<String>, kind: RequestKind) -> Self {
        Self { requested_by: requested_by.into(), kind }
    }

    /// Whether a non-leader must answer this with a redirect to the leader
    pub fn leader_only(&self) -> bool {
        matches!(
            self.kind,
            RequestKind::JoinCluster { .. }
                | RequestKind::LeaveCluster { .. }
                | RequestKind::ReportServiceStatus { .. }
        )
    }
}

/// Request payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestKind {
    /// Ask to be admitted to the cluster
    JoinCluster {
        endpoint: String,
        member_id: String,
        tags: BTreeSet<String>,
    },

    /// Announce a graceful departure
    LeaveCluster { endpoint: String },

    /// Leader tells a removed or departing member to stop
    Shutdown,

    /// Leader ships log entries to a follower
    AppendEntries {
        entries: Vec<LogEntry>,
        start_index: u64,
        commit_through: u64,
    },

    /// Worker forwards its oldest not-yet-synced segment to the leader
    ReportServiceStatus {
        monitor_id: Uuid,
        segment: TimelineSegment,
    },

    /// Leader asks a worker for its earliest pending change before `before`
    FetchPendingChanges {
        monitor_id: Uuid,
        before: DateTime<Utc>,
    },

    /// Leader asks a worker what status it observed at `at`
    ServiceStatusQuery { monitor_id: Uuid, at: DateTime<Utc> },

    /// Leader samples a worker's load estimate
    FetchMetrics,
}

/// A response from a cluster member
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusterResponse {
    /// Request handled
    Ok,

    /// Join accepted by the leader
    Joined { leader_endpoint: String },

    /// Answer to a ServiceStatusQuery
    Status { status: ServiceStatus },

    /// Answer to FetchPendingChanges
    PendingChange { earliest: Option<DateTime<Utc>> },

    /// Answer to FetchMetrics
    Metrics { avg_cpu_load: Option<f64> },

    /// Addressed member is not the leader; retry against `leader_endpoint`
    Redirect { leader_endpoint: String },

    /// No leader is known, or the cluster is not yet operational
    Unavailable,

    /// Request failed on the remote member
    Error { message: String },
}
