//! Probe boundary for ClusterUP.
//!
//! The actual network checks live outside this crate; the core only
//! consumes their `(timestamp, status)` samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::monitor::MonitorConfig;

/// Health status of a monitored service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Available,
    Unavailable,
    Degraded,
    Unknown,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Available => write!(f, "available"),
            ServiceStatus::Unavailable => write!(f, "unavailable"),
            ServiceStatus::Degraded => write!(f, "degraded"),
            ServiceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// A single observed sample produced by a check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSample {
    /// When the check observed the target
    pub timestamp: DateTime<Utc>,

    /// Observed status
    pub status: ServiceStatus,
}

impl CheckSample {
    pub fn new(timestamp: DateTime<Utc>, status: ServiceStatus) -> Self {
        Self { timestamp, status }
    }
}

/// Pluggable check function invoked on a per-monitor schedule by whichever
/// node holds that monitor's assignment
#[async_trait::async_trait]
pub trait PerformCheck: Send + Sync {
    /// Perform one check against the monitor's target.
    ///
    /// `previous` is the last status this node observed, so checks that
    /// grade slow-but-alive targets can hysterese on it.
    async fn perform_check(
        &self,
        monitor: &MonitorConfig,
        previous: ServiceStatus,
    ) -> anyhow::Result<CheckSample>;
}
