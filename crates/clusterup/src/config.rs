//! Cluster configuration for ClusterUP.
//!
//! This module defines the timing and tuning knobs shared by the
//! coordination subsystems.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::DEFAULT_COMPACTION_THRESHOLD;

/// Configuration options for a ClusterUP node
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Endpoint this node is reachable at
    pub local_endpoint: String,

    /// Capability tags this node advertises for monitor qualification
    pub local_tags: BTreeSet<String>,

    /// Timeout for a single request to a remote member
    pub connection_timeout: Duration,

    /// Number of retained log entries above which a commit triggers compaction
    pub compaction_threshold: usize,

    /// How much synced timeline history is kept per monitor
    pub timeline_retention: Duration,

    /// Interval between retries of the per-monitor sender loop
    pub sender_retry_interval: Duration,

    /// Interval at which the leader re-broadcasts current statuses
    pub flush_interval: Duration,

    /// Backoff before re-running a scheduling pass that found no workers
    pub no_worker_backoff: Duration,

    /// Assumed CPU fraction per task for workers without assignments.
    /// Deliberately a tunable, not a derived formula.
    pub default_cpu_per_task: f64,

    /// Whether an exact half split of responders counts as Degraded
    pub degrade_on_even_split: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            local_endpoint: "127.0.0.1:7071".to_string(),
            local_tags: BTreeSet::new(),
            connection_timeout: Duration::from_secs(5),
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            timeline_retention: Duration::from_secs(60 * 60 * 24 * 7),
            sender_retry_interval: Duration::from_secs(5),
            flush_interval: Duration::from_secs(300),
            no_worker_backoff: Duration::from_secs(30),
            default_cpu_per_task: 1.0,
            degrade_on_even_split: true,
        }
    }
}

impl ClusterConfig {
    /// Create a new configuration builder
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Quiet period after a membership event before the join loop or the
    /// scheduler reacts
    pub fn debounce_window(&self) -> Duration {
        self.connection_timeout * 2
    }

    /// Upper bound on waiting for the membership mutation lock
    pub fn membership_mutation_timeout(&self) -> Duration {
        self.connection_timeout * 10
    }
}

/// Builder for ClusterConfig
#[derive(Default)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    /// Build the configuration
    pub fn build(self) -> ClusterConfig {
        self.config
    }

    /// Set the local endpoint
    pub fn local_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.local_endpoint = endpoint.into();
        self
    }

    /// Advertise a capability tag
    pub fn local_tag(mut self, tag: impl Into<String>) -> Self {
        self.config.local_tags.insert(tag.into());
        self
    }

    /// Set the connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Set the compaction threshold
    pub fn compaction_threshold(mut self, threshold: usize) -> Self {
        self.config.compaction_threshold = threshold;
        self
    }

    /// Set the timeline retention window
    pub fn timeline_retention(mut self, retention: Duration) -> Self {
        self.config.timeline_retention = retention;
        self
    }

    /// Set the sender loop retry interval
    pub fn sender_retry_interval(mut self, interval: Duration) -> Self {
        self.config.sender_retry_interval = interval;
        self
    }

    /// Set the leader flush interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    /// Set the no-worker rescheduling backoff
    pub fn no_worker_backoff(mut self, backoff: Duration) -> Self {
        self.config.no_worker_backoff = backoff;
        self
    }

    /// Set the default CPU-per-task ratio
    pub fn default_cpu_per_task(mut self, ratio: f64) -> Self {
        self.config.default_cpu_per_task = ratio;
        self
    }

    /// Set whether an even responder split degrades
    pub fn degrade_on_even_split(mut self, degrade: bool) -> Self {
        self.config.degrade_on_even_split = degrade;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = ClusterConfig::builder()
            .local_endpoint("10.0.0.1:9000")
            .connection_timeout(Duration::from_secs(2))
            .compaction_threshold(10)
            .build();

        assert_eq!(config.local_endpoint, "10.0.0.1:9000");
        assert_eq!(config.debounce_window(), Duration::from_secs(4));
        assert_eq!(config.membership_mutation_timeout(), Duration::from_secs(20));
        assert_eq!(config.compaction_threshold, 10);
    }
}
