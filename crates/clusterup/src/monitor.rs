//! Monitor configuration as the scheduler sees it.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scheduling-relevant subset of a monitor definition.
///
/// Targets, check kinds and thresholds stay with the probe layer; the
/// control plane only needs what influences assignment and timelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub id: Uuid,

    /// Bumped on every scheduling-relevant edit
    pub version: u64,

    pub name: String,

    /// Check interval in seconds
    pub interval_seconds: u64,

    /// Tags a worker must carry to be assigned this monitor; empty means
    /// any worker qualifies
    pub required_tags: BTreeSet<String>,

    /// Desired number of workers checking this monitor
    pub worker_count: usize,

    pub enabled: bool,

    /// First scheduled execution; status queries before this return Unknown
    pub first_scheduled_at: DateTime<Utc>,
}

impl MonitorConfig {
    pub fn new(name: impl Into<String>, interval_seconds: u64, worker_count: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 1,
            name: name.into(),
            interval_seconds,
            required_tags: BTreeSet::new(),
            worker_count,
            enabled: true,
            first_scheduled_at: Utc::now(),
        }
    }

    /// Require a tag on assigned workers
    pub fn with_required_tag(mut self, tag: impl Into<String>) -> Self {
        self.required_tags.insert(tag.into());
        self
    }

    /// Whether a worker carrying `tags` may be assigned this monitor
    pub fn qualifies(&self, tags: &BTreeSet<String>) -> bool {
        self.required_tags.is_subset(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualification_requires_tag_superset() {
        let monitor = MonitorConfig::new("api", 60, 3)
            .with_required_tag("eu")
            .with_required_tag("ipv6");

        let mut tags = BTreeSet::new();
        tags.insert("eu".to_string());
        assert!(!monitor.qualifies(&tags));

        tags.insert("ipv6".to_string());
        tags.insert("extra".to_string());
        assert!(monitor.qualifies(&tags));
    }

    #[test]
    fn test_no_required_tags_accepts_any_worker() {
        let monitor = MonitorConfig::new("api", 60, 1);
        assert!(monitor.qualifies(&BTreeSet::new()));
    }
}
