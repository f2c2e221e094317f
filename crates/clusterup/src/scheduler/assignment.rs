//! Task assignment records.
//!
//! Assignments are append-only: a monitor's effective assignment is the
//! record with the greatest creation time, and superseding records must be
//! stamped strictly later than what they replace.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One assignment of a monitor to a set of workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub id: Uuid,

    pub monitor_id: Uuid,

    /// Monitor version the assignment was computed against
    pub monitor_version: u64,

    /// Member ids responsible for checking the monitor; empty means the
    /// monitor is currently unserved
    pub worker_ids: BTreeSet<String>,

    pub created_at: DateTime<Utc>,
}

impl TaskAssignment {
    pub fn new(
        monitor_id: Uuid,
        monitor_version: u64,
        worker_ids: BTreeSet<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self { id: Uuid::new_v4(), monitor_id, monitor_version, worker_ids, created_at }
    }

    /// Stamp for a record superseding `previous`: now, but always strictly
    /// after what it replaces
    pub fn superseding_stamp(previous: Option<&TaskAssignment>) -> DateTime<Utc> {
        let now = Utc::now();
        match previous {
            Some(prev) if now <= prev.created_at => prev.created_at + Duration::milliseconds(1),
            _ => now,
        }
    }
}

/// Append-only book of assignment records
#[derive(Debug, Default)]
pub struct AssignmentBook {
    by_monitor: HashMap<Uuid, Vec<TaskAssignment>>,
}

impl AssignmentBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an assignment, keeping each monitor's history ordered by
    /// creation time
    pub fn record(&mut self, assignment: TaskAssignment) {
        let history = self.by_monitor.entry(assignment.monitor_id).or_default();
        let pos = history
            .binary_search_by_key(&assignment.created_at, |a| a.created_at)
            .unwrap_or_else(|pos| pos);
        history.insert(pos, assignment);
    }

    /// The effective assignment: greatest creation time for the monitor
    pub fn effective(&self, monitor_id: &Uuid) -> Option<&TaskAssignment> {
        self.by_monitor.get(monitor_id).and_then(|h| h.last())
    }

    /// The assignment that was effective at `at` (greatest `created_at`
    /// not after `at`)
    pub fn effective_at(&self, monitor_id: &Uuid, at: DateTime<Utc>) -> Option<&TaskAssignment> {
        self.by_monitor
            .get(monitor_id)?
            .iter()
            .rev()
            .find(|a| a.created_at <= at)
    }

    /// The newest assignment strictly older than `than`; fallback target
    /// when a decision group cannot reach quorum
    pub fn previous(&self, monitor_id: &Uuid, than: &TaskAssignment) -> Option<&TaskAssignment> {
        self.by_monitor
            .get(monitor_id)?
            .iter()
            .rev()
            .find(|a| a.created_at < than.created_at)
    }

    /// Every worker that ever held an assignment for the monitor
    pub fn workers_ever_assigned(&self, monitor_id: &Uuid) -> BTreeSet<String> {
        self.by_monitor
            .get(monitor_id)
            .map(|history| {
                history.iter().flat_map(|a| a.worker_ids.iter().cloned()).collect()
            })
            .unwrap_or_default()
    }

    /// Monitors whose effective assignment includes `worker_id`, ordered
    /// ascending by the assignment's creation time
    pub fn effective_for_worker(&self, worker_id: &str) -> Vec<&TaskAssignment> {
        let mut current: Vec<&TaskAssignment> = self
            .by_monitor
            .values()
            .filter_map(|history| history.last())
            .filter(|a| a.worker_ids.contains(worker_id))
            .collect();
        current.sort_by_key(|a| a.created_at);
        current
    }

    /// Number of monitors currently assigned to `worker_id`
    pub fn assigned_count(&self, worker_id: &str) -> usize {
        self.by_monitor
            .values()
            .filter_map(|history| history.last())
            .filter(|a| a.worker_ids.contains(worker_id))
            .count()
    }

    /// Drop records for the monitor strictly older than `assignment_id`,
    /// once a decision proved they are no longer needed
    pub fn prune_superseded(&mut self, monitor_id: &Uuid, assignment_id: &Uuid) {
        let Some(history) = self.by_monitor.get_mut(monitor_id) else {
            return;
        };
        let Some(pos) = history.iter().position(|a| &a.id == assignment_id) else {
            return;
        };
        history.drain(..pos);
    }

    /// Drop a monitor's history entirely
    pub fn forget_monitor(&mut self, monitor_id: &Uuid) {
        self.by_monitor.remove(monitor_id);
    }

    pub fn monitors(&self) -> Vec<Uuid> {
        self.by_monitor.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(monitor: Uuid, workers: &[&str], at: DateTime<Utc>) -> TaskAssignment {
        TaskAssignment::new(
            monitor,
            1,
            workers.iter().map(|w| w.to_string()).collect(),
            at,
        )
    }

    #[test]
    fn test_effective_is_latest_record() {
        let monitor = Uuid::new_v4();
        let mut book = AssignmentBook::new();
        let t0 = Utc::now();

        book.record(assignment(monitor, &["a"], t0));
        book.record(assignment(monitor, &["b"], t0 + Duration::seconds(5)));

        let effective = book.effective(&monitor).unwrap();
        assert!(effective.worker_ids.contains("b"));
        assert_eq!(book.workers_ever_assigned(&monitor).len(), 2);
    }

    #[test]
    fn test_effective_at_respects_time() {
        let monitor = Uuid::new_v4();
        let mut book = AssignmentBook::new();
        let t0 = Utc::now();

        book.record(assignment(monitor, &["a"], t0));
        book.record(assignment(monitor, &["b"], t0 + Duration::seconds(10)));

        let at = book.effective_at(&monitor, t0 + Duration::seconds(5)).unwrap();
        assert!(at.worker_ids.contains("a"));
        assert!(book.effective_at(&monitor, t0 - Duration::seconds(1)).is_none());
    }

    #[test]
    fn test_superseding_stamp_is_strictly_greater() {
        let monitor = Uuid::new_v4();
        let future = Utc::now() + Duration::seconds(60);
        let prev = assignment(monitor, &["a"], future);

        let stamp = TaskAssignment::superseding_stamp(Some(&prev));
        assert!(stamp > prev.created_at);
    }

    #[test]
    fn test_prune_superseded_keeps_decided_record() {
        let monitor = Uuid::new_v4();
        let mut book = AssignmentBook::new();
        let t0 = Utc::now();

        book.record(assignment(monitor, &["a"], t0));
        let kept = assignment(monitor, &["b"], t0 + Duration::seconds(1));
        let kept_id = kept.id;
        book.record(kept);
        book.record(assignment(monitor, &["c"], t0 + Duration::seconds(2)));

        book.prune_superseded(&monitor, &kept_id);
        assert!(book.effective_at(&monitor, t0).is_none());
        assert!(book.effective(&monitor).unwrap().worker_ids.contains("c"));
    }
}
