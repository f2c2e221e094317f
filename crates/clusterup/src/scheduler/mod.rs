//! Workload scheduling.
//!
//! Leader-only assignment and rebalancing of monitors over the current
//! member list, driven by membership events and estimated load.

mod assignment;

pub use assignment::{AssignmentBook, TaskAssignment};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::command::ClusterCommand;
use crate::config::ClusterConfig;
use crate::events::ClusterEvent;
use crate::membership::ClusterMembership;
use crate::monitor::MonitorConfig;
use crate::proto::{ClusterRequest, ClusterResponse, RequestKind};

/// What the scheduler knows about one usable worker when planning a pass
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub id: String,
    pub tags: BTreeSet<String>,
    pub avg_cpu_load: Option<f64>,
    pub assigned: usize,
}

/// Plan one scheduling pass over immutable inputs.
///
/// Returns the replacement assignment records to replicate: overload
/// relief first, then per-monitor reassignment, already reconciled so the
/// newest record per monitor wins.
pub(crate) fn plan_pass(
    config: &ClusterConfig,
    monitors: &HashMap<Uuid, MonitorConfig>,
    book: &AssignmentBook,
    workers: &[WorkerSnapshot],
) -> Vec<TaskAssignment> {
    let mut planned: HashMap<Uuid, TaskAssignment> = HashMap::new();

    // Per-worker cost of one more task
    let cpu_per_task: HashMap<&str, f64> = workers
        .iter()
        .map(|w| {
            let ratio = match (w.avg_cpu_load, w.assigned) {
                (Some(load), assigned) if assigned > 0 => load / assigned as f64,
                _ => config.default_cpu_per_task,
            };
            (w.id.as_str(), ratio)
        })
        .collect();

    let threshold = if workers.is_empty() {
        0.0
    } else {
        workers.iter().map(|w| w.avg_cpu_load.unwrap_or(0.0)).sum::<f64>() / workers.len() as f64
    };

    // Running estimates updated as the pass hands out work
    let mut running_load: HashMap<String, f64> =
        workers.iter().map(|w| (w.id.clone(), w.avg_cpu_load.unwrap_or(0.0))).collect();
    let mut running_count: HashMap<String, usize> =
        workers.iter().map(|w| (w.id.clone(), w.assigned)).collect();

    // Overload relief: shed the cheapest-to-move (oldest) tasks of every
    // worker above the mean
    for worker in workers {
        let load = worker.avg_cpu_load.unwrap_or(0.0);
        if load <= threshold {
            continue;
        }
        let ratio = cpu_per_task[worker.id.as_str()];
        let overload_tasks = if ratio > 0.0 { ((load - threshold) / ratio).floor() as usize } else { 0 };
        if overload_tasks == 0 {
            continue;
        }

        debug!(worker = %worker.id, overload_tasks, "shedding load from worker");
        for current in book.effective_for_worker(&worker.id).into_iter().take(overload_tasks) {
            let mut remaining = current.worker_ids.clone();
            remaining.remove(&worker.id);
            let replacement = TaskAssignment::new(
                current.monitor_id,
                current.monitor_version,
                remaining,
                TaskAssignment::superseding_stamp(Some(current)),
            );
            planned.insert(current.monitor_id, replacement);
        }
    }

    // Reassignment per enabled monitor
    let mut ordered: Vec<&MonitorConfig> = monitors.values().filter(|m| m.enabled).collect();
    ordered.sort_by_key(|m| m.id);

    for monitor in ordered {
        let qualified: Vec<&WorkerSnapshot> =
            workers.iter().filter(|w| monitor.qualifies(&w.tags)).collect();

        if qualified.is_empty() {
            error!(
                monitor = %monitor.id,
                name = %monitor.name,
                required_tags = ?monitor.required_tags,
                "no qualified workers, monitor left unserved this pass"
            );
            continue;
        }

        let current = planned
            .get(&monitor.id)
            .cloned()
            .or_else(|| book.effective(&monitor.id).cloned());
        let current_workers: BTreeSet<String> =
            current.as_ref().map(|a| a.worker_ids.clone()).unwrap_or_default();

        let still_qualified: Vec<&String> = current_workers
            .iter()
            .filter(|id| qualified.iter().any(|w| &w.id == *id))
            .collect();

        // Already exactly as desired, every worker still qualified
        if current.is_some()
            && current_workers.len() == monitor.worker_count
            && still_qualified.len() == current_workers.len()
        {
            continue;
        }

        let desired = monitor.worker_count.min(qualified.len());

        let mut selected: Vec<String> = still_qualified.iter().map(|s| s.to_string()).collect();
        selected.sort_by(|a, b| {
            let key_a = (running_load.get(a).copied().unwrap_or(0.0), running_count.get(a).copied().unwrap_or(0));
            let key_b = (running_load.get(b).copied().unwrap_or(0.0), running_count.get(b).copied().unwrap_or(0));
            key_a.partial_cmp(&key_b).unwrap_or(std::cmp::Ordering::Equal)
        });
        selected.truncate(desired);

        let mut pool: Vec<&WorkerSnapshot> =
            qualified.iter().filter(|w| !selected.contains(&w.id)).copied().collect();
        pool.sort_by(|a, b| {
            let key_a = (running_load.get(&a.id).copied().unwrap_or(0.0), running_count.get(&a.id).copied().unwrap_or(0));
            let key_b = (running_load.get(&b.id).copied().unwrap_or(0.0), running_count.get(&b.id).copied().unwrap_or(0));
            key_a.partial_cmp(&key_b).unwrap_or(std::cmp::Ordering::Equal)
        });
        for worker in pool {
            if selected.len() >= desired {
                break;
            }
            selected.push(worker.id.clone());
        }

        let selected: BTreeSet<String> = selected.into_iter().collect();
        if selected == current_workers && planned.get(&monitor.id).is_none() {
            continue;
        }

        for added in selected.difference(&current_workers) {
            let ratio = cpu_per_task.get(added.as_str()).copied().unwrap_or(config.default_cpu_per_task);
            *running_load.entry(added.clone()).or_insert(0.0) += ratio;
            *running_count.entry(added.clone()).or_insert(0) += 1;
        }

        let stamp = TaskAssignment::superseding_stamp(current.as_ref());
        planned.insert(
            monitor.id,
            TaskAssignment::new(monitor.id, monitor.version, selected, stamp),
        );
    }

    let mut result: Vec<TaskAssignment> = planned.into_values().collect();
    result.sort_by_key(|a| a.created_at);
    result
}

/// Leader-only scheduler reacting to membership churn
pub struct WorkloadScheduler {
    config: ClusterConfig,
    membership: Arc<ClusterMembership>,
    monitors: Arc<RwLock<HashMap<Uuid, MonitorConfig>>>,
    assignments: Arc<RwLock<AssignmentBook>>,
}

impl WorkloadScheduler {
    pub fn new(
        membership: Arc<ClusterMembership>,
        monitors: Arc<RwLock<HashMap<Uuid, MonitorConfig>>>,
        assignments: Arc<RwLock<AssignmentBook>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: membership.config().clone(),
            membership,
            monitors,
            assignments,
        })
    }

    /// Spawn the event-driven scheduling loop.
    ///
    /// Leader changes and member removals trigger a pass immediately;
    /// additions and availability flips are debounced so churn settles
    /// first.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut events = scheduler.membership.bus().subscribe();
            let mut due: Option<Instant> = None;

            loop {
                let deadline =
                    due.unwrap_or_else(|| Instant::now() + std::time::Duration::from_secs(86_400));

                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ClusterEvent::LeaderChanged { .. })
                        | Ok(ClusterEvent::MemberRemoved(_)) => {
                            due = Some(Instant::now());
                        }
                        Ok(ClusterEvent::MemberAdded(_))
                        | Ok(ClusterEvent::MemberStatusChanged { .. }) => {
                            due = Some(Instant::now() + scheduler.config.debounce_window());
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "scheduler missed events, forcing a pass");
                            due = Some(Instant::now());
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = sleep_until(deadline), if due.is_some() => {
                        due = None;
                        if scheduler.run_pass().await == PassOutcome::NoWorkers {
                            due = Some(Instant::now() + scheduler.config.no_worker_backoff);
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("scheduler cancelled by shutdown");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Run one scheduling pass now
    pub async fn run_pass(&self) -> PassOutcome {
        if !self.membership.is_leader().await {
            return PassOutcome::NotLeader;
        }
        if self.membership.wait_until_consistent().await.is_err() {
            return PassOutcome::NotLeader;
        }

        self.refresh_metrics().await;

        let workers = self.worker_snapshots().await;
        if workers.is_empty() {
            warn!(
                backoff = ?self.config.no_worker_backoff,
                "no available workers, rescheduling pass"
            );
            return PassOutcome::NoWorkers;
        }

        let planned = {
            let monitors = self.monitors.read().await;
            let book = self.assignments.read().await;
            plan_pass(&self.config, &monitors, &book, &workers)
        };

        if planned.is_empty() {
            debug!("scheduling pass produced no changes");
            return PassOutcome::Balanced;
        }

        info!(records = planned.len(), "replicating assignment changes");
        for assignment in planned {
            match self
                .membership
                .replicate(ClusterCommand::Assign { assignment: assignment.clone() })
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(monitor = %assignment.monitor_id, "lost leadership mid-pass, stopping");
                    return PassOutcome::NotLeader;
                }
                Err(error) => {
                    warn!(monitor = %assignment.monitor_id, "failed to replicate assignment: {error}");
                }
            }
        }
        PassOutcome::Rebalanced
    }

    /// Refresh every available member's load estimate before planning
    async fn refresh_metrics(&self) {
        for member in self.membership.available_members().await {
            if member.is_local {
                continue;
            }
            let request =
                ClusterRequest::new(self.membership.local_endpoint(), RequestKind::FetchMetrics);
            match self.membership.send(&member, request).await {
                Ok(ClusterResponse::Metrics { avg_cpu_load }) => {
                    self.membership.set_member_load(&member.endpoint, avg_cpu_load).await;
                }
                Ok(other) => {
                    debug!(peer = %member.endpoint, response = ?other, "unexpected metrics response")
                }
                Err(error) => {
                    debug!(peer = %member.endpoint, "metrics fetch failed: {error}")
                }
            }
        }
    }

    async fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        let book = self.assignments.read().await;
        self.membership
            .available_members()
            .await
            .into_iter()
            .filter_map(|member| {
                let id = member.id?;
                let assigned = book.assigned_count(&id);
                Some(WorkerSnapshot {
                    id,
                    tags: member.tags,
                    avg_cpu_load: member.avg_cpu_load,
                    assigned,
                })
            })
            .collect()
    }
}

/// Result of one scheduling pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// This node does not lead; nothing was scheduled
    NotLeader,
    /// No available workers; the pass should be retried after a backoff
    NoWorkers,
    /// Everything already balanced
    Balanced,
    /// Assignment records were replicated
    Rebalanced,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str, tags: &[&str], load: Option<f64>, assigned: usize) -> WorkerSnapshot {
        WorkerSnapshot {
            id: id.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            avg_cpu_load: load,
            assigned,
        }
    }

    fn monitors_of(list: Vec<MonitorConfig>) -> HashMap<Uuid, MonitorConfig> {
        list.into_iter().map(|m| (m.id, m)).collect()
    }

    #[test]
    fn test_never_assigns_unqualified_workers() {
        let config = ClusterConfig::default();
        let monitor = MonitorConfig::new("tagged", 60, 2)
            .with_required_tag("eu")
            .with_required_tag("ipv6");
        let monitor_id = monitor.id;
        let monitors = monitors_of(vec![monitor]);
        let book = AssignmentBook::new();
        let workers = vec![
            worker("w1", &["eu", "ipv6"], Some(0.1), 0),
            worker("w2", &["eu"], Some(0.0), 0),
            worker("w3", &[], Some(0.0), 0),
        ];

        let planned = plan_pass(&config, &monitors, &book, &workers);
        assert_eq!(planned.len(), 1);
        let assignment = &planned[0];
        assert_eq!(assignment.monitor_id, monitor_id);
        assert_eq!(assignment.worker_ids.len(), 1, "only w1 qualifies");
        assert!(assignment.worker_ids.contains("w1"));
    }

    #[test]
    fn test_assigns_min_of_count_and_pool() {
        let config = ClusterConfig::default();
        let monitors = monitors_of(vec![MonitorConfig::new("wide", 60, 5)]);
        let book = AssignmentBook::new();
        let workers = vec![
            worker("w1", &[], Some(0.1), 0),
            worker("w2", &[], Some(0.2), 0),
        ];

        let planned = plan_pass(&config, &monitors, &book, &workers);
        assert_eq!(planned[0].worker_ids.len(), 2);
    }

    #[test]
    fn test_unchanged_assignment_is_skipped() {
        let config = ClusterConfig::default();
        let monitor = MonitorConfig::new("steady", 60, 1);
        let monitor_id = monitor.id;
        let monitors = monitors_of(vec![monitor]);

        let mut book = AssignmentBook::new();
        book.record(TaskAssignment::new(
            monitor_id,
            1,
            BTreeSet::from(["w1".to_string()]),
            chrono::Utc::now(),
        ));
        let workers = vec![worker("w1", &[], Some(0.1), 1)];

        let planned = plan_pass(&config, &monitors, &book, &workers);
        assert!(planned.is_empty());
    }

    #[test]
    fn test_monitor_without_qualified_pool_left_unserved() {
        let config = ClusterConfig::default();
        let monitors =
            monitors_of(vec![MonitorConfig::new("exotic", 60, 1).with_required_tag("gpu")]);
        let book = AssignmentBook::new();
        let workers = vec![worker("w1", &["eu"], Some(0.1), 0)];

        let planned = plan_pass(&config, &monitors, &book, &workers);
        assert!(planned.is_empty());
    }

    #[test]
    fn test_overloaded_worker_sheds_tasks() {
        let config = ClusterConfig::default();
        // Two monitors both already on the hot worker
        let monitor_a = MonitorConfig::new("a", 60, 1);
        let monitor_b = MonitorConfig::new("b", 60, 1);
        let (id_a, id_b) = (monitor_a.id, monitor_b.id);
        let monitors = monitors_of(vec![monitor_a, monitor_b]);

        let t0 = chrono::Utc::now() - chrono::Duration::seconds(60);
        let mut book = AssignmentBook::new();
        book.record(TaskAssignment::new(id_a, 1, BTreeSet::from(["hot".to_string()]), t0));
        book.record(TaskAssignment::new(
            id_b,
            1,
            BTreeSet::from(["hot".to_string()]),
            t0 + chrono::Duration::seconds(1),
        ));

        let workers = vec![
            worker("hot", &[], Some(0.9), 3),
            worker("cold", &[], Some(0.1), 0),
        ];

        let planned = plan_pass(&config, &monitors, &book, &workers);
        // The oldest of the hot worker's monitors moves to the cold worker
        let moved = planned.iter().find(|a| a.monitor_id == id_a).unwrap();
        assert!(moved.worker_ids.contains("cold"));
        assert!(!moved.worker_ids.contains("hot"));
        // The newer assignment stays put
        assert!(planned.iter().all(|a| a.monitor_id != id_b));
    }

    #[test]
    fn test_fills_least_loaded_workers_first() {
        let config = ClusterConfig::default();
        let monitors = monitors_of(vec![MonitorConfig::new("pick", 60, 1)]);
        let book = AssignmentBook::new();
        let workers = vec![
            worker("busy", &[], Some(0.8), 3),
            worker("idle", &[], Some(0.05), 0),
        ];

        let planned = plan_pass(&config, &monitors, &book, &workers);
        assert!(planned[0].worker_ids.contains("idle"));
    }
}
