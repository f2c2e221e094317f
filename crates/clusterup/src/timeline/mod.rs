//! Distributed status timelines.
//!
//! Reconciles independently-observed health samples into one
//! quorum-decided history per monitor: workers buffer samples locally and
//! forward them to the leader, the leader queries the assigned worker
//! group and replicates its decision, and every node applies the decision
//! to its synced timeline.

mod segment;

pub use segment::{Timeline, TimelineSegment};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::ClusterCommand;
use crate::config::ClusterConfig;
use crate::events::ClusterEvent;
use crate::membership::{Availability, ClusterMembership, RequestHandler};
use crate::monitor::MonitorConfig;
use crate::probe::{CheckSample, ServiceStatus};
use crate::proto::{ClusterRequest, ClusterResponse, RequestKind};
use crate::scheduler::{AssignmentBook, TaskAssignment};
use crate::store::{StateStore, StatusHistoryRow};
use crate::Result;

/// Decide a status from the non-unknown responses of a queried group.
///
/// All-unavailable means down; any not-available degrades, except that an
/// exact half split may be tuned to stay available.
pub(crate) fn decide(known: &[ServiceStatus], degrade_on_even_split: bool) -> ServiceStatus {
    if known.is_empty() {
        return ServiceStatus::Unknown;
    }
    if known.iter().all(|s| *s == ServiceStatus::Unavailable) {
        return ServiceStatus::Unavailable;
    }
    let not_available = known.iter().filter(|s| **s != ServiceStatus::Available).count();
    if not_available == 0 {
        return ServiceStatus::Available;
    }
    if not_available * 2 == known.len() && !degrade_on_even_split {
        return ServiceStatus::Available;
    }
    ServiceStatus::Degraded
}

/// Coordinates local status buffers, the leader's decision protocol and
/// the replicated apply path
pub struct StatusTimelineCoordinator {
    config: ClusterConfig,
    membership: Arc<ClusterMembership>,
    monitors: Arc<RwLock<HashMap<Uuid, MonitorConfig>>>,
    assignments: Arc<RwLock<AssignmentBook>>,
    store: Arc<dyn StateStore>,
    /// This node's own observations, possibly ahead of consensus
    local: RwLock<HashMap<Uuid, Arc<Mutex<Timeline>>>>,
    /// Quorum-decided history, identical on every node
    synced: RwLock<HashMap<Uuid, Arc<Mutex<Timeline>>>>,
    /// Monitors with a sender loop currently running
    sender_active: Mutex<HashSet<Uuid>>,
    /// Single-flight guard for the decision protocol; std mutex so the
    /// slot is released even when a caller drops the decision mid-flight
    inflight: std::sync::Mutex<HashSet<(Uuid, DateTime<Utc>)>>,
}

/// Releases a decision slot on drop, cancellation included
struct InflightGuard<'a> {
    slots: &'a std::sync::Mutex<HashSet<(Uuid, DateTime<Utc>)>>,
    key: (Uuid, DateTime<Utc>),
}

impl<'a> InflightGuard<'a> {
    fn acquire(
        slots: &'a std::sync::Mutex<HashSet<(Uuid, DateTime<Utc>)>>,
        key: (Uuid, DateTime<Utc>),
    ) -> Option<Self> {
        let mut held = slots.lock().expect("inflight set poisoned");
        if !held.insert(key) {
            return None;
        }
        Some(Self { slots, key })
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut held) = self.slots.lock() {
            held.remove(&self.key);
        }
    }
}

impl StatusTimelineCoordinator {
    pub fn new(
        membership: Arc<ClusterMembership>,
        monitors: Arc<RwLock<HashMap<Uuid, MonitorConfig>>>,
        assignments: Arc<RwLock<AssignmentBook>>,
        store: Arc<dyn StateStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: membership.config().clone(),
            membership,
            monitors,
            assignments,
            store,
            local: RwLock::new(HashMap::new()),
            synced: RwLock::new(HashMap::new()),
            sender_active: Mutex::new(HashSet::new()),
            inflight: std::sync::Mutex::new(HashSet::new()),
        })
    }

    /// Spawn the flush loop: on disruptive cluster events the leader
    /// re-broadcasts current statuses (debounced), and re-arms itself on a
    /// fixed interval to bound staleness
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut events = coordinator.membership.bus().subscribe();
            let mut due: Option<Instant> = None;

            loop {
                let deadline = due.unwrap_or_else(|| {
                    Instant::now() + coordinator.config.flush_interval
                });

                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ClusterEvent::LeaderChanged { .. })
                        | Ok(ClusterEvent::MemberRemoved(_)) => {
                            due = Some(Instant::now() + coordinator.config.debounce_window());
                        }
                        Ok(ClusterEvent::MemberStatusChanged { availability, .. })
                            if availability != Availability::Available =>
                        {
                            due = Some(Instant::now() + coordinator.config.debounce_window());
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "flush loop missed events, flushing");
                            due = Some(Instant::now());
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = sleep_until(deadline) => {
                        due = None;
                        coordinator.flush().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("flush loop cancelled by shutdown");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Record one check sample into the local buffer; on a status change,
    /// make sure a sender loop is forwarding it to the leader
    pub async fn add_local_result(self: &Arc<Self>, monitor_id: Uuid, sample: CheckSample) {
        let timeline = self.local_timeline(monitor_id).await;
        let changed = {
            let mut timeline = timeline.lock().await;
            timeline.record(sample.timestamp, sample.status)
        };

        if changed {
            debug!(monitor = %monitor_id, status = %sample.status, "local status changed");
            self.spawn_sender(monitor_id).await;
        }
    }

    /// Read a monitor's status at `at` against the local buffer (always at
    /// least as current as the synced timeline)
    pub async fn get_service_status(&self, monitor_id: Uuid, at: DateTime<Utc>) -> ServiceStatus {
        if let Some(monitor) = self.monitors.read().await.get(&monitor_id) {
            if at < monitor.first_scheduled_at {
                return ServiceStatus::Unknown;
            }
        }

        if let Some(timeline) = self.local.read().await.get(&monitor_id) {
            if let Some(status) = timeline.lock().await.status_at(at) {
                return status;
            }
        }
        if let Some(timeline) = self.synced.read().await.get(&monitor_id) {
            if let Some(status) = timeline.lock().await.status_at(at) {
                return status;
            }
        }
        ServiceStatus::Unknown
    }

    /// Leader decision protocol for `(monitor, at)`, single-flight per
    /// pair.
    ///
    /// Older pending changes anywhere in the assigned group are resolved
    /// first, oldest-first, through an explicit worklist.
    pub async fn determine_status(&self, monitor_id: Uuid, at: DateTime<Utc>) -> Result<ServiceStatus> {
        // Leader-only operation: observe everything committed so far
        self.membership.wait_until_consistent().await?;

        let Some(_guard) = InflightGuard::acquire(&self.inflight, (monitor_id, at)) else {
            debug!(monitor = %monitor_id, "decision already in flight");
            return Ok(ServiceStatus::Unknown);
        };

        self.determine_status_inner(monitor_id, at).await
    }

    async fn determine_status_inner(
        &self,
        monitor_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<ServiceStatus> {
        let mut last = ServiceStatus::Unknown;
        let mut worklist = vec![at];
        let mut attempted: HashSet<DateTime<Utc>> = HashSet::new();

        while let Some(target) = worklist.last().copied() {
            if !self.membership.is_leader().await {
                debug!(monitor = %monitor_id, "lost leadership, abandoning decision");
                return Ok(ServiceStatus::Unknown);
            }

            if self.synced_covers(monitor_id, target).await {
                worklist.pop();
                continue;
            }

            // Gap-fill: any worker holding an older pending change gets
            // that change resolved first
            if let Some(earlier) = self.earliest_pending_change(monitor_id, target).await {
                if earlier < target && !attempted.contains(&earlier) {
                    debug!(monitor = %monitor_id, %earlier, "resolving older pending change first");
                    worklist.push(earlier);
                    continue;
                }
            }

            attempted.insert(target);
            last = self.decide_at(monitor_id, target).await?;
            worklist.pop();
        }

        Ok(last)
    }

    /// Ask every worker ever assigned to the monitor for its earliest
    /// pending change before `before`
    async fn earliest_pending_change(
        &self,
        monitor_id: Uuid,
        before: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let workers = self.assignments.read().await.workers_ever_assigned(&monitor_id);
        let mut earliest: Option<DateTime<Utc>> = None;

        for worker_id in workers {
            let Some(member) = self.membership.member_by_id(&worker_id).await else {
                continue;
            };
            let request = ClusterRequest::new(
                self.membership.local_endpoint(),
                RequestKind::FetchPendingChanges { monitor_id, before },
            );
            match self.membership.send(&member, request).await {
                Ok(ClusterResponse::PendingChange { earliest: Some(found) }) => {
                    earliest = Some(earliest.map_or(found, |e| e.min(found)));
                }
                Ok(_) => {}
                Err(error) => {
                    debug!(peer = %member.endpoint, "pending-change fetch failed: {error}")
                }
            }
        }

        earliest
    }

    /// Query the assignment group effective at `at` and replicate a
    /// quorum decision, falling back to older groups when quorum fails
    async fn decide_at(&self, monitor_id: Uuid, at: DateTime<Utc>) -> Result<ServiceStatus> {
        let mut assignment = self.assignments.read().await.effective_at(&monitor_id, at).cloned();

        while let Some(group) = assignment {
            if !self.membership.is_leader().await {
                return Ok(ServiceStatus::Unknown);
            }

            let responses = self.query_group(&group, monitor_id, at).await;
            let known: Vec<ServiceStatus> =
                responses.into_iter().filter(|s| *s != ServiceStatus::Unknown).collect();

            if known.len() * 2 > group.worker_ids.len() {
                let status = decide(&known, self.config.degrade_on_even_split);
                info!(
                    monitor = %monitor_id, %at, %status,
                    responses = known.len(), group = group.worker_ids.len(),
                    "quorum decision reached"
                );
                self.membership
                    .replicate(ClusterCommand::UpdateServiceStatus {
                        monitor_id,
                        from: at,
                        status,
                        decided_by: Some(group.id),
                    })
                    .await?;
                return Ok(status);
            }

            debug!(
                monitor = %monitor_id,
                responses = known.len(), group = group.worker_ids.len(),
                "no quorum, falling back to previous assignment"
            );
            assignment = self.assignments.read().await.previous(&monitor_id, &group).cloned();
        }

        // Postponed, not an error; a later trigger may succeed
        debug!(monitor = %monitor_id, %at, "no assignment group reached quorum");
        Ok(ServiceStatus::Unknown)
    }

    /// Query each worker of one assignment group; left or unreachable
    /// workers count as no-data
    async fn query_group(
        &self,
        group: &TaskAssignment,
        monitor_id: Uuid,
        at: DateTime<Utc>,
    ) -> Vec<ServiceStatus> {
        let mut responses = Vec::new();

        for worker_id in &group.worker_ids {
            let Some(member) = self.membership.member_by_id(worker_id).await else {
                continue;
            };

            let request = ClusterRequest::new(
                self.membership.local_endpoint(),
                RequestKind::ServiceStatusQuery { monitor_id, at },
            );

            let mut attempts = 0;
            loop {
                attempts += 1;
                match self.membership.send(&member, request.clone()).await {
                    Ok(ClusterResponse::Status { status }) => {
                        responses.push(status);
                        break;
                    }
                    Ok(other) => {
                        debug!(peer = %member.endpoint, response = ?other, "unexpected status reply");
                        break;
                    }
                    Err(error) => {
                        let still_reachable = self
                            .membership
                            .member_by_id(worker_id)
                            .await
                            .map(|m| m.availability != Availability::Unavailable)
                            .unwrap_or(false);
                        if !still_reachable || attempts >= 3 {
                            debug!(peer = %member.endpoint, "worker treated as no-data: {error}");
                            break;
                        }
                        sleep(self.config.sender_retry_interval).await;
                    }
                }
            }
        }

        responses
    }

    /// Apply a replicated status decision on this node
    pub async fn handle_status_update(
        &self,
        monitor_id: Uuid,
        from: DateTime<Utc>,
        status: ServiceStatus,
        decided_by: Option<Uuid>,
    ) {
        let synced = self.synced_timeline(monitor_id).await;
        let synced_until = {
            let mut timeline = synced.lock().await;
            timeline.record(from, status);
            timeline.trim_retention(Utc::now() - chrono_retention(&self.config));
            timeline.until()
        };

        // Push the authoritative segment into a stale local buffer; the
        // boundary keeps future local deviations detectable
        if let Some(local) = self.local.read().await.get(&monitor_id) {
            let mut local = local.lock().await;
            if local.until().map_or(true, |until| until < from) {
                local.record(from, status);
            }
            if let Some(mark) = synced_until {
                local.truncate_before(mark);
            }
        }

        if let Some(assignment_id) = decided_by {
            self.assignments.write().await.prune_superseded(&monitor_id, &assignment_id);
        }

        let row = StatusHistoryRow { monitor_id, from, status };
        if let Err(error) = self.store.append_status_history(row).await {
            warn!(monitor = %monitor_id, "failed to persist status history: {error}");
        }
    }

    /// Drop all timeline state for a deleted monitor
    pub async fn forget_monitor(&self, monitor_id: &Uuid) {
        self.local.write().await.remove(monitor_id);
        self.synced.write().await.remove(monitor_id);
    }

    /// Leader re-replicates its current status for every monitor
    pub async fn flush(&self) {
        if !self.membership.is_leader().await {
            return;
        }

        let timelines: Vec<(Uuid, Arc<Mutex<Timeline>>)> = self
            .synced
            .read()
            .await
            .iter()
            .map(|(id, tl)| (*id, tl.clone()))
            .collect();

        for (monitor_id, timeline) in timelines {
            let latest = timeline.lock().await.latest().cloned();
            let Some(latest) = latest else { continue };

            if let Err(error) = self
                .membership
                .replicate(ClusterCommand::UpdateServiceStatus {
                    monitor_id,
                    from: latest.from,
                    status: latest.status,
                    decided_by: None,
                })
                .await
            {
                warn!(monitor = %monitor_id, "status flush failed: {error}");
            }
        }
    }

    /// Idempotent per-monitor sender loop: forwards the oldest
    /// not-yet-synced segment to the leader until caught up
    async fn spawn_sender(self: &Arc<Self>, monitor_id: Uuid) {
        {
            let mut active = self.sender_active.lock().await;
            if !active.insert(monitor_id) {
                return;
            }
        }

        let coordinator = self.clone();
        let mut shutdown = coordinator.membership.shutdown_signal();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    debug!(monitor = %monitor_id, "sender loop cancelled by shutdown");
                    break;
                }

                let mark = coordinator.synced_until_of(monitor_id).await;
                let pending = {
                    let local = coordinator.local_timeline(monitor_id).await;
                    let timeline = local.lock().await;
                    timeline.pending_after(mark).cloned()
                };

                let Some(segment) = pending else {
                    // Caught up; deregister under the active lock and
                    // re-check so a racing append cannot get lost
                    let mut active = coordinator.sender_active.lock().await;
                    let mark = coordinator.synced_until_of(monitor_id).await;
                    let still_pending = {
                        let local = coordinator.local_timeline(monitor_id).await;
                        let timeline = local.lock().await;
                        timeline.pending_after(mark).is_some()
                    };
                    if still_pending {
                        continue;
                    }
                    active.remove(&monitor_id);
                    break;
                };

                let request = ClusterRequest::new(
                    coordinator.membership.local_endpoint(),
                    RequestKind::ReportServiceStatus { monitor_id, segment: segment.clone() },
                );

                match coordinator.membership.send_to_leader(request).await {
                    Ok(ClusterResponse::Ok) => {
                        // The leader decided; if the decision has not come
                        // back yet the next round re-sends the segment
                        if coordinator.synced_until_of(monitor_id).await.map_or(true, |m| m < segment.from)
                        {
                            tokio::select! {
                                _ = sleep(coordinator.config.sender_retry_interval) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                    }
                    Ok(other) => {
                        debug!(monitor = %monitor_id, response = ?other, "report not accepted, retrying");
                        tokio::select! {
                            _ = sleep(coordinator.config.sender_retry_interval) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                    Err(error) => {
                        debug!(monitor = %monitor_id, "report delivery failed, retrying: {error}");
                        tokio::select! {
                            _ = sleep(coordinator.config.sender_retry_interval) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
            }
        });
    }

    async fn local_timeline(&self, monitor_id: Uuid) -> Arc<Mutex<Timeline>> {
        if let Some(timeline) = self.local.read().await.get(&monitor_id) {
            return timeline.clone();
        }
        self.local
            .write()
            .await
            .entry(monitor_id)
            .or_insert_with(|| Arc::new(Mutex::new(Timeline::new())))
            .clone()
    }

    async fn synced_timeline(&self, monitor_id: Uuid) -> Arc<Mutex<Timeline>> {
        if let Some(timeline) = self.synced.read().await.get(&monitor_id) {
            return timeline.clone();
        }
        self.synced
            .write()
            .await
            .entry(monitor_id)
            .or_insert_with(|| Arc::new(Mutex::new(Timeline::new())))
            .clone()
    }

    async fn synced_until_of(&self, monitor_id: Uuid) -> Option<DateTime<Utc>> {
        let timeline = self.synced.read().await.get(&monitor_id)?.clone();
        let timeline = timeline.lock().await;
        timeline.until()
    }

    async fn synced_covers(&self, monitor_id: Uuid, at: DateTime<Utc>) -> bool {
        let Some(timeline) = self.synced.read().await.get(&monitor_id).cloned() else {
            return false;
        };
        let timeline = timeline.lock().await;
        timeline.covers(at)
    }

    /// Latest synced segment, for tests and status surfaces
    pub async fn synced_latest(&self, monitor_id: Uuid) -> Option<TimelineSegment> {
        let timeline = self.synced.read().await.get(&monitor_id)?.clone();
        let timeline = timeline.lock().await;
        timeline.latest().cloned()
    }
}

fn chrono_retention(config: &ClusterConfig) -> ChronoDuration {
    ChronoDuration::from_std(config.timeline_retention)
        .unwrap_or_else(|_| ChronoDuration::days(7))
}

#[async_trait]
impl RequestHandler for StatusTimelineCoordinator {
    async fn handle_request(&self, request: ClusterRequest) -> ClusterResponse {
        match request.kind {
            RequestKind::ReportServiceStatus { monitor_id, segment } => {
                match self.determine_status(monitor_id, segment.from).await {
                    Ok(_) => ClusterResponse::Ok,
                    Err(error) => ClusterResponse::Error { message: error.to_string() },
                }
            }
            RequestKind::FetchPendingChanges { monitor_id, before } => {
                let mark = self.synced_until_of(monitor_id).await;
                let earliest = match self.local.read().await.get(&monitor_id) {
                    Some(timeline) => {
                        let timeline = timeline.lock().await;
                        timeline
                            .pending_after(mark)
                            .map(|s| s.from)
                            .filter(|from| *from < before)
                    }
                    None => None,
                };
                ClusterResponse::PendingChange { earliest }
            }
            RequestKind::ServiceStatusQuery { monitor_id, at } => {
                let status = self.get_service_status(monitor_id, at).await;
                ClusterResponse::Status { status }
            }
            other => ClusterResponse::Error {
                message: format!("request not handled by timelines: {other:?}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_all_unavailable_is_unavailable() {
        let known = [ServiceStatus::Unavailable; 3];
        assert_eq!(decide(&known, true), ServiceStatus::Unavailable);
    }

    #[test]
    fn test_decision_mixed_is_degraded() {
        let known = [
            ServiceStatus::Available,
            ServiceStatus::Available,
            ServiceStatus::Unavailable,
        ];
        assert_eq!(decide(&known, true), ServiceStatus::Degraded);
    }

    #[test]
    fn test_decision_all_available_is_available() {
        let known = [ServiceStatus::Available; 3];
        assert_eq!(decide(&known, true), ServiceStatus::Available);
    }

    #[test]
    fn test_even_split_tunable() {
        let known = [ServiceStatus::Available, ServiceStatus::Unavailable];
        assert_eq!(decide(&known, true), ServiceStatus::Degraded);
        assert_eq!(decide(&known, false), ServiceStatus::Available);
    }

    #[test]
    fn test_degraded_responses_never_mean_unavailable() {
        let known = [ServiceStatus::Degraded, ServiceStatus::Unavailable];
        assert_eq!(decide(&known, true), ServiceStatus::Degraded);
    }
}
