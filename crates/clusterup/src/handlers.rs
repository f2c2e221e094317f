//! Applying replicated commands to local state.
//!
//! One applier runs on every node; the replicator hands it committed
//! commands in index order, so all nodes converge on the same monitor
//! registry, assignment book, member directory and synced timelines.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::command::{ClusterCommand, CommandHandler};
use crate::log::SnapshotSource;
use crate::membership::ClusterMembership;
use crate::monitor::MonitorConfig;
use crate::scheduler::{AssignmentBook, TaskAssignment};
use crate::timeline::StatusTimelineCoordinator;

/// Serialized form of the replicated state, used as the compaction
/// snapshot payload
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateSnapshot {
    monitors: Vec<MonitorConfig>,
    assignments: Vec<TaskAssignment>,
    /// Identified members, so a catch-up replay that starts from a
    /// snapshot still reconstructs the directory
    members: Vec<SnapshotMember>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMember {
    endpoint: String,
    member_id: String,
    tags: BTreeSet<String>,
}

/// Applies every committed command to this node's state
pub struct CommandApplier {
    membership: Weak<ClusterMembership>,
    timelines: Weak<StatusTimelineCoordinator>,
    monitors: Arc<RwLock<HashMap<Uuid, MonitorConfig>>>,
    assignments: Arc<RwLock<AssignmentBook>>,
}

impl CommandApplier {
    pub fn new(
        membership: &Arc<ClusterMembership>,
        timelines: &Arc<StatusTimelineCoordinator>,
        monitors: Arc<RwLock<HashMap<Uuid, MonitorConfig>>>,
        assignments: Arc<RwLock<AssignmentBook>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            membership: Arc::downgrade(membership),
            timelines: Arc::downgrade(timelines),
            monitors,
            assignments,
        })
    }
}

#[async_trait]
impl CommandHandler for CommandApplier {
    async fn handle(&self, command: ClusterCommand) -> anyhow::Result<()> {
        debug!(kind = command.kind(), "applying replicated command");
        match command {
            ClusterCommand::CreateOrUpdateMonitor { monitor } => {
                info!(monitor = %monitor.id, name = %monitor.name, "monitor upserted");
                self.monitors.write().await.insert(monitor.id, monitor);
            }
            ClusterCommand::DeleteMonitor { monitor_id } => {
                info!(monitor = %monitor_id, "monitor deleted");
                self.monitors.write().await.remove(&monitor_id);
                self.assignments.write().await.forget_monitor(&monitor_id);
                if let Some(timelines) = self.timelines.upgrade() {
                    timelines.forget_monitor(&monitor_id).await;
                }
            }
            ClusterCommand::Assign { assignment } => {
                debug!(
                    monitor = %assignment.monitor_id,
                    workers = assignment.worker_ids.len(),
                    "assignment recorded"
                );
                self.assignments.write().await.record(assignment);
            }
            ClusterCommand::UpdateServiceStatus { monitor_id, from, status, decided_by } => {
                if let Some(timelines) = self.timelines.upgrade() {
                    timelines.handle_status_update(monitor_id, from, status, decided_by).await;
                }
            }
            ClusterCommand::MemberJoined { endpoint, member_id, tags } => {
                if let Some(membership) = self.membership.upgrade() {
                    membership.apply_member_joined(endpoint, member_id, tags).await;
                }
            }
            ClusterCommand::MemberLeft { endpoint } => {
                if let Some(membership) = self.membership.upgrade() {
                    membership.apply_member_left(&endpoint).await;
                }
            }
        }
        Ok(())
    }

    async fn restore_snapshot(&self, blob: Vec<u8>) -> anyhow::Result<()> {
        let snapshot: StateSnapshot = serde_json::from_slice(&blob)?;
        info!(
            monitors = snapshot.monitors.len(),
            assignments = snapshot.assignments.len(),
            "restoring state from snapshot"
        );

        let mut monitors = self.monitors.write().await;
        monitors.clear();
        for monitor in snapshot.monitors {
            monitors.insert(monitor.id, monitor);
        }
        drop(monitors);

        let mut book = self.assignments.write().await;
        *book = AssignmentBook::new();
        for assignment in snapshot.assignments {
            book.record(assignment);
        }
        drop(book);

        if let Some(membership) = self.membership.upgrade() {
            for member in snapshot.members {
                membership
                    .apply_member_joined(member.endpoint, member.member_id, member.tags)
                    .await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotSource for CommandApplier {
    async fn build_snapshot(&self, _through_index: u64) -> anyhow::Result<Vec<u8>> {
        let monitors: Vec<MonitorConfig> =
            self.monitors.read().await.values().cloned().collect();

        let book = self.assignments.read().await;
        let assignments: Vec<TaskAssignment> = book
            .monitors()
            .iter()
            .filter_map(|id| book.effective(id).cloned())
            .collect();
        drop(book);

        let mut members = Vec::new();
        if let Some(membership) = self.membership.upgrade() {
            for member in membership.members().await {
                if let Some(member_id) = member.id {
                    members.push(SnapshotMember {
                        endpoint: member.endpoint,
                        member_id,
                        tags: member.tags,
                    });
                }
            }
        }

        Ok(serde_json::to_vec(&StateSnapshot { monitors, assignments, members })?)
    }
}
