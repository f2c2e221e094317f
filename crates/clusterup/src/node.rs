//! Cluster node assembly.
//!
//! Wires the log, replicator, membership, scheduler and timeline
//! coordinator together for one process and exposes the small surface the
//! application layer drives.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::command::ClusterCommand;
use crate::config::ClusterConfig;
use crate::events::EventBus;
use crate::handlers::CommandApplier;
use crate::log::ReplicatedLog;
use crate::membership::{ClusterMembership, RequestHandler};
use crate::monitor::MonitorConfig;
use crate::probe::{CheckSample, ServiceStatus};
use crate::replicator::MessageReplicator;
use crate::scheduler::{AssignmentBook, TaskAssignment, WorkloadScheduler};
use crate::store::StateStore;
use crate::timeline::StatusTimelineCoordinator;
use crate::transport::Transport;
use crate::Result;

/// One node of the coordination cluster
pub struct ClusterNode {
    log: Arc<ReplicatedLog>,
    replicator: Arc<MessageReplicator>,
    membership: Arc<ClusterMembership>,
    scheduler: Arc<WorkloadScheduler>,
    timelines: Arc<StatusTimelineCoordinator>,
    monitors: Arc<RwLock<HashMap<Uuid, MonitorConfig>>>,
    assignments: Arc<RwLock<AssignmentBook>>,
    bus: EventBus,
}

impl ClusterNode {
    /// Assemble a node; nothing runs until [`ClusterNode::start`]
    pub async fn new(
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn StateStore>,
    ) -> Arc<Self> {
        let bus = EventBus::default();

        let log = Arc::new(ReplicatedLog::new(store.clone(), config.compaction_threshold));
        log.recover().await;

        let replicator =
            Arc::new(MessageReplicator::new(log.clone(), store.clone(), bus.clone()));
        log.set_commit_hook(replicator.clone()).await;

        let membership = ClusterMembership::new(
            config,
            transport,
            replicator.clone(),
            log.clone(),
            bus.clone(),
        );

        let monitors: Arc<RwLock<HashMap<Uuid, MonitorConfig>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let assignments = Arc::new(RwLock::new(AssignmentBook::new()));

        let timelines = StatusTimelineCoordinator::new(
            membership.clone(),
            monitors.clone(),
            assignments.clone(),
            store.clone(),
        );
        membership.set_timeline_handler(timelines.clone()).await;

        let applier =
            CommandApplier::new(&membership, &timelines, monitors.clone(), assignments.clone());
        replicator.set_handler(applier.clone()).await;
        log.set_snapshot_source(applier).await;

        let scheduler =
            WorkloadScheduler::new(membership.clone(), monitors.clone(), assignments.clone());

        Arc::new(Self {
            log,
            replicator,
            membership,
            scheduler,
            timelines,
            monitors,
            assignments,
            bus,
        })
    }

    /// Start the join loop, drain worker, scheduler and flush loop
    pub fn start(&self) {
        info!(endpoint = %self.membership.local_endpoint(), "starting cluster node");
        self.membership.start();
        let _ = self.scheduler.start(self.membership.shutdown_signal());
        let _ = self.timelines.start(self.membership.shutdown_signal());
    }

    /// Graceful departure from the cluster
    pub async fn shutdown(&self) {
        self.membership.shutdown().await;
    }

    /// Handler answering requests addressed to this node; register it
    /// with the transport
    pub fn request_handler(self: &Arc<Self>) -> Arc<dyn RequestHandler> {
        self.membership.clone()
    }

    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    pub fn scheduler(&self) -> &Arc<WorkloadScheduler> {
        &self.scheduler
    }

    pub fn timelines(&self) -> &Arc<StatusTimelineCoordinator> {
        &self.timelines
    }

    pub fn log(&self) -> &Arc<ReplicatedLog> {
        &self.log
    }

    pub fn replicator(&self) -> &Arc<MessageReplicator> {
        &self.replicator
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The monitor as this node currently knows it
    pub async fn monitor(&self, monitor_id: Uuid) -> Option<MonitorConfig> {
        self.monitors.read().await.get(&monitor_id).cloned()
    }

    /// The monitor's effective assignment as this node currently knows it
    pub async fn effective_assignment(&self, monitor_id: Uuid) -> Option<TaskAssignment> {
        self.assignments.read().await.effective(&monitor_id).cloned()
    }

    /// Create or update a monitor cluster-wide (leader only)
    pub async fn upsert_monitor(&self, monitor: MonitorConfig) -> Result<bool> {
        self.membership
            .replicate(ClusterCommand::CreateOrUpdateMonitor { monitor })
            .await
    }

    /// Delete a monitor cluster-wide (leader only)
    pub async fn delete_monitor(&self, monitor_id: Uuid) -> Result<bool> {
        self.membership.replicate(ClusterCommand::DeleteMonitor { monitor_id }).await
    }

    /// Feed one probe result into the local buffer
    pub async fn report_check(&self, monitor_id: Uuid, sample: CheckSample) {
        self.timelines.add_local_result(monitor_id, sample).await;
    }

    /// Read the monitor's status as this node currently sees it
    pub async fn service_status(&self, monitor_id: Uuid, at: DateTime<Utc>) -> ServiceStatus {
        self.timelines.get_service_status(monitor_id, at).await
    }
}
