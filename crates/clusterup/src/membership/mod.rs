//! Cluster membership.
//!
//! The directory of known peers, the join/leave protocol, leader
//! visibility, availability tracking and leader-forwarding. Membership
//! changes propagate to the rest of the cluster through the replicated
//! log.

mod directory;
mod gate;
mod join;
mod member;

pub use directory::MemberDirectory;
pub use gate::{leader_gate, operational_gate, GateDecision};
pub use member::{Availability, ClusterMember};

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::command::ClusterCommand;
use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::events::{ClusterEvent, EventBus};
use crate::log::ReplicatedLog;
use crate::proto::{ClusterRequest, ClusterResponse, RequestKind};
use crate::replicator::MessageReplicator;
use crate::transport::Transport;
use crate::Result;

/// Handles requests addressed to this node, whether they arrived over the
/// wire or were short-circuited locally
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, request: ClusterRequest) -> ClusterResponse;
}

/// Membership coordinator for one node.
///
/// Owns the member directory exclusively; every mutation goes through its
/// protocol handlers and is announced on the event bus.
pub struct ClusterMembership {
    config: ClusterConfig,
    member_id: String,
    directory: RwLock<MemberDirectory>,
    transport: Arc<dyn Transport>,
    replicator: Arc<MessageReplicator>,
    log: Arc<ReplicatedLog>,
    bus: EventBus,
    /// Answers timeline-related requests (registered by the coordinator)
    timeline_handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    /// Serializes add/remove so directory churn cannot interleave
    mutation_lock: Mutex<()>,
    joined: AtomicBool,
    initialized_fired: AtomicBool,
    operational: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    join_nudge: Notify,
}

impl ClusterMembership {
    pub fn new(
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        replicator: Arc<MessageReplicator>,
        log: Arc<ReplicatedLog>,
        bus: EventBus,
    ) -> Arc<Self> {
        let member_id = Uuid::new_v4().to_string();
        let (shutdown_tx, _) = watch::channel(false);

        let mut directory = MemberDirectory::new(bus.clone());
        directory.insert(
            ClusterMember::local(member_id.clone(), config.local_endpoint.clone())
                .with_tags(config.local_tags.clone()),
        );

        Arc::new(Self {
            config,
            member_id,
            directory: RwLock::new(directory),
            transport,
            replicator,
            log,
            bus,
            timeline_handler: RwLock::new(None),
            mutation_lock: Mutex::new(()),
            joined: AtomicBool::new(false),
            initialized_fired: AtomicBool::new(false),
            operational: AtomicBool::new(false),
            shutdown_tx,
            join_nudge: Notify::new(),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn local_endpoint(&self) -> &str {
        &self.config.local_endpoint
    }

    pub fn local_tags(&self) -> &BTreeSet<String> {
        &self.config.local_tags
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub(super) fn join_nudge(&self) -> &Notify {
        &self.join_nudge
    }

    /// Register a peer known before joining (bootstrap list)
    pub async fn seed_peer(&self, endpoint: impl Into<String>) {
        self.directory.write().await.insert(ClusterMember::remote(endpoint));
    }

    /// Register the handler for timeline-related requests
    pub async fn set_timeline_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.timeline_handler.write().await = Some(handler);
    }

    /// Spawn the join loop, the replication drain worker and the
    /// operational watcher
    pub fn start(self: &Arc<Self>) {
        let _ = self.replicator.start(self.shutdown_signal());
        tokio::spawn(join::run_join_loop(self.clone(), self.shutdown_signal()));
        tokio::spawn(Self::run_operational_watch(self.clone(), self.shutdown_signal()));
    }

    /// Shutdown signal handed to every long-running loop
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub async fn members(&self) -> Vec<ClusterMember> {
        self.directory.read().await.list()
    }

    pub async fn remote_members(&self) -> Vec<ClusterMember> {
        self.directory.read().await.remote_members()
    }

    pub async fn available_members(&self) -> Vec<ClusterMember> {
        self.directory.read().await.available_members()
    }

    pub async fn leader_endpoint(&self) -> Option<String> {
        self.directory.read().await.leader().map(|m| m.endpoint.clone())
    }

    pub async fn leader_member(&self) -> Option<ClusterMember> {
        self.directory.read().await.leader().cloned()
    }

    pub async fn is_leader(&self) -> bool {
        self.directory.read().await.local().map(|m| m.is_leader).unwrap_or(false)
    }

    pub async fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    pub fn is_operational(&self) -> bool {
        self.operational.load(Ordering::SeqCst)
    }

    /// Record the local node's sampled load so FetchMetrics can answer
    pub async fn set_local_load(&self, avg_cpu_load: Option<f64>) {
        let mut directory = self.directory.write().await;
        let endpoint = self.config.local_endpoint.clone();
        directory.set_avg_cpu_load(&endpoint, avg_cpu_load);
    }

    /// Record a remote member's sampled load
    pub async fn set_member_load(&self, endpoint: &str, avg_cpu_load: Option<f64>) {
        self.directory.write().await.set_avg_cpu_load(endpoint, avg_cpu_load);
    }

    /// Look a member up by its stable id
    pub async fn member_by_id(&self, id: &str) -> Option<ClusterMember> {
        self.directory
            .read()
            .await
            .list()
            .into_iter()
            .find(|m| m.id.as_deref() == Some(id))
    }

    /// Flip a remote member's availability
    pub async fn set_availability(&self, endpoint: &str, availability: Availability) {
        self.directory.write().await.set_availability(endpoint, availability);
        self.join_nudge.notify_waiters();
    }

    /// Deliver `request` to `member`: local short-circuit when addressed to
    /// this node, otherwise through the transport
    pub async fn send(
        &self,
        member: &ClusterMember,
        request: ClusterRequest,
    ) -> Result<ClusterResponse> {
        if member.is_local {
            return Ok(self.handle_request(request).await);
        }

        match timeout(self.config.connection_timeout, self.transport.send(member, request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(ClusterError::DeliveryFailed {
                endpoint: member.endpoint.clone(),
                reason: error.to_string(),
            }),
            Err(_) => Err(ClusterError::DeliveryFailed {
                endpoint: member.endpoint.clone(),
                reason: format!("timed out after {:?}", self.config.connection_timeout),
            }),
        }
    }

    /// Deliver `request` to the current leader.
    ///
    /// Local fast path when this node leads; otherwise every member
    /// currently flagged leader (at most one) is tried.
    pub async fn send_to_leader(&self, request: ClusterRequest) -> Result<ClusterResponse> {
        if self.is_leader().await {
            return Ok(self.handle_request(request).await);
        }

        let leaders: Vec<ClusterMember> = self
            .directory
            .read()
            .await
            .list()
            .into_iter()
            .filter(|m| m.is_leader && !m.is_local)
            .collect();

        for leader in leaders {
            match self.send(&leader, request.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    warn!(leader = %leader.endpoint, "leader delivery failed: {error}")
                }
            }
        }

        Err(ClusterError::LeaderUnavailable)
    }

    /// Append `command` to the replicated log and distribute it.
    ///
    /// Returns whether replication succeeded. Only the leader replicates;
    /// other nodes report failure so callers can retry after forwarding.
    pub async fn replicate(&self, command: ClusterCommand) -> Result<bool> {
        if !self.is_leader().await {
            warn!(kind = command.kind(), "replicate called on non-leader");
            return Ok(false);
        }

        let index = self.replicator.replicate(command).await?;
        self.fan_out(index).await;
        Ok(true)
    }

    /// Ship committed entries from `start_index` to every available remote
    /// member, best-effort and concurrently
    async fn fan_out(&self, start_index: u64) {
        let entries = match self.log.read(start_index, None).await {
            Ok(entries) => entries,
            Err(error) => {
                error!(start_index, "failed to read entries for fan-out: {error}");
                return;
            }
        };
        let commit_through = self.log.commit_index().await;
        let first_index = entries.first().map(|e| e.index).unwrap_or(start_index);

        let targets: Vec<ClusterMember> = self
            .remote_members()
            .await
            .into_iter()
            .filter(|m| m.is_available() || m.availability == Availability::Unknown)
            .collect();

        let deliveries = join_all(targets.into_iter().map(|member| {
            let request = ClusterRequest::new(
                self.local_endpoint(),
                RequestKind::AppendEntries {
                    entries: entries.clone(),
                    start_index: first_index,
                    commit_through,
                },
            );
            async move {
                let result = self.send(&member, request).await;
                (member, result)
            }
        }))
        .await;

        for (member, result) in deliveries {
            if let Err(error) = result {
                warn!(peer = %member.endpoint, "entry fan-out failed: {error}");
                self.directory
                    .write()
                    .await
                    .set_availability(&member.endpoint, Availability::Unavailable);
            }
        }
    }

    /// Add a member to the directory, serialized with other mutations and
    /// bounded so churn cannot wedge the caller.
    ///
    /// On the leader the new member is caught up with the full retained
    /// log before the add returns.
    pub async fn add_member(&self, member: ClusterMember) -> Result<()> {
        let deadline = self.config.membership_mutation_timeout();
        let _guard = timeout(deadline, self.mutation_lock.lock())
            .await
            .map_err(|_| ClusterError::Timeout(deadline))?;

        let endpoint = member.endpoint.clone();
        {
            let mut directory = self.directory.write().await;
            if directory.get(&endpoint).is_some() {
                if let Some(id) = member.id.clone() {
                    directory.assign_id(&endpoint, id);
                }
            } else {
                directory.insert(member);
            }
            directory.set_availability(&endpoint, Availability::Available);
        }

        if self.is_leader().await && self.log.highest_index().await > 0 {
            // Data catch-up: ship everything we have, snapshot included
            self.catch_up(&endpoint).await;
        }

        self.join_nudge.notify_waiters();
        Ok(())
    }

    async fn catch_up(&self, endpoint: &str) {
        let Some(member) = self.directory.read().await.get(endpoint).cloned() else {
            return;
        };
        let first = match self.log.read(1, None).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!(peer = %endpoint, "failed to read log for catch-up: {error}");
                return;
            }
        };
        let Some(start_index) = first.first().map(|e| e.index) else {
            return;
        };
        let request = ClusterRequest::new(
            self.local_endpoint(),
            RequestKind::AppendEntries {
                entries: first,
                start_index,
                commit_through: self.log.commit_index().await,
            },
        );
        if let Err(error) = self.send(&member, request).await {
            warn!(peer = %endpoint, "catch-up delivery failed: {error}");
        }
    }

    /// Remove a member, best-effort telling it to shut down first
    pub async fn remove_member(&self, endpoint: &str) -> Result<Option<ClusterMember>> {
        let deadline = self.config.membership_mutation_timeout();
        let _guard = timeout(deadline, self.mutation_lock.lock())
            .await
            .map_err(|_| ClusterError::Timeout(deadline))?;

        let member = self.directory.read().await.get(endpoint).cloned();
        if let Some(member) = &member {
            if !member.is_local {
                let request =
                    ClusterRequest::new(self.local_endpoint(), RequestKind::Shutdown);
                if let Err(error) = self.send(member, request).await {
                    debug!(peer = %endpoint, "departing member unreachable: {error}");
                }
            }
        }

        let removed = self.directory.write().await.remove(endpoint);
        if removed.is_some() && self.is_leader().await {
            if let Err(error) = self
                .replicate(ClusterCommand::MemberLeft { endpoint: endpoint.to_string() })
                .await
            {
                warn!("failed to replicate member removal: {error}");
            }
        }
        self.join_nudge.notify_waiters();
        Ok(removed)
    }

    /// Apply a replicated MemberJoined on this node
    pub(crate) async fn apply_member_joined(
        &self,
        endpoint: String,
        member_id: String,
        tags: BTreeSet<String>,
    ) {
        if endpoint == self.config.local_endpoint {
            return;
        }
        let mut directory = self.directory.write().await;
        // Replace-not-mutate: a bare first-contact record gives way to the
        // fully identified one
        directory.remove(&endpoint);
        directory.insert(
            ClusterMember::remote(endpoint.clone()).with_id(member_id).with_tags(tags),
        );
        directory.set_availability(&endpoint, Availability::Available);
    }

    /// Apply a replicated MemberLeft on this node
    pub(crate) async fn apply_member_left(&self, endpoint: &str) {
        if endpoint == self.config.local_endpoint {
            return;
        }
        self.directory.write().await.remove(endpoint);
    }

    /// Block until the local term matches the term of the last committed
    /// entry; leader-only operations call this before serving
    pub async fn wait_until_consistent(&self) -> Result<()> {
        self.log.wait_until_consistent().await
    }

    /// Found a single-node cluster: self becomes leader with zero network
    /// calls; Initialized fires exactly once
    pub(super) async fn found_cluster(&self) {
        self.log.increment_term().await;
        {
            let mut directory = self.directory.write().await;
            let endpoint = self.config.local_endpoint.clone();
            directory.set_leader(Some(&endpoint));
        }
        self.replicator.set_leader(true);
        self.joined.store(true, Ordering::SeqCst);

        if !self.initialized_fired.swap(true, Ordering::SeqCst) {
            self.bus.publish(ClusterEvent::Initialized);
        }
        self.evaluate_operational().await;
    }

    /// Adopt `endpoint` as the known leader, creating the record on first
    /// contact if needed
    pub(super) async fn adopt_leader(&self, endpoint: &str) {
        {
            let mut directory = self.directory.write().await;
            if directory.get(endpoint).is_none() {
                directory.insert(ClusterMember::remote(endpoint));
            }
            directory.set_leader(Some(endpoint));
        }
        self.replicator.set_leader(endpoint == self.config.local_endpoint);
        self.evaluate_operational().await;
    }

    pub(super) async fn mark_joined(&self) {
        self.joined.store(true, Ordering::SeqCst);
        self.evaluate_operational().await;
    }

    /// Operational = a leader is known and the replication queue is
    /// drained; fires on every transition into that state
    async fn evaluate_operational(&self) {
        let ready =
            self.leader_endpoint().await.is_some() && self.replicator.pending_len() == 0;
        let was = self.operational.swap(ready, Ordering::SeqCst);
        if ready && !was {
            info!("cluster operational");
            self.bus.publish(ClusterEvent::Operational);
        }
    }

    async fn run_operational_watch(
        membership: Arc<ClusterMembership>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut events = membership.bus.subscribe();
        let mut pending = membership.replicator.pending_watch();
        loop {
            tokio::select! {
                _ = events.recv() => membership.evaluate_operational().await,
                _ = pending.changed() => membership.evaluate_operational().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("operational watch cancelled by shutdown");
                        return;
                    }
                }
            }
        }
    }

    /// Vet a request against the leader-forwarding gate
    pub async fn gate(&self, request: &ClusterRequest) -> GateDecision {
        let directory = self.directory.read().await;
        let local_is_leader = directory.local().map(|m| m.is_leader).unwrap_or(false);
        let leader_endpoint = directory.leader().map(|m| m.endpoint.clone());
        leader_gate(request.leader_only(), local_is_leader, leader_endpoint.as_deref())
    }

    /// Vet externally-facing traffic; the caller answers 503 on
    /// `Unavailable`
    pub fn external_gate(&self) -> GateDecision {
        operational_gate(self.is_operational())
    }

    /// Graceful departure: cancel the loops, tell the leader, and let the
    /// caller terminate the process
    pub async fn shutdown(&self) {
        info!("membership shutting down");
        let _ = self.shutdown_tx.send(true);

        if self.is_leader().await {
            return;
        }
        let request = ClusterRequest::new(
            self.local_endpoint(),
            RequestKind::LeaveCluster { endpoint: self.local_endpoint().to_string() },
        );
        if let Err(error) = self.send_to_leader(request).await {
            // Tolerated: the leader will eventually drop us, or an
            // operator removes the member manually
            warn!("leave notification failed, manual removal may be required: {error}");
        }
    }

    async fn handle_join(
        &self,
        endpoint: String,
        member_id: String,
        tags: BTreeSet<String>,
    ) -> ClusterResponse {
        let member = ClusterMember::remote(endpoint.clone())
            .with_id(member_id.clone())
            .with_tags(tags.clone());

        if let Err(error) = self.add_member(member).await {
            return ClusterResponse::Error { message: error.to_string() };
        }

        match self
            .replicate(ClusterCommand::MemberJoined { endpoint, member_id, tags })
            .await
        {
            Ok(true) => {
                ClusterResponse::Joined { leader_endpoint: self.local_endpoint().to_string() }
            }
            Ok(false) => ClusterResponse::Unavailable,
            Err(error) => ClusterResponse::Error { message: error.to_string() },
        }
    }

    async fn handle_leave(&self, endpoint: String) -> ClusterResponse {
        // The member announced its own departure; skip the shutdown call
        let removed = self.directory.write().await.remove(&endpoint);
        if removed.is_some() {
            if let Err(error) =
                self.replicate(ClusterCommand::MemberLeft { endpoint }).await
            {
                warn!("failed to replicate member departure: {error}");
            }
        }
        self.join_nudge.notify_waiters();
        ClusterResponse::Ok
    }

    async fn handle_append_entries(
        &self,
        requested_by: &str,
        entries: Vec<crate::log::LogEntry>,
        start_index: u64,
        commit_through: u64,
    ) -> ClusterResponse {
        // Entries only ever come from the leader; first contact creates
        // the record with an empty id
        self.adopt_leader(requested_by).await;

        match self.replicator.ingest(entries, start_index, commit_through).await {
            Ok(()) => ClusterResponse::Ok,
            Err(error) => ClusterResponse::Error { message: error.to_string() },
        }
    }

    async fn handle_fetch_metrics(&self) -> ClusterResponse {
        let avg_cpu_load =
            self.directory.read().await.local().and_then(|m| m.avg_cpu_load);
        ClusterResponse::Metrics { avg_cpu_load }
    }
}

#[async_trait]
impl RequestHandler for ClusterMembership {
    async fn handle_request(&self, request: ClusterRequest) -> ClusterResponse {
        match self.gate(&request).await {
            GateDecision::Proceed => {}
            GateDecision::Redirect { leader_endpoint } => {
                return ClusterResponse::Redirect { leader_endpoint }
            }
            GateDecision::Unavailable => return ClusterResponse::Unavailable,
        }

        let requested_by = request.requested_by.clone();
        match request.kind {
            RequestKind::JoinCluster { endpoint, member_id, tags } => {
                self.handle_join(endpoint, member_id, tags).await
            }
            RequestKind::LeaveCluster { endpoint } => self.handle_leave(endpoint).await,
            RequestKind::Shutdown => {
                info!("shutdown requested by {requested_by}");
                let _ = self.shutdown_tx.send(true);
                ClusterResponse::Ok
            }
            RequestKind::AppendEntries { entries, start_index, commit_through } => {
                self.handle_append_entries(&requested_by, entries, start_index, commit_through)
                    .await
            }
            RequestKind::FetchMetrics => self.handle_fetch_metrics().await,
            RequestKind::ReportServiceStatus { .. }
            | RequestKind::FetchPendingChanges { .. }
            | RequestKind::ServiceStatusQuery { .. } => {
                let handler = self.timeline_handler.read().await.clone();
                match handler {
                    Some(handler) => handler.handle_request(request).await,
                    None => ClusterResponse::Error {
                        message: "no timeline handler registered".to_string(),
                    },
                }
            }
        }
    }
}
