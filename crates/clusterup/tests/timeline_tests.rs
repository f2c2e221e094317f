//! Status timeline tests: quorum decisions, fallback and the
//! report-to-synced round trip.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clusterup::command::ClusterCommand;
use clusterup::membership::{ClusterMember, RequestHandler};
use clusterup::node::ClusterNode;
use clusterup::probe::CheckSample;
use clusterup::proto::{ClusterRequest, ClusterResponse, RequestKind};
use clusterup::scheduler::TaskAssignment;
use clusterup::store::MemoryStore;
use clusterup::transport::LoopbackTransport;
use clusterup::{ClusterConfig, MonitorConfig, ServiceStatus};
use uuid::Uuid;

fn test_config(endpoint: &str) -> ClusterConfig {
    ClusterConfig::builder()
        .local_endpoint(endpoint)
        .connection_timeout(Duration::from_millis(50))
        .sender_retry_interval(Duration::from_millis(20))
        .flush_interval(Duration::from_secs(30))
        .build()
}

/// A worker that answers status queries with a fixed observation
struct StaticWorker {
    status: ServiceStatus,
}

#[async_trait]
impl RequestHandler for StaticWorker {
    async fn handle_request(&self, request: ClusterRequest) -> ClusterResponse {
        match request.kind {
            RequestKind::ServiceStatusQuery { .. } => {
                ClusterResponse::Status { status: self.status }
            }
            RequestKind::FetchPendingChanges { .. } => {
                ClusterResponse::PendingChange { earliest: None }
            }
            RequestKind::FetchMetrics => ClusterResponse::Metrics { avg_cpu_load: None },
            _ => ClusterResponse::Ok,
        }
    }
}

async fn leader_node(transport: &Arc<LoopbackTransport>, endpoint: &str) -> Arc<ClusterNode> {
    logger::try_init_tracing();
    let node = ClusterNode::new(
        test_config(endpoint),
        transport.clone(),
        Arc::new(MemoryStore::new()),
    )
    .await;
    transport.register(endpoint, node.request_handler()).await;
    node.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !node.membership().is_leader().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for leadership");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    node
}

/// Register `workers` as members and replicate one assignment over them
async fn assign_workers(
    leader: &Arc<ClusterNode>,
    transport: &Arc<LoopbackTransport>,
    monitor_id: Uuid,
    workers: &[(&str, Option<ServiceStatus>)],
) -> TaskAssignment {
    let mut worker_ids = BTreeSet::new();
    for (name, status) in workers {
        let endpoint = format!("{name}.worker:7071");
        if let Some(status) = status {
            transport.register(&endpoint, Arc::new(StaticWorker { status: *status })).await;
        }
        leader
            .membership()
            .add_member(ClusterMember::remote(endpoint).with_id(*name))
            .await
            .unwrap();
        worker_ids.insert(name.to_string());
    }

    let assignment = TaskAssignment::new(
        monitor_id,
        1,
        worker_ids,
        Utc::now() - chrono::Duration::seconds(60),
    );
    assert!(leader
        .membership()
        .replicate(ClusterCommand::Assign { assignment: assignment.clone() })
        .await
        .unwrap());
    assignment
}

#[tokio::test]
async fn test_mixed_reports_decide_degraded() {
    let transport = Arc::new(LoopbackTransport::new());
    let leader = leader_node(&transport, "10.3.0.1:7071").await;
    let monitor_id = Uuid::new_v4();

    assign_workers(
        &leader,
        &transport,
        monitor_id,
        &[
            ("w1", Some(ServiceStatus::Available)),
            ("w2", Some(ServiceStatus::Available)),
            ("w3", Some(ServiceStatus::Unavailable)),
        ],
    )
    .await;

    let status = leader.timelines().determine_status(monitor_id, Utc::now()).await.unwrap();
    assert_eq!(status, ServiceStatus::Degraded);
    assert_eq!(
        leader.timelines().synced_latest(monitor_id).await.unwrap().status,
        ServiceStatus::Degraded
    );
}

#[tokio::test]
async fn test_unanimous_unavailable_decides_unavailable() {
    let transport = Arc::new(LoopbackTransport::new());
    let leader = leader_node(&transport, "10.3.1.1:7071").await;
    let monitor_id = Uuid::new_v4();

    assign_workers(
        &leader,
        &transport,
        monitor_id,
        &[
            ("w1", Some(ServiceStatus::Unavailable)),
            ("w2", Some(ServiceStatus::Unavailable)),
            ("w3", Some(ServiceStatus::Unavailable)),
        ],
    )
    .await;

    let status = leader.timelines().determine_status(monitor_id, Utc::now()).await.unwrap();
    assert_eq!(status, ServiceStatus::Unavailable);
}

#[tokio::test]
async fn test_no_majority_falls_back_to_previous_group() {
    let transport = Arc::new(LoopbackTransport::new());
    let leader = leader_node(&transport, "10.3.2.1:7071").await;
    let monitor_id = Uuid::new_v4();

    // Older group: just w1, reachable and healthy
    let older = assign_workers(
        &leader,
        &transport,
        monitor_id,
        &[("w1", Some(ServiceStatus::Available))],
    )
    .await;

    // Newer group: w1 plus two workers that never answer
    let mut worker_ids = BTreeSet::from(["w1".to_string()]);
    for name in ["w2", "w3"] {
        leader
            .membership()
            .add_member(
                ClusterMember::remote(format!("{name}.worker:7071")).with_id(name),
            )
            .await
            .unwrap();
        worker_ids.insert(name.to_string());
    }
    let newer = TaskAssignment::new(
        monitor_id,
        1,
        worker_ids,
        older.created_at + chrono::Duration::seconds(10),
    );
    assert!(leader
        .membership()
        .replicate(ClusterCommand::Assign { assignment: newer })
        .await
        .unwrap());

    // One answer out of three is no majority; the older single-worker
    // group decides instead
    let status = leader.timelines().determine_status(monitor_id, Utc::now()).await.unwrap();
    assert_eq!(status, ServiceStatus::Available);
}

#[tokio::test]
async fn test_report_round_trip_reaches_synced_timeline() {
    let transport = Arc::new(LoopbackTransport::new());
    let leader = leader_node(&transport, "10.3.3.1:7071").await;

    let monitor = MonitorConfig::new("round-trip", 60, 1);
    let monitor_id = monitor.id;
    assert!(leader.upsert_monitor(monitor).await.unwrap());
    leader.scheduler().run_pass().await;
    assert!(
        leader.effective_assignment(monitor_id).await.is_some(),
        "the leader assigns itself as the only worker"
    );

    leader
        .report_check(monitor_id, CheckSample::new(Utc::now(), ServiceStatus::Available))
        .await;

    // Sender loop -> leader decision -> replicated apply
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(segment) = leader.timelines().synced_latest(monitor_id).await {
            assert_eq!(segment.status, ServiceStatus::Available);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "round trip never synced");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(
        leader.service_status(monitor_id, Utc::now()).await,
        ServiceStatus::Available
    );
}

#[tokio::test]
async fn test_status_before_first_schedule_is_unknown() {
    let transport = Arc::new(LoopbackTransport::new());
    let leader = leader_node(&transport, "10.3.4.1:7071").await;

    let monitor = MonitorConfig::new("fresh", 60, 1);
    let monitor_id = monitor.id;
    let first_scheduled_at = monitor.first_scheduled_at;
    assert!(leader.upsert_monitor(monitor).await.unwrap());

    let before = first_scheduled_at - chrono::Duration::hours(1);
    assert_eq!(
        leader.service_status(monitor_id, before).await,
        ServiceStatus::Unknown
    );
}
