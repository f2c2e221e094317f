//! End-to-end scheduling tests over an in-process cluster.

use std::sync::Arc;
use std::time::Duration;

use clusterup::node::ClusterNode;
use clusterup::scheduler::PassOutcome;
use clusterup::store::MemoryStore;
use clusterup::transport::LoopbackTransport;
use clusterup::{ClusterConfig, MonitorConfig};

fn test_config(endpoint: &str, tags: &[&str]) -> ClusterConfig {
    let mut builder = ClusterConfig::builder()
        .local_endpoint(endpoint)
        .connection_timeout(Duration::from_millis(50))
        .sender_retry_interval(Duration::from_millis(20))
        .flush_interval(Duration::from_secs(30));
    for tag in tags {
        builder = builder.local_tag(*tag);
    }
    builder.build()
}

async fn spawn_node(
    transport: &Arc<LoopbackTransport>,
    endpoint: &str,
    tags: &[&str],
) -> Arc<ClusterNode> {
    let node = ClusterNode::new(
        test_config(endpoint, tags),
        transport.clone(),
        Arc::new(MemoryStore::new()),
    )
    .await;
    transport.register(endpoint, node.request_handler()).await;
    node
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Founder plus two joiners, with capability tags
async fn three_node_cluster(
    transport: &Arc<LoopbackTransport>,
) -> (Arc<ClusterNode>, Arc<ClusterNode>, Arc<ClusterNode>) {
    let leader = spawn_node(transport, "10.1.0.1:7071", &["eu"]).await;
    leader.start();
    wait_for("founder to lead", || async { leader.membership().is_leader().await }).await;

    let eu_worker = spawn_node(transport, "10.1.0.2:7071", &["eu"]).await;
    eu_worker.membership().seed_peer("10.1.0.1:7071").await;
    eu_worker.start();
    wait_for("eu worker join", || async { eu_worker.membership().is_joined().await }).await;

    let us_worker = spawn_node(transport, "10.1.0.3:7071", &["us"]).await;
    us_worker.membership().seed_peer("10.1.0.1:7071").await;
    us_worker.start();
    wait_for("us worker join", || async { us_worker.membership().is_joined().await }).await;

    (leader, eu_worker, us_worker)
}

#[tokio::test]
async fn test_assignment_respects_required_tags() {
    logger::try_init_tracing();
    let transport = Arc::new(LoopbackTransport::new());
    let (leader, eu_worker, us_worker) = three_node_cluster(&transport).await;

    let monitor = MonitorConfig::new("eu-endpoint", 60, 2).with_required_tag("eu");
    let monitor_id = monitor.id;
    assert!(leader.upsert_monitor(monitor).await.unwrap());

    assert_eq!(leader.scheduler().run_pass().await, PassOutcome::Rebalanced);

    let assignment = leader.effective_assignment(monitor_id).await.expect("assigned");
    let eu_id = eu_worker.membership().member_id().to_string();
    let us_id = us_worker.membership().member_id().to_string();
    let leader_id = leader.membership().member_id().to_string();

    assert_eq!(assignment.worker_ids.len(), 2);
    assert!(!assignment.worker_ids.contains(&us_id), "us worker lacks the eu tag");
    assert!(assignment.worker_ids.contains(&eu_id) || assignment.worker_ids.contains(&leader_id));

    // The assignment record replicates to every node
    wait_for("assignment replicated", || async {
        eu_worker.effective_assignment(monitor_id).await.is_some()
    })
    .await;
}

#[tokio::test]
async fn test_worker_count_caps_assignment_size() {
    logger::try_init_tracing();
    let transport = Arc::new(LoopbackTransport::new());
    let (leader, _eu_worker, _us_worker) = three_node_cluster(&transport).await;

    let capped = MonitorConfig::new("capped", 60, 1);
    let capped_id = capped.id;
    let wide = MonitorConfig::new("wide", 60, 10);
    let wide_id = wide.id;
    assert!(leader.upsert_monitor(capped).await.unwrap());
    assert!(leader.upsert_monitor(wide).await.unwrap());

    assert_eq!(leader.scheduler().run_pass().await, PassOutcome::Rebalanced);

    assert_eq!(
        leader.effective_assignment(capped_id).await.unwrap().worker_ids.len(),
        1
    );
    // Desired ten, only three members exist
    assert_eq!(
        leader.effective_assignment(wide_id).await.unwrap().worker_ids.len(),
        3
    );
}

#[tokio::test]
async fn test_unqualified_monitor_left_unserved() {
    logger::try_init_tracing();
    let transport = Arc::new(LoopbackTransport::new());
    let (leader, _eu_worker, _us_worker) = three_node_cluster(&transport).await;

    let monitor = MonitorConfig::new("gpu-only", 60, 1).with_required_tag("gpu");
    let monitor_id = monitor.id;
    assert!(leader.upsert_monitor(monitor).await.unwrap());

    // The pass completes without crashing and simply skips the monitor
    leader.scheduler().run_pass().await;
    assert!(leader.effective_assignment(monitor_id).await.is_none());
}

#[tokio::test]
async fn test_pass_on_follower_is_refused() {
    logger::try_init_tracing();
    let transport = Arc::new(LoopbackTransport::new());
    let (_leader, eu_worker, _us_worker) = three_node_cluster(&transport).await;

    assert_eq!(eu_worker.scheduler().run_pass().await, PassOutcome::NotLeader);
}

#[tokio::test]
async fn test_member_arrival_triggers_rebalance_within_debounce() {
    logger::try_init_tracing();
    let transport = Arc::new(LoopbackTransport::new());

    let leader = spawn_node(&transport, "10.2.0.1:7071", &[]).await;
    leader.start();
    wait_for("founder to lead", || async { leader.membership().is_leader().await }).await;

    let monitor = MonitorConfig::new("spread", 60, 2);
    let monitor_id = monitor.id;
    assert!(leader.upsert_monitor(monitor).await.unwrap());
    leader.scheduler().run_pass().await;
    assert_eq!(
        leader.effective_assignment(monitor_id).await.unwrap().worker_ids.len(),
        1,
        "only the leader exists yet"
    );

    let joiner = spawn_node(&transport, "10.2.0.2:7071", &[]).await;
    joiner.membership().seed_peer("10.2.0.1:7071").await;
    joiner.start();

    // The MemberAdded event must produce a two-worker assignment after the
    // debounce window (2x connection timeout) without a manual pass
    wait_for("rebalance after join", || async {
        leader
            .effective_assignment(monitor_id)
            .await
            .map(|a| a.worker_ids.len() == 2)
            .unwrap_or(false)
    })
    .await;
}
