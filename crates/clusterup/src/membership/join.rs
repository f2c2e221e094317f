//! Join protocol.
//!
//! Runs once per candidacy, debounced after membership events so that
//! propagation settles before the node decides how to join.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::ClusterMembership;
use crate::proto::{ClusterRequest, ClusterResponse, RequestKind};

/// Drive the join protocol until this node is part of a cluster or
/// shutdown is signalled.
pub(super) async fn run_join_loop(
    membership: Arc<ClusterMembership>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Debounce: wait for a quiet window; any membership event re-arms it
    loop {
        tokio::select! {
            _ = sleep(membership.config().debounce_window()) => break,
            _ = membership.join_nudge().notified() => continue,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("join loop cancelled by shutdown");
                    return;
                }
            }
        }
    }

    let remotes = membership.remote_members().await;

    if remotes.is_empty() {
        // Founder: no network action at all
        info!("no known peers, founding a single-node cluster");
        membership.found_cluster().await;
        return;
    }

    if membership.leader_endpoint().await.is_some() {
        debug!("leader already known, treating this node as joined");
        membership.mark_joined().await;
        return;
    }

    // Sweep the peer list until a join lands, a leader surfaces, or
    // shutdown cancels the loop
    loop {
        for peer in membership.remote_members().await {
            if *shutdown.borrow() {
                info!("join loop cancelled by shutdown");
                return;
            }

            match membership.send(&peer, join_request(&membership)).await {
                Ok(ClusterResponse::Joined { leader_endpoint }) => {
                    info!(leader = %leader_endpoint, "joined cluster");
                    membership.adopt_leader(&leader_endpoint).await;
                    membership.mark_joined().await;
                    return;
                }
                Ok(ClusterResponse::Redirect { leader_endpoint }) => {
                    debug!(leader = %leader_endpoint, "join redirected to leader");
                    membership.adopt_leader(&leader_endpoint).await;
                }
                Ok(other) => {
                    debug!(peer = %peer.endpoint, response = ?other, "join attempt declined");
                }
                Err(error) => {
                    warn!(peer = %peer.endpoint, "join attempt failed: {error}");
                }
            }

            if let Some(leader) = membership.leader_member().await {
                // A leader surfaced while sweeping; address it directly
                // and stop the sweep either way
                match membership.send(&leader, join_request(&membership)).await {
                    Ok(ClusterResponse::Joined { leader_endpoint }) => {
                        info!(leader = %leader_endpoint, "joined cluster");
                        membership.adopt_leader(&leader_endpoint).await;
                    }
                    Ok(other) => {
                        debug!(response = ?other, "leader declined join, assuming membership will replicate")
                    }
                    Err(error) => {
                        warn!("join to surfaced leader failed: {error}");
                    }
                }
                membership.mark_joined().await;
                return;
            }
        }

        tokio::select! {
            _ = sleep(membership.config().connection_timeout) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("join loop cancelled by shutdown");
                    return;
                }
            }
        }
    }
}

fn join_request(membership: &ClusterMembership) -> ClusterRequest {
    ClusterRequest::new(
        membership.local_endpoint(),
        RequestKind::JoinCluster {
            endpoint: membership.local_endpoint().to_string(),
            member_id: membership.member_id().to_string(),
            tags: membership.local_tags().clone(),
        },
    )
}
