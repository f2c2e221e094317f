//! Cluster event bus.
//!
//! Coordinators communicate through an injected broadcast bus instead of
//! global multicast state; each subsystem holds its own receiver.

use tokio::sync::broadcast;
use tracing::debug;

use crate::command::ClusterCommand;
use crate::membership::{Availability, ClusterMember};

/// Events observable by every subsystem on a node
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A member appeared in the directory
    MemberAdded(ClusterMember),

    /// A member left the directory
    MemberRemoved(ClusterMember),

    /// A member's availability flipped
    MemberStatusChanged {
        endpoint: String,
        availability: Availability,
    },

    /// Leadership moved; `leader_endpoint` is None when no leader is known
    LeaderChanged { leader_endpoint: Option<String> },

    /// A replicated command was applied on this node
    ReplicatedMessage(ClusterCommand),

    /// Fires once, the first time a single-node cluster founds itself
    Initialized,

    /// The cluster has a known leader and a drained replication queue
    Operational,
}

impl ClusterEvent {
    /// Short tag for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterEvent::MemberAdded(_) => "member_added",
            ClusterEvent::MemberRemoved(_) => "member_removed",
            ClusterEvent::MemberStatusChanged { .. } => "member_status_changed",
            ClusterEvent::LeaderChanged { .. } => "leader_changed",
            ClusterEvent::ReplicatedMessage(_) => "replicated_message",
            ClusterEvent::Initialized => "initialized",
            ClusterEvent::Operational => "operational",
        }
    }
}

/// Broadcast bus carrying [`ClusterEvent`]s between subsystems
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClusterEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }

    /// Publish an event.
    // Ignore errors if there are no receivers
    pub fn publish(&self, event: ClusterEvent) {
        debug!(kind = event.kind(), "publishing cluster event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
