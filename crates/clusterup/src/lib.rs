//! ClusterUP - cluster coordination core for distributed uptime monitoring
//!
//! This library provides the control plane of a cooperating cluster of
//! monitoring nodes: a replicated command log, cluster membership, workload
//! scheduling and quorum-decided status timelines.

pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod log;
pub mod membership;
pub mod monitor;
pub mod node;
pub mod probe;
pub mod proto;
pub mod replicator;
pub mod scheduler;
pub mod store;
pub mod timeline;
pub mod transport;

// Re-export main types
pub use command::ClusterCommand;
pub use config::ClusterConfig;
pub use error::ClusterError;
pub use events::{ClusterEvent, EventBus};
pub use log::{LogEntry, ReplicatedLog};
pub use membership::{Availability, ClusterMember, ClusterMembership};
pub use monitor::MonitorConfig;
pub use node::ClusterNode;
pub use probe::ServiceStatus;
pub use proto::{ClusterRequest, ClusterResponse};
pub use replicator::MessageReplicator;
pub use scheduler::{TaskAssignment, WorkloadScheduler};
pub use timeline::StatusTimelineCoordinator;

/// ClusterUP result type
pub type Result<T> = std::result::Result<T, error::ClusterError>;

/// The version of the ClusterUP protocol
pub const PROTOCOL_VERSION: &str = "1.0";

/// Log length above which a commit triggers automatic compaction
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 100;
