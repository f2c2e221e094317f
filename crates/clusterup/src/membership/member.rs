//! Cluster member model.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Availability state of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Available,
    Unavailable,
    Unknown,
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Availability::Available => write!(f, "available"),
            Availability::Unavailable => write!(f, "unavailable"),
            Availability::Unknown => write!(f, "unknown"),
        }
    }
}

/// A known cluster member.
///
/// The id may be empty until the member identifies itself; once it does,
/// the directory replaces the record rather than mutating it in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Stable member id; None while reachable but unidentified
    pub id: Option<String>,

    /// Network endpoint the member answers on
    pub endpoint: String,

    /// Capability tags used for monitor qualification
    pub tags: BTreeSet<String>,

    pub availability: Availability,

    /// At most one member carries this at a time
    pub is_leader: bool,

    /// Exactly one member is the local node
    pub is_local: bool,

    /// Latest sampled load estimate, if any
    pub avg_cpu_load: Option<f64>,
}

impl ClusterMember {
    /// Create a record for a remote member on first contact
    pub fn remote(endpoint: impl Into<String>) -> Self {
        Self {
            id: None,
            endpoint: endpoint.into(),
            tags: BTreeSet::new(),
            availability: Availability::Unknown,
            is_leader: false,
            is_local: false,
            avg_cpu_load: None,
        }
    }

    /// Create the record for the local node
    pub fn local(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            endpoint: endpoint.into(),
            tags: BTreeSet::new(),
            availability: Availability::Available,
            is_leader: false,
            is_local: true,
            avg_cpu_load: None,
        }
    }

    pub fn with_tags(mut self, tags: BTreeSet<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Whether this member can currently take work
    pub fn is_available(&self) -> bool {
        self.availability == Availability::Available
    }
}
