//! Request gating.
//!
//! Two gates sit in front of a node's request handling: leader-only
//! requests are redirected to the current leader when answered by a
//! follower, and externally-facing traffic is refused until the cluster
//! is operational.

/// Outcome of vetting a request against the gates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Handle the request locally
    Proceed,

    /// Temporary redirect to the current leader
    Redirect { leader_endpoint: String },

    /// No leader known, or the cluster is not operational yet
    Unavailable,
}

/// Vet a leader-only request on this node
pub fn leader_gate(
    leader_only: bool,
    local_is_leader: bool,
    leader_endpoint: Option<&str>,
) -> GateDecision {
    if !leader_only || local_is_leader {
        return GateDecision::Proceed;
    }
    match leader_endpoint {
        Some(endpoint) => GateDecision::Redirect { leader_endpoint: endpoint.to_string() },
        None => GateDecision::Unavailable,
    }
}

/// Vet externally-facing traffic; admitted only once the cluster is
/// operational
pub fn operational_gate(operational: bool) -> GateDecision {
    if operational {
        GateDecision::Proceed
    } else {
        GateDecision::Unavailable
    }
}
