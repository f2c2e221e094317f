//! Member directory.
//!
//! Owns the map of known members, keyed by endpoint. All mutation goes
//! through ClusterMembership's protocol handlers; every change is
//! published on the event bus.

use std::collections::HashMap;

use tracing::{debug, info};

use super::member::{Availability, ClusterMember};
use crate::events::{ClusterEvent, EventBus};

/// Directory of known cluster members
pub struct MemberDirectory {
    members: HashMap<String, ClusterMember>,
    bus: EventBus,
}

impl MemberDirectory {
    pub fn new(bus: EventBus) -> Self {
        Self { members: HashMap::new(), bus }
    }

    pub fn get(&self, endpoint: &str) -> Option<&ClusterMember> {
        self.members.get(endpoint)
    }

    pub fn list(&self) -> Vec<ClusterMember> {
        self.members.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn local(&self) -> Option<&ClusterMember> {
        self.members.values().find(|m| m.is_local)
    }

    pub fn leader(&self) -> Option<&ClusterMember> {
        self.members.values().find(|m| m.is_leader)
    }

    pub fn remote_members(&self) -> Vec<ClusterMember> {
        self.members.values().filter(|m| !m.is_local).cloned().collect()
    }

    /// Members currently able to take work
    pub fn available_members(&self) -> Vec<ClusterMember> {
        self.members.values().filter(|m| m.is_available()).cloned().collect()
    }

    /// Insert a member record; fires MemberAdded
    pub fn insert(&mut self, member: ClusterMember) {
        info!(endpoint = %member.endpoint, id = ?member.id, "member added");
        self.members.insert(member.endpoint.clone(), member.clone());
        self.bus.publish(ClusterEvent::MemberAdded(member));
    }

    /// Remove a member record; fires MemberRemoved
    pub fn remove(&mut self, endpoint: &str) -> Option<ClusterMember> {
        let removed = self.members.remove(endpoint);
        if let Some(member) = &removed {
            info!(endpoint = %member.endpoint, "member removed");
            self.bus.publish(ClusterEvent::MemberRemoved(member.clone()));
        }
        removed
    }

    /// Populate the id of a previously unidentified member.
    ///
    /// Replace-not-mutate: the old record is removed and a new one added,
    /// so both events fire and downstream keyed state resets cleanly.
    pub fn assign_id(&mut self, endpoint: &str, id: impl Into<String>) {
        let Some(existing) = self.remove(endpoint) else {
            return;
        };
        self.insert(existing.with_id(id));
    }

    /// Flip a member's availability; fires MemberStatusChanged on change
    pub fn set_availability(&mut self, endpoint: &str, availability: Availability) {
        let Some(member) = self.members.get_mut(endpoint) else {
            return;
        };
        if member.availability == availability {
            return;
        }
        debug!(endpoint, %availability, "member availability changed");
        member.availability = availability;
        self.bus.publish(ClusterEvent::MemberStatusChanged {
            endpoint: endpoint.to_string(),
            availability,
        });
    }

    /// Record a member's sampled load estimate
    pub fn set_avg_cpu_load(&mut self, endpoint: &str, avg_cpu_load: Option<f64>) {
        if let Some(member) = self.members.get_mut(endpoint) {
            member.avg_cpu_load = avg_cpu_load;
        }
    }

    /// Move the leader flag to `endpoint` (or clear it); fires
    /// LeaderChanged when the leader actually moved
    pub fn set_leader(&mut self, endpoint: Option<&str>) {
        let previous = self.leader().map(|m| m.endpoint.clone());
        if previous.as_deref() == endpoint {
            return;
        }
        for member in self.members.values_mut() {
            member.is_leader = Some(member.endpoint.as_str()) == endpoint;
        }
        info!(leader = ?endpoint, "leader changed");
        self.bus.publish(ClusterEvent::LeaderChanged {
            leader_endpoint: endpoint.map(str::to_string),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> (MemberDirectory, tokio::sync::broadcast::Receiver<ClusterEvent>) {
        let bus = EventBus::default();
        let rx = bus.subscribe();
        (MemberDirectory::new(bus), rx)
    }

    #[test]
    fn test_assign_id_replaces_record() {
        let (mut dir, mut rx) = directory();
        dir.insert(ClusterMember::remote("10.0.0.2:7071"));
        dir.assign_id("10.0.0.2:7071", "node-b");

        assert_eq!(dir.get("10.0.0.2:7071").unwrap().id.as_deref(), Some("node-b"));

        // Added, then removed, then re-added with the id
        assert!(matches!(rx.try_recv().unwrap(), ClusterEvent::MemberAdded(_)));
        assert!(matches!(rx.try_recv().unwrap(), ClusterEvent::MemberRemoved(_)));
        match rx.try_recv().unwrap() {
            ClusterEvent::MemberAdded(member) => {
                assert_eq!(member.id.as_deref(), Some("node-b"))
            }
            other => panic!("unexpected event {}", other.kind()),
        }
    }

    #[test]
    fn test_leader_flag_is_exclusive() {
        let (mut dir, _rx) = directory();
        dir.insert(ClusterMember::remote("a:1"));
        dir.insert(ClusterMember::remote("b:1"));

        dir.set_leader(Some("a:1"));
        dir.set_leader(Some("b:1"));

        let leaders: Vec<_> = dir.list().into_iter().filter(|m| m.is_leader).collect();
        assert_eq!(leaders.len(), 1);
        assert_eq!(leaders[0].endpoint, "b:1");
    }

    #[test]
    fn test_availability_change_fires_once() {
        let (mut dir, mut rx) = directory();
        dir.insert(ClusterMember::remote("a:1"));
        let _ = rx.try_recv();

        dir.set_availability("a:1", Availability::Available);
        dir.set_availability("a:1", Availability::Available);

        assert!(matches!(
            rx.try_recv().unwrap(),
            ClusterEvent::MemberStatusChanged { .. }
        ));
        assert!(rx.try_recv().is_err(), "no duplicate event for a no-op flip");
    }
}
