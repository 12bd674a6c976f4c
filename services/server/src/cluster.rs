//! Cluster abstraction consumed by the listener supervisor.
//!
//! The contract is deliberately narrow: leadership status, membership,
//! per-listener ownership, and an event stream. The standalone provider
//! covers single-node deployments; fleet backends plug in behind the same
//! trait.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterEvent {
    BecameLeader,
    LostLeadership,
    MemberJoined,
    MemberLeft,
}

/// Minimal cluster contract.
///
/// Event callbacks must never block a session worker; subscribers only set
/// flags and enqueue stop requests.
pub trait ClusterProvider: Send + Sync {
    fn is_cluster_enabled(&self) -> bool;
    fn is_leader(&self) -> bool;
    fn is_connected(&self) -> bool;
    fn node_name(&self) -> String;
    fn cluster_members(&self) -> Vec<String>;

    /// Try to take ownership of a listener name. Exactly one node in the
    /// fleet holds a given name at any instant.
    fn acquire_server_ownership(&self, name: &str) -> bool;
    fn release_server_ownership(&self, name: &str);
    fn server_owner(&self, name: &str) -> Option<String>;

    /// Subscribe to cluster events.
    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent>;
}

// ---------------------------------------------------------------------------
// Standalone provider
// ---------------------------------------------------------------------------

/// Single-node provider: cluster disabled, always leader, single member.
/// Ownership is still tracked locally so two concurrent starts of the same
/// listener name serialize exactly as they would in a fleet.
pub struct StandaloneCluster {
    node: String,
    owners: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<ClusterEvent>,
}

impl StandaloneCluster {
    pub fn new(node: &str) -> Self {
        let (events, _) = broadcast::channel(16);
        StandaloneCluster {
            node: node.to_owned(),
            owners: Mutex::new(HashMap::new()),
            events,
        }
    }
}

impl ClusterProvider for StandaloneCluster {
    fn is_cluster_enabled(&self) -> bool {
        false
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn node_name(&self) -> String {
        self.node.clone()
    }

    fn cluster_members(&self) -> Vec<String> {
        vec![self.node.clone()]
    }

    fn acquire_server_ownership(&self, name: &str) -> bool {
        let mut owners = self.owners.lock().expect("owner table poisoned");
        match owners.get(name) {
            Some(owner) if owner != &self.node => false,
            Some(_) => false, // already held, even by ourselves: starts serialize
            None => {
                owners.insert(name.to_owned(), self.node.clone());
                true
            }
        }
    }

    fn release_server_ownership(&self, name: &str) {
        self.owners
            .lock()
            .expect("owner table poisoned")
            .remove(name);
    }

    fn server_owner(&self, name: &str) -> Option<String> {
        self.owners
            .lock()
            .expect("owner table poisoned")
            .get(name)
            .cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_reports_single_leader_member() {
        let c = StandaloneCluster::new("node-a");
        assert!(!c.is_cluster_enabled());
        assert!(c.is_leader());
        assert!(c.is_connected());
        assert_eq!(c.cluster_members(), vec!["node-a".to_owned()]);
    }

    #[test]
    fn ownership_is_exclusive_until_released() {
        let c = StandaloneCluster::new("node-a");
        assert!(c.acquire_server_ownership("SRV1"));
        assert_eq!(c.server_owner("SRV1").as_deref(), Some("node-a"));
        // A second acquire loses the race, even on the same node.
        assert!(!c.acquire_server_ownership("SRV1"));
        c.release_server_ownership("SRV1");
        assert!(c.server_owner("SRV1").is_none());
        assert!(c.acquire_server_ownership("SRV1"));
    }
}
