//! Governance hooks.
//!
//! The registry tracks which governance objects each node voted on so the
//! votes can be invalidated when the node disappears. Hashes of affected
//! objects collect in a dirty list that the governance component drains.

use noir_common::{Hash256, NodeIdentity};
use tracing::debug;

use crate::registry::NodeRegistry;

impl NodeRegistry {
    /// Records a vote by `identity` on `hash`. Returns `false` for an
    /// unknown node.
    pub fn add_governance_vote(&self, identity: &NodeIdentity, hash: Hash256) -> bool {
        let mut st = self.state.lock();
        match st.find_mut(identity) {
            Some(record) => {
                record.add_governance_vote(hash);
                true
            }
            None => false,
        }
    }

    /// Forgets `hash` on every node.
    pub fn remove_governance_object(&self, hash: &Hash256) {
        let mut st = self.state.lock();
        for record in st.nodes.iter_mut() {
            record.remove_governance_object(hash);
        }
    }

    pub fn add_dirty_governance_object_hash(&self, hash: Hash256) {
        self.state.lock().dirty_governance_hashes.push(hash);
    }

    /// Drains the dirty list in one step.
    pub fn get_and_clear_dirty_governance_object_hashes(&self) -> Vec<Hash256> {
        std::mem::take(&mut self.state.lock().dirty_governance_hashes)
    }

    /// Delivers pending added/removed notifications.
    ///
    /// The flags are taken under the lock; the notifier is called after it
    /// is released so it may call back into the registry.
    pub fn notify_node_updates(&self) {
        let (added, removed) = {
            let mut st = self.state.lock();
            (std::mem::take(&mut st.nodes_added), std::mem::take(&mut st.nodes_removed))
        };
        if added || removed {
            debug!(added, removed, "notifying governance");
        }
        if added {
            self.notifier.nodes_added();
        }
        if removed {
            self.notifier.nodes_removed();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::mock::{node_record, TestHarness};
    use noir_common::NodeIdentity;

    const T0: u64 = 1_700_000_000;

    fn id(n: u8) -> NodeIdentity {
        NodeIdentity::new([n; 32], 0)
    }

    #[test]
    fn test_votes_follow_nodes() {
        let h = TestHarness::new(T0, 200);
        h.registry.add(node_record(id(1), T0));
        assert!(h.registry.add_governance_vote(&id(1), [7u8; 32]));
        assert!(!h.registry.add_governance_vote(&id(2), [7u8; 32]));
        assert_eq!(h.registry.find(&id(1)).expect("node").governance_votes.len(), 1);

        h.registry.remove_governance_object(&[7u8; 32]);
        assert!(h.registry.find(&id(1)).expect("node").governance_votes.is_empty());
    }

    #[test]
    fn test_dirty_hashes_drain_once() {
        let h = TestHarness::new(T0, 200);
        h.registry.add_dirty_governance_object_hash([1u8; 32]);
        h.registry.add_dirty_governance_object_hash([2u8; 32]);
        assert_eq!(
            h.registry.get_and_clear_dirty_governance_object_hashes(),
            vec![[1u8; 32], [2u8; 32]]
        );
        assert!(h.registry.get_and_clear_dirty_governance_object_hashes().is_empty());
    }

    #[test]
    fn test_notifications_are_edge_triggered() {
        let h = TestHarness::new(T0, 200);
        h.registry.add(node_record(id(1), T0));
        h.registry.notify_node_updates();
        h.registry.notify_node_updates();
        assert_eq!(h.notifier.added(), 1);
        assert_eq!(h.notifier.removed(), 0);

        h.chain.set_spent(id(1));
        h.registry.check_and_remove();
        h.registry.notify_node_updates();
        assert_eq!(h.notifier.removed(), 1);
    }

    #[test]
    fn test_notifier_may_reenter_registry() {
        use crate::transport::GovernanceNotifier;
        use std::sync::{Arc, Mutex};

        struct Reentrant(Mutex<Option<Arc<crate::NodeRegistry>>>);
        impl GovernanceNotifier for Reentrant {
            fn nodes_added(&self) {
                if let Some(registry) = self.0.lock().expect("lock").as_ref() {
                    let _ = registry.size();
                }
            }
            fn nodes_removed(&self) {}
        }

        let notifier = Arc::new(Reentrant(Mutex::new(None)));
        let h = TestHarness::with_notifier(T0, 200, notifier.clone());
        let registry = Arc::new(h.registry);
        *notifier.0.lock().expect("lock") = Some(registry.clone());
        registry.add(node_record(id(1), T0));
        registry.notify_node_updates();
        // break the cycle
        *notifier.0.lock().expect("lock") = None;
    }
}
