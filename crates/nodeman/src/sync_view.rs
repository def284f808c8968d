//! Narrow view of the registry for the list-sync component.

use std::net::{IpAddr, SocketAddr};

use crate::registry::NodeRegistry;

/// What a list-sync driver may observe and trigger, and nothing more.
pub trait SyncView: Send + Sync {
    fn node_count(&self) -> usize;
    fn seen_broadcast_count(&self) -> usize;
    fn seen_ping_count(&self) -> usize;

    /// Whether we asked `peer` for the full list and the cooldown has not
    /// expired.
    fn was_asked_recently(&self, peer: IpAddr) -> bool;

    /// Asks `peer` for the full list. Returns `false` inside the cooldown.
    fn request_full_list(&self, peer: SocketAddr) -> bool;
}

impl SyncView for NodeRegistry {
    fn node_count(&self) -> usize {
        self.size()
    }

    fn seen_broadcast_count(&self) -> usize {
        self.state.lock().seen_broadcasts.len()
    }

    fn seen_ping_count(&self) -> usize {
        self.state.lock().seen_pings.len()
    }

    fn was_asked_recently(&self, peer: IpAddr) -> bool {
        let now = self.now();
        self.state
            .lock()
            .we_asked_for_list
            .get(&peer)
            .is_some_and(|until| now < *until)
    }

    fn request_full_list(&self, peer: SocketAddr) -> bool {
        self.dseg_update(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::TestHarness;
    use crate::DSEG_UPDATE_SECONDS;
    use noir_common::NodeMessage;

    const T0: u64 = 1_700_000_000;

    #[test]
    fn test_full_list_request_is_throttled() {
        let h = TestHarness::new(T0, 200);
        let view: &dyn SyncView = &h.registry;
        let peer: SocketAddr = "198.51.100.20:8168".parse().expect("addr");

        assert!(!view.was_asked_recently(peer.ip()));
        assert!(view.request_full_list(peer));
        assert!(view.was_asked_recently(peer.ip()));
        assert!(!view.request_full_list(peer));
        assert_eq!(h.transport.sent(), vec![(peer, NodeMessage::ListRequest(None))]);

        h.clock.advance(DSEG_UPDATE_SECONDS);
        assert!(!view.was_asked_recently(peer.ip()));
        assert!(view.request_full_list(peer));
        assert_eq!(h.transport.sent().len(), 2);
    }

    #[test]
    fn test_counts() {
        let h = TestHarness::new(T0, 200);
        let view: &dyn SyncView = &h.registry;
        assert_eq!(view.node_count(), 0);
        assert_eq!(view.seen_broadcast_count(), 0);
        assert_eq!(view.seen_ping_count(), 0);
    }
}
