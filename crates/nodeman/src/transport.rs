//! Outbound seams: peer transport and governance notification.
//!
//! The registry never calls these while holding its lock. Work produced
//! under the lock is queued as [`Action`]s and executed by
//! [`NodeRegistry::dispatch`] afterwards.

use noir_common::{InventoryItem, NodeMessage};
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::registry::NodeRegistry;

/// Connection layer used by the registry.
pub trait Transport: Send + Sync {
    /// Unicast to an already connected peer.
    fn send(&self, peer: SocketAddr, message: NodeMessage);

    /// Announce inventory to every connected peer.
    fn relay(&self, item: InventoryItem);

    /// Opens a temporary outbound connection. Returns `false` on failure.
    fn connect(&self, addr: SocketAddr) -> bool;

    fn disconnect(&self, addr: SocketAddr);
}

/// Receives edge-triggered registry change notifications.
pub trait GovernanceNotifier: Send + Sync {
    fn nodes_added(&self);
    fn nodes_removed(&self);
}

/// Outbound work scheduled under the registry lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Send { peer: SocketAddr, message: NodeMessage },
    Relay(InventoryItem),
    /// Open a temporary connection, then send every message on it.
    ConnectAndSend { addr: SocketAddr, messages: Vec<NodeMessage> },
    Disconnect(SocketAddr),
}

impl NodeRegistry {
    /// Executes queued actions. Must be called without the state lock.
    pub(crate) fn dispatch(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { peer, message } => {
                    debug!(%peer, command = message.command(), "send");
                    self.transport.send(peer, message);
                }
                Action::Relay(item) => self.transport.relay(item),
                Action::ConnectAndSend { addr, messages } => {
                    if !self.transport.connect(addr) {
                        warn!(%addr, "can't connect to node");
                        continue;
                    }
                    for message in messages {
                        self.transport.send(addr, message);
                    }
                }
                Action::Disconnect(addr) => self.transport.disconnect(addr),
            }
        }
    }

    /// Closes the temporary connections opened for recovery and
    /// verification.
    pub fn process_node_connections(&self) {
        let actions: Vec<Action> = {
            let mut st = self.state.lock();
            std::mem::take(&mut st.temp_connections)
                .into_iter()
                .map(Action::Disconnect)
                .collect()
        };
        self.dispatch(actions);
    }

    /// Drains the scheduled recovery connections: one connection per
    /// address, asking for every broadcast hash queued for it.
    pub fn run_scheduled_connections(&self) {
        let mut actions = Vec::new();
        while let Some((addr, hashes)) = self.pop_scheduled_mnb_request_connection() {
            let messages = hashes
                .into_iter()
                .map(|h| NodeMessage::GetData(InventoryItem::Broadcast(h)))
                .collect();
            self.state.lock().temp_connections.insert(addr);
            actions.push(Action::ConnectAndSend { addr, messages });
        }
        self.dispatch(actions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::TestHarness;

    const T0: u64 = 1_700_000_000;

    #[test]
    fn test_connect_failure_skips_sends() {
        let h = TestHarness::new(T0, 200);
        let addr: SocketAddr = "203.0.113.50:8168".parse().expect("addr");
        h.transport.refuse_connections(true);
        h.registry.dispatch(vec![Action::ConnectAndSend {
            addr,
            messages: vec![NodeMessage::ListCount(1)],
        }]);
        assert!(h.transport.sent().is_empty());
        assert_eq!(h.transport.connected(), vec![addr]);
    }

    #[test]
    fn test_scheduled_connections_become_temporary() {
        let h = TestHarness::new(T0, 200);
        let a: SocketAddr = "203.0.113.51:8168".parse().expect("addr");
        {
            let mut st = h.registry.state.lock();
            st.scheduled_requests.push_back((a, [1u8; 32]));
            st.scheduled_requests.push_back((a, [2u8; 32]));
        }
        h.registry.run_scheduled_connections();
        assert_eq!(h.transport.connected(), vec![a]);
        assert_eq!(h.transport.sent().len(), 2);

        h.registry.process_node_connections();
        assert_eq!(h.transport.disconnected(), vec![a]);
        h.registry.process_node_connections();
        assert_eq!(h.transport.disconnected().len(), 1);
    }
}
