//! # Quorum Recovery
//!
//! A node stuck in NEW_START_REQUIRED may have been revived by a broadcast
//! we missed. The registry asks up to `MNB_RECOVERY_QUORUM_TOTAL` enabled
//! peers for the node's current broadcast and re-applies it only when at
//! least `MNB_RECOVERY_QUORUM_REQUIRED` of them answer with the same
//! broadcast (same hash) carrying a strictly newer ping than the copy we
//! hold.
//!
//! ```text
//!  open ──(deadline: +60s)──▶ resolve: >= 6 replies → re-feed first reply
//!    ▲                                    <  6 replies → drop replies
//!    └────────(request kept until deadline + retry window)────┘
//! ```
//!
//! Requests are queued per peer address and drained by
//! `NodeRegistry::run_scheduled_connections`, one temporary connection per
//! address.

use noir_common::{Hash256, NodeBroadcast, NodeIdentity, NodeState};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info};

use crate::record::NodeRecord;
use crate::registry::{NodeRegistry, RegistryState};
use crate::transport::Action;
use crate::{
    MNB_RECOVERY_MAX_ASK_ENTRIES, MNB_RECOVERY_QUORUM_REQUIRED, MNB_RECOVERY_QUORUM_TOTAL,
    MNB_RECOVERY_RETRY_SECONDS, MNB_RECOVERY_WAIT_SECONDS,
};

/// One open recovery round for a broadcast hash.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    /// Replies are accepted strictly before this time.
    pub deadline: u64,
    /// Peers still expected to answer. Each peer is counted once.
    pub asked: BTreeSet<IpAddr>,
}

impl RecoveryRequest {
    #[must_use]
    pub fn is_open(&self, now: u64) -> bool {
        now < self.deadline
    }

    /// The request may be dropped and the node asked about again.
    #[must_use]
    pub fn retry_window_elapsed(&self, now: u64) -> bool {
        now.saturating_sub(self.deadline) > MNB_RECOVERY_RETRY_SECONDS
    }
}

impl NodeRegistry {
    /// Whether a recovery round exists for the broadcast `hash`.
    pub fn is_recovery_requested(&self, hash: &Hash256) -> bool {
        self.state.lock().recovery_requests.contains_key(hash)
    }

    /// Next address to connect to and every broadcast hash queued for it.
    ///
    /// Requests are served in the order they were scheduled; later entries
    /// for the same address are folded into the first.
    pub fn pop_scheduled_mnb_request_connection(&self) -> Option<(SocketAddr, BTreeSet<Hash256>)> {
        let mut st = self.state.lock();
        let (addr, first) = st.scheduled_requests.pop_front()?;
        let mut hashes = BTreeSet::from([first]);
        st.scheduled_requests.retain(|(a, h)| {
            if *a == addr {
                hashes.insert(*h);
                false
            } else {
                true
            }
        });
        Some((addr, hashes))
    }

    /// Opens a recovery round for up to `MNB_RECOVERY_MAX_ASK_ENTRIES`
    /// NEW_START_REQUIRED nodes that have none yet.
    ///
    /// Peers are taken from the enabled-node ranking at a random height so
    /// that the same nodes are not always asked.
    pub(crate) fn open_recovery_requests_locked(&self, st: &mut RegistryState, now: u64) {
        let Some(tip) = self.chain.best_height() else {
            return;
        };
        let pending: Vec<(NodeIdentity, Hash256)> = st
            .nodes
            .iter()
            .filter(|r| r.state == NodeState::NewStartRequired)
            .map(|r| (r.identity, r.broadcast_hash()))
            .filter(|(_, hash)| !st.recovery_requests.contains_key(hash))
            .collect();
        if pending.is_empty() {
            return;
        }

        let height = rand::thread_rng().gen_range(0..tip.max(1));
        let candidates: Vec<SocketAddr> = self
            .ranked_positions_locked(st, height, 0, true)
            .into_iter()
            .map(|pos| st.nodes[pos].addr)
            .filter(|addr| self.local.as_ref().map_or(true, |l| l.addr != *addr))
            .collect();

        let mut budget = MNB_RECOVERY_MAX_ASK_ENTRIES;
        for (identity, hash) in pending {
            if budget == 0 {
                break;
            }
            let already_asked = st.we_asked_for_list_entry.get(&identity);
            let mut asked = BTreeSet::new();
            for addr in &candidates {
                if asked.len() >= MNB_RECOVERY_QUORUM_TOTAL {
                    break;
                }
                if already_asked.is_some_and(|peers| peers.contains_key(&addr.ip())) {
                    continue;
                }
                if asked.insert(addr.ip()) {
                    st.scheduled_requests.push_back((*addr, hash));
                }
            }
            if !asked.is_empty() {
                budget -= 1;
                info!(node = %identity, peers = asked.len(), "recovery initiated");
            }
            st.recovery_requests.insert(
                hash,
                RecoveryRequest { deadline: now + MNB_RECOVERY_WAIT_SECONDS, asked },
            );
        }
    }

    /// Counts a duplicate broadcast from `peer` toward an open recovery
    /// round, and re-applies it as soon as the quorum is reached.
    pub(crate) fn collect_recovery_reply_locked(
        &self,
        st: &mut RegistryState,
        peer: SocketAddr,
        hash: &Hash256,
        mnb: &NodeBroadcast,
        now: u64,
        actions: &mut Vec<Action>,
    ) {
        let Some(request) = st.recovery_requests.get_mut(hash) else {
            return;
        };
        if !request.is_open(now) || !request.asked.remove(&peer.ip()) {
            return;
        }

        let seen_ping = st
            .seen_broadcasts
            .get(hash)
            .and_then(|(_, b)| b.last_ping.as_ref())
            .map(|p| p.sig_time);
        let reply_ping = mnb.last_ping.as_ref().map(|p| p.sig_time);
        if reply_ping.is_none() || reply_ping <= seen_ping {
            debug!(%peer, node = %mnb.identity, "recovery reply has no newer ping");
            return;
        }

        let mut simulated = NodeRecord::from_broadcast(mnb);
        let ctx = self.check_ctx(st, now);
        simulated.check(&ctx, true);
        if !simulated.state.is_live() {
            debug!(%peer, node = %mnb.identity, state = %simulated.state, "recovery reply is not usable");
            return;
        }

        let replies = st.recovery_good_replies.entry(*hash).or_default();
        replies.push(mnb.clone());
        debug!(%peer, node = %mnb.identity, good = replies.len(), "recovery reply counted");
        if replies.len() >= MNB_RECOVERY_QUORUM_REQUIRED {
            if let Some(replies) = st.recovery_good_replies.remove(hash) {
                self.apply_recovered_locked(st, replies, actions);
            }
        }
    }

    /// Resolves every round whose deadline has passed.
    pub(crate) fn process_recovery_replies_locked(
        &self,
        st: &mut RegistryState,
        now: u64,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let due: Vec<Hash256> = st
            .recovery_good_replies
            .keys()
            .filter(|hash| {
                st.recovery_requests
                    .get(*hash)
                    .map_or(true, |req| !req.is_open(now))
            })
            .copied()
            .collect();

        for hash in due {
            let Some(replies) = st.recovery_good_replies.remove(&hash) else {
                continue;
            };
            if replies.len() >= MNB_RECOVERY_QUORUM_REQUIRED {
                self.apply_recovered_locked(st, replies, &mut actions);
            } else {
                debug!(hash = %hex::encode(hash), good = replies.len(), "recovery timed out");
            }
        }
        actions
    }

    fn apply_recovered_locked(
        &self,
        st: &mut RegistryState,
        replies: Vec<NodeBroadcast>,
        actions: &mut Vec<Action>,
    ) {
        let Some(mut mnb) = replies.into_iter().next() else {
            return;
        };
        mnb.recovery = true;
        let identity = mnb.identity;
        match self.check_mnb_and_update_list_locked(st, None, mnb, actions) {
            Ok(outcome) => info!(node = %identity, ?outcome, "recovered node from quorum"),
            Err(e) => debug!(node = %identity, "quorum broadcast rejected: {}", e),
        }
    }
}
