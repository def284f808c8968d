//! # Gossip Acceptance
//!
//! Entry point for decoded peer messages and the acceptance rules for
//! broadcasts, pings, list requests and inventory.
//!
//! ## Duplicate Suppression
//!
//! Every broadcast and ping is looked up by hash in its seen map before any
//! signature is checked. A hit returns [`GossipOutcome::AlreadySeen`]
//! without touching records and without queueing outbound traffic; the only
//! exception is a reply to one of our own recovery requests, which is
//! counted toward that request's quorum.
//!
//! ## Replay
//!
//! A broadcast whose `sig_time` is not strictly newer than the one in
//! effect for the same identity is rejected, whatever its signature. The
//! registry's own quorum re-feed (the `recovery` flag, never read from the
//! wire) may repeat the current `sig_time`.

use noir_common::{
    Hash256, InventoryItem, NodeBroadcast, NodeIdentity, NodeMessage, NodePing, NodeState,
    ZERO_HASH,
};
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info, warn};

use crate::error::{GossipError, GossipOutcome};
use crate::record::NodeRecord;
use crate::registry::{NodeRegistry, RegistryState};
use crate::transport::Action;
use crate::DSEG_UPDATE_SECONDS;

/// Private, loopback and link-local addresses.
pub(crate) fn is_local_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

pub(crate) fn is_valid_node_addr(addr: &SocketAddr, allow_local: bool) -> bool {
    let ip = addr.ip();
    if addr.port() == 0 || ip.is_unspecified() || ip.is_multicast() {
        return false;
    }
    allow_local || !is_local_ip(&ip)
}

impl NodeRegistry {
    // ════════════════════════════════════════════════════════════════════════════
    // DISPATCH
    // ════════════════════════════════════════════════════════════════════════════

    /// Handles one inbound message from `peer`.
    ///
    /// On `Err`, the caller applies [`GossipError::misbehavior`] to the peer.
    pub fn process_message(&self, peer: SocketAddr, message: NodeMessage) -> Result<(), GossipError> {
        let command = message.command();
        let result = match message {
            NodeMessage::Broadcast(mnb) => self.check_mnb_and_update_list(Some(peer), mnb).map(|_| ()),
            NodeMessage::Ping(mnp) => self.process_ping(peer, mnp).map(|_| ()),
            NodeMessage::Verify(mnv) => self.process_verify(peer, mnv),
            NodeMessage::ListRequest(target) => self.process_list_request(peer, target).map(|_| ()),
            NodeMessage::GetData(item) => {
                self.process_get_data(peer, item);
                Ok(())
            }
            NodeMessage::Inventory(items) => {
                self.process_inventory(peer, &items);
                Ok(())
            }
            NodeMessage::ListCount(count) => {
                debug!(%peer, count, "peer advertised node list");
                Ok(())
            }
        };
        if let Err(e) = &result {
            if e.misbehavior() > 0 {
                warn!(%peer, command, score = e.misbehavior(), "rejected: {}", e);
            } else {
                debug!(%peer, command, "ignored: {}", e);
            }
        }
        result
    }

    // ════════════════════════════════════════════════════════════════════════════
    // BROADCASTS
    // ════════════════════════════════════════════════════════════════════════════

    /// Full validation gate for a broadcast, then merge into the registry.
    ///
    /// `from` is the relaying peer, `None` for locally originated input.
    pub fn check_mnb_and_update_list(
        &self,
        from: Option<SocketAddr>,
        mnb: NodeBroadcast,
    ) -> Result<GossipOutcome, GossipError> {
        let mut actions = Vec::new();
        let (result, added) = {
            let mut st = self.state.lock();
            let result = self.check_mnb_and_update_list_locked(&mut st, from, mnb, &mut actions);
            (result, st.nodes_added)
        };
        self.dispatch(actions);
        if added {
            self.notify_node_updates();
        }
        result
    }

    pub(crate) fn check_mnb_and_update_list_locked(
        &self,
        st: &mut RegistryState,
        from: Option<SocketAddr>,
        mnb: NodeBroadcast,
        actions: &mut Vec<Action>,
    ) -> Result<GossipOutcome, GossipError> {
        let now = self.now();
        let cfg = &self.config;
        let hash = mnb.hash();

        if !mnb.recovery {
            if let Some((first_seen, _)) = st.seen_broadcasts.get_mut(&hash) {
                let refresh_after = cfg
                    .new_start_required_secs
                    .saturating_sub(2 * cfg.min_ping_interval_secs);
                if now.saturating_sub(*first_seen) > refresh_after {
                    *first_seen = now;
                }
                if let Some(peer) = from {
                    self.collect_recovery_reply_locked(st, peer, &hash, &mnb, now, actions);
                }
                return Ok(GossipOutcome::AlreadySeen);
            }
        }
        let fresh = !st.seen_broadcasts.contains_key(&hash);
        if fresh {
            st.seen_broadcasts.insert(hash, (now, mnb.clone()));
        }

        // hash excludes the signature; a rejected copy must not shadow the real one
        let result = self.accept_broadcast_locked(st, &mnb, hash, now, actions);
        if result.is_err() && fresh {
            st.seen_broadcasts.remove(&hash);
        }
        result
    }

    fn accept_broadcast_locked(
        &self,
        st: &mut RegistryState,
        mnb: &NodeBroadcast,
        hash: Hash256,
        now: u64,
        actions: &mut Vec<Action>,
    ) -> Result<GossipOutcome, GossipError> {
        let cfg = &self.config;
        let ping_ok = self.simple_check_broadcast(mnb, now)?;

        if let Some(pos) = st.position(&mnb.identity) {
            let old_hash = st.nodes[pos].broadcast_hash();
            let outcome = self.update_existing_locked(st, pos, mnb, now, actions)?;
            if hash != old_hash {
                st.seen_broadcasts.remove(&old_hash);
            }
            return Ok(outcome);
        }

        if self.chain.is_outpoint_spent(&mnb.identity) {
            return Err(GossipError::CollateralUnavailable(mnb.identity));
        }
        if !mnb.check_signature(self.verifier.as_ref()) {
            return Err(GossipError::InvalidSignature(mnb.identity));
        }

        let mut record = NodeRecord::from_broadcast(mnb);
        if !ping_ok {
            record.state = NodeState::Expired;
        }
        if self.is_local_pubkey(&record.pubkey_node) {
            record.pose_score = -cfg.pose_ban_max_score;
        }
        if !st.add(record) {
            return Err(GossipError::Malformed(mnb.identity));
        }
        if let (true, Some(ping)) = (ping_ok, &mnb.last_ping) {
            st.seen_pings.insert(ping.hash(), ping.clone());
        }
        if let Some(pos) = st.position(&mnb.identity) {
            self.check_node_at(st, pos, true, now);
        }
        info!(node = %mnb.identity, addr = %mnb.addr, "accepted new node");
        actions.push(Action::Relay(InventoryItem::Broadcast(hash)));
        Ok(GossipOutcome::Relayed)
    }

    /// Stateless checks. Returns whether the embedded ping is usable.
    fn simple_check_broadcast(&self, mnb: &NodeBroadcast, now: u64) -> Result<bool, GossipError> {
        let cfg = &self.config;
        if mnb.identity.is_null() {
            return Err(GossipError::Malformed(mnb.identity));
        }
        if !is_valid_node_addr(&mnb.addr, cfg.allow_local_addresses) {
            return Err(GossipError::InvalidAddress { identity: mnb.identity, addr: mnb.addr });
        }
        if mnb.sig_time > now + cfg.max_sig_time_drift_secs {
            return Err(GossipError::FutureSigTime { sig_time: mnb.sig_time, now });
        }
        if mnb.protocol_version < cfg.min_payments_protocol {
            return Err(GossipError::ObsoleteProtocol {
                version: mnb.protocol_version,
                min: cfg.min_payments_protocol,
            });
        }
        let ping_ok = match &mnb.last_ping {
            Some(ping) => {
                ping.identity == mnb.identity
                    && ping.sig_time <= now + cfg.max_sig_time_drift_secs
                    && self.chain.height_of(&ping.block_hash).is_some()
            }
            None => false,
        };
        Ok(ping_ok)
    }

    /// Applies a broadcast for a node we already track.
    fn update_existing_locked(
        &self,
        st: &mut RegistryState,
        pos: usize,
        mnb: &NodeBroadcast,
        now: u64,
        actions: &mut Vec<Action>,
    ) -> Result<GossipOutcome, GossipError> {
        let cfg = &self.config;
        let known = st.nodes[pos].sig_time;
        if (known == mnb.sig_time && !mnb.recovery) || known > mnb.sig_time {
            return Err(GossipError::StaleBroadcast {
                identity: mnb.identity,
                got: mnb.sig_time,
                known,
            });
        }

        self.check_node_at(st, pos, false, now);
        let record = &st.nodes[pos];
        if record.is_pose_banned() {
            return Err(GossipError::PoseBanned(mnb.identity));
        }
        if record.pubkey_collateral != mnb.pubkey_collateral {
            return Err(GossipError::CollateralKeyMismatch(mnb.identity));
        }
        if !mnb.check_signature(self.verifier.as_ref()) {
            return Err(GossipError::InvalidSignature(mnb.identity));
        }
        if record.is_broadcasted_within(cfg.min_broadcast_interval_secs, now)
            && !self.is_local_pubkey(&mnb.pubkey_node)
        {
            debug!(node = %mnb.identity, "broadcast accepted but too close to the previous one");
            return Ok(GossipOutcome::Stored);
        }

        let ping = mnb
            .last_ping
            .as_ref()
            .filter(|p| self.validate_ping_locked(st, pos, p, true, now).is_ok())
            .cloned();

        let record = &mut st.nodes[pos];
        if !record.update_from_broadcast(mnb) {
            return Ok(GossipOutcome::Stored);
        }
        if self.is_local_pubkey(&record.pubkey_node) {
            record.pose_score = -cfg.pose_ban_max_score;
        }
        if let Some(ping) = ping {
            st.set_last_ping(&mnb.identity, ping);
        }
        self.check_node_at(st, pos, false, now);
        info!(node = %mnb.identity, sig_time = mnb.sig_time, recovery = mnb.recovery, "updated node from broadcast");
        actions.push(Action::Relay(InventoryItem::Broadcast(mnb.hash())));
        Ok(GossipOutcome::Relayed)
    }

    /// Merges a trusted broadcast without the signature gate.
    ///
    /// Used for the local node's own announcement and for replaying
    /// persisted broadcasts. Known nodes are only updated by strictly newer
    /// broadcasts.
    pub fn update_node_list(&self, mnb: NodeBroadcast) -> bool {
        let now = self.now();
        let mut st = self.state.lock();
        let st = &mut *st;
        let hash = mnb.hash();
        if let Some(ping) = &mnb.last_ping {
            st.seen_pings.insert(ping.hash(), ping.clone());
        }
        st.seen_broadcasts.entry(hash).or_insert_with(|| (now, mnb.clone()));

        match st.position(&mnb.identity) {
            None => st.add(NodeRecord::from_broadcast(&mnb)),
            Some(pos) => {
                let old_hash = st.nodes[pos].broadcast_hash();
                if !st.nodes[pos].update_from_broadcast(&mnb) {
                    return false;
                }
                if let Some(ping) = mnb.last_ping.clone() {
                    st.nodes[pos].last_ping = Some(ping);
                }
                if old_hash != hash {
                    st.seen_broadcasts.remove(&old_hash);
                }
                true
            }
        }
    }

    // ════════════════════════════════════════════════════════════════════════════
    // PINGS
    // ════════════════════════════════════════════════════════════════════════════

    pub fn process_ping(&self, peer: SocketAddr, mnp: NodePing) -> Result<GossipOutcome, GossipError> {
        let mut actions = Vec::new();
        let result = {
            let mut st = self.state.lock();
            self.process_ping_locked(&mut st, peer, mnp, &mut actions)
        };
        self.dispatch(actions);
        result
    }

    fn process_ping_locked(
        &self,
        st: &mut RegistryState,
        peer: SocketAddr,
        mnp: NodePing,
        actions: &mut Vec<Action>,
    ) -> Result<GossipOutcome, GossipError> {
        let now = self.now();
        let hash = mnp.hash();
        if st.seen_pings.contains_key(&hash) {
            return Ok(GossipOutcome::AlreadySeen);
        }
        st.seen_pings.insert(hash, mnp.clone());

        let result = self.accept_ping_locked(st, peer, &mnp, hash, now, actions);
        if result.is_err() {
            st.seen_pings.remove(&hash);
        }
        result
    }

    fn accept_ping_locked(
        &self,
        st: &mut RegistryState,
        peer: SocketAddr,
        mnp: &NodePing,
        hash: Hash256,
        now: u64,
        actions: &mut Vec<Action>,
    ) -> Result<GossipOutcome, GossipError> {
        let Some(pos) = st.position(&mnp.identity) else {
            self.ask_for_mn_locked(st, peer, mnp.identity, now, actions);
            return Err(GossipError::UnknownNode(mnp.identity));
        };
        if st.nodes[pos].state == NodeState::NewStartRequired {
            return Err(GossipError::NewStartRequired(mnp.identity));
        }
        if let Err(e) = self.validate_ping_locked(st, pos, mnp, false, now) {
            if e.misbehavior() > 0 {
                self.ask_for_mn_locked(st, peer, mnp.identity, now, actions);
            }
            return Err(e);
        }

        st.set_last_ping(&mnp.identity, mnp.clone());
        self.check_node_at(st, pos, true, now);
        if !st.nodes[pos].is_enabled() {
            return Ok(GossipOutcome::Stored);
        }
        debug!(node = %mnp.identity, sig_time = mnp.sig_time, "accepted ping");
        actions.push(Action::Relay(InventoryItem::Ping(hash)));
        Ok(GossipOutcome::Relayed)
    }

    /// Ping rules shared by standalone pings and pings embedded in a
    /// broadcast. No side effects.
    pub(crate) fn validate_ping_locked(
        &self,
        st: &RegistryState,
        pos: usize,
        ping: &NodePing,
        from_broadcast: bool,
        now: u64,
    ) -> Result<(), GossipError> {
        let cfg = &self.config;
        let record = &st.nodes[pos];
        if ping.identity != record.identity {
            return Err(GossipError::Malformed(ping.identity));
        }
        if ping.sig_time > now + cfg.max_sig_time_drift_secs {
            return Err(GossipError::FutureSigTime { sig_time: ping.sig_time, now });
        }
        if ping.sig_time + cfg.max_sig_time_drift_secs <= now {
            return Err(GossipError::PastSigTime { sig_time: ping.sig_time, now });
        }
        if !from_broadcast && record.state == NodeState::NewStartRequired {
            return Err(GossipError::NewStartRequired(record.identity));
        }
        let height = self
            .chain
            .height_of(&ping.block_hash)
            .ok_or(GossipError::UnknownBlock)?;
        let tip = self.chain.best_height().unwrap_or(0);
        if height + cfg.max_ping_block_age < tip {
            return Err(GossipError::PingBlockTooOld { height, max_age: cfg.max_ping_block_age });
        }
        let spacing = cfg.min_ping_interval_secs.saturating_sub(60);
        let not_newer = record.last_ping.as_ref().is_some_and(|last| ping.sig_time <= last.sig_time);
        if not_newer || record.is_pinged_within(spacing, ping.sig_time) {
            return Err(GossipError::PingTooEarly(record.identity));
        }
        if !ping.check_signature(self.verifier.as_ref(), &record.pubkey_node) {
            return Err(GossipError::InvalidSignature(record.identity));
        }
        Ok(())
    }

    // ════════════════════════════════════════════════════════════════════════════
    // LIST REQUESTS
    // ════════════════════════════════════════════════════════════════════════════

    /// Answers a list request with inventory. Returns the number of nodes
    /// advertised.
    pub fn process_list_request(
        &self,
        peer: SocketAddr,
        target: Option<NodeIdentity>,
    ) -> Result<usize, GossipError> {
        let mut actions = Vec::new();
        let result = {
            let mut st = self.state.lock();
            self.process_list_request_locked(&mut st, peer, target, &mut actions)
        };
        self.dispatch(actions);
        result
    }

    fn process_list_request_locked(
        &self,
        st: &mut RegistryState,
        peer: SocketAddr,
        target: Option<NodeIdentity>,
        actions: &mut Vec<Action>,
    ) -> Result<usize, GossipError> {
        let now = self.now();
        let cfg = &self.config;

        if target.is_none() {
            let ip = peer.ip();
            if !is_local_ip(&ip) {
                if let Some(&until) = st.asked_us_for_list.get(&ip) {
                    if now < until {
                        return Err(GossipError::ListRequestTooSoon(peer));
                    }
                }
                st.asked_us_for_list.insert(ip, now + DSEG_UPDATE_SECONDS);
            }
        }

        let mut items = Vec::new();
        let mut count = 0usize;
        for record in &st.nodes {
            if target.is_some_and(|t| t != record.identity) {
                continue;
            }
            if !cfg.allow_local_addresses && is_local_ip(&record.addr.ip()) {
                continue;
            }
            if record.protocol_version < cfg.min_payments_protocol {
                continue;
            }
            let mnb = record.to_broadcast();
            let hash = mnb.hash();
            items.push(InventoryItem::Broadcast(hash));
            if let Some(ping) = &record.last_ping {
                let ping_hash = ping.hash();
                items.push(InventoryItem::Ping(ping_hash));
                st.seen_pings.entry(ping_hash).or_insert_with(|| ping.clone());
            }
            st.seen_broadcasts.entry(hash).or_insert((now, mnb));
            count += 1;
        }

        match target {
            None => {
                actions.push(Action::Send { peer, message: NodeMessage::Inventory(items) });
                actions.push(Action::Send { peer, message: NodeMessage::ListCount(count as u32) });
                info!(%peer, count, "sent node list");
            }
            Some(_) if !items.is_empty() => {
                actions.push(Action::Send { peer, message: NodeMessage::Inventory(items) });
            }
            Some(_) => {}
        }
        Ok(count)
    }

    /// Asks `peer` for one node's entry, at most once per
    /// `DSEG_UPDATE_SECONDS` per (node, peer).
    pub fn ask_for_mn(&self, peer: SocketAddr, identity: NodeIdentity) {
        let mut actions = Vec::new();
        {
            let now = self.now();
            let mut st = self.state.lock();
            self.ask_for_mn_locked(&mut st, peer, identity, now, &mut actions);
        }
        self.dispatch(actions);
    }

    pub(crate) fn ask_for_mn_locked(
        &self,
        st: &mut RegistryState,
        peer: SocketAddr,
        identity: NodeIdentity,
        now: u64,
        actions: &mut Vec<Action>,
    ) {
        let asked = st.we_asked_for_list_entry.entry(identity).or_default();
        if let Some(&until) = asked.get(&peer.ip()) {
            if now < until {
                debug!(%peer, node = %identity, "asked recently, skipping");
                return;
            }
        }
        asked.insert(peer.ip(), now + DSEG_UPDATE_SECONDS);
        debug!(%peer, node = %identity, "asking for node entry");
        actions.push(Action::Send { peer, message: NodeMessage::ListRequest(Some(identity)) });
    }

    /// Asks `peer` for the full list unless we did so recently.
    pub fn dseg_update(&self, peer: SocketAddr) -> bool {
        let now = self.now();
        let sent = {
            let mut st = self.state.lock();
            let ip = peer.ip();
            let recently = st.we_asked_for_list.get(&ip).is_some_and(|&until| now < until);
            if recently && !is_local_ip(&ip) {
                debug!(%peer, "we already asked peer for the list, skipping");
                false
            } else {
                st.we_asked_for_list.insert(ip, now + DSEG_UPDATE_SECONDS);
                true
            }
        };
        if sent {
            self.dispatch(vec![Action::Send { peer, message: NodeMessage::ListRequest(None) }]);
        }
        sent
    }

    /// Requests one broadcast by hash.
    pub fn ask_for_broadcast(&self, peer: SocketAddr, hash: Hash256) {
        if hash == ZERO_HASH {
            return;
        }
        self.dispatch(vec![Action::Send {
            peer,
            message: NodeMessage::GetData(InventoryItem::Broadcast(hash)),
        }]);
    }

    // ════════════════════════════════════════════════════════════════════════════
    // INVENTORY
    // ════════════════════════════════════════════════════════════════════════════

    /// Serves a previously advertised item from the seen maps.
    pub fn process_get_data(&self, peer: SocketAddr, item: InventoryItem) {
        let message = {
            let st = self.state.lock();
            match item {
                InventoryItem::Broadcast(h) => {
                    st.seen_broadcasts.get(&h).map(|(_, b)| NodeMessage::Broadcast(b.clone()))
                }
                InventoryItem::Ping(h) => st.seen_pings.get(&h).cloned().map(NodeMessage::Ping),
                InventoryItem::Verify(h) => {
                    st.seen_verifications.get(&h).cloned().map(NodeMessage::Verify)
                }
            }
        };
        match message {
            Some(message) => self.dispatch(vec![Action::Send { peer, message }]),
            None => debug!(%peer, ?item, "requested item not found"),
        }
    }

    /// Requests every advertised item we have not seen yet.
    pub fn process_inventory(&self, peer: SocketAddr, items: &[InventoryItem]) {
        let wanted: Vec<Action> = {
            let st = self.state.lock();
            items
                .iter()
                .filter(|item| match item {
                    InventoryItem::Broadcast(h) => !st.seen_broadcasts.contains_key(h),
                    InventoryItem::Ping(h) => !st.seen_pings.contains_key(h),
                    InventoryItem::Verify(h) => !st.seen_verifications.contains_key(h),
                })
                .map(|item| Action::Send { peer, message: NodeMessage::GetData(*item) })
                .collect()
        };
        self.dispatch(wanted);
    }
}
