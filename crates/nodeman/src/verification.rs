//! # Proof-of-Service Verification
//!
//! Address verification between service nodes.
//!
//! ## Exchange
//!
//! ```text
//!  challenger                         challenged (claims addr)
//!      │ ── Verify{addr, nonce, h} ──────▶ │
//!      │ ◀── Verify{.., sig1} ──────────── │  sig1 = node key over (addr, nonce, hash(h))
//!      │
//!      │ sig1 matches node N at addr:  N.pose_score -= 1
//!      │                               every other node at addr: += 1
//!      │ ── relay Verify{.., identity1 = N, identity2 = self, sig2} ──▶ network
//! ```
//!
//! Third parties accept the relayed broadcast only if the challenger ranks
//! within `MAX_POSE_RANK` at the verification height and the block is no
//! older than `MAX_POSE_BLOCKS`.
//!
//! ## Throttling
//!
//! Per peer address and request kind, a fulfilled entry blocks repeats for
//! `fulfilled_request_expire_secs`.

use noir_common::{Hash256, InventoryItem, NodeMessage, NodeVerification};
use rand::Rng;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info};

use crate::error::GossipError;
use crate::registry::{NodeRegistry, RegistryState};
use crate::transport::Action;
use crate::{
    MAX_POSE_BLOCKS, MAX_POSE_CONNECTIONS, MAX_POSE_RANK, MIN_POSE_PROTO_VERSION,
    VERIFY_NONCE_RANGE,
};

/// Request kinds tracked per peer to throttle verification traffic.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FulfilledKind {
    /// We challenged the peer.
    VerifyRequest,
    /// We answered the peer's challenge.
    VerifyReply,
    /// We accepted the peer's answer.
    VerifyDone,
}

impl RegistryState {
    pub(crate) fn has_fulfilled(&self, ip: IpAddr, kind: FulfilledKind, now: u64) -> bool {
        self.fulfilled.get(&(ip, kind)).is_some_and(|until| *until >= now)
    }

    pub(crate) fn add_fulfilled(&mut self, ip: IpAddr, kind: FulfilledKind, until: u64) {
        self.fulfilled.insert((ip, kind), until);
    }
}

impl NodeRegistry {
    /// Routes a verification message by how far it has been filled in.
    pub fn process_verify(&self, peer: SocketAddr, mnv: NodeVerification) -> Result<(), GossipError> {
        if mnv.sig1.is_empty() {
            self.send_verify_reply(peer, mnv)
        } else if mnv.sig2.is_empty() {
            self.process_verify_reply(peer, mnv)
        } else {
            self.process_verify_broadcast(peer, mnv)
        }
    }

    // ════════════════════════════════════════════════════════════════════════════
    // SWEEPS
    // ════════════════════════════════════════════════════════════════════════════

    /// Challenges nodes whose address is in doubt. Runs only on a service
    /// node ranked within `MAX_POSE_RANK` at `tip - 1`.
    ///
    /// Addresses claimed by more than one node come first, then every
    /// `MAX_POSE_CONNECTIONS`-th node of the ranking starting
    /// `MAX_POSE_RANK` places below our own rank. At most
    /// `MAX_POSE_CONNECTIONS` requests are sent. Returns how many were.
    pub fn do_full_verification_step(&self) -> usize {
        let Some(local) = &self.local else {
            return 0;
        };
        let Some(tip) = self.chain.best_height() else {
            return 0;
        };
        let now = self.now();
        let height = tip.saturating_sub(1);
        let max_score = self.config.pose_ban_max_score;
        let mut actions = Vec::new();

        let sent = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            self.check_all_locked(st, now);

            let ranked = self.ranked_positions_locked(st, height, MIN_POSE_PROTO_VERSION, true);
            let my_rank = ranked
                .iter()
                .position(|&pos| st.nodes[pos].identity == local.identity)
                .map(|i| i + 1);
            let Some(my_rank) = my_rank.filter(|r| *r <= MAX_POSE_RANK) else {
                debug!(rank = ?my_rank, "not in the verifier window");
                return 0;
            };

            let mut by_addr: BTreeMap<SocketAddr, Vec<usize>> = BTreeMap::new();
            for (pos, record) in st.nodes.iter().enumerate() {
                by_addr.entry(record.addr).or_default().push(pos);
            }
            let mut targets: Vec<SocketAddr> = by_addr
                .iter()
                .filter(|(_, positions)| positions.len() > 1)
                .filter(|(_, positions)| !positions.iter().all(|&p| st.nodes[p].is_pose_banned()))
                .map(|(addr, _)| *addr)
                .collect();

            let mut offset = MAX_POSE_RANK + my_rank - 1;
            while offset < ranked.len() {
                let record = &st.nodes[ranked[offset]];
                if record.is_pose_verified(max_score) || record.is_pose_banned() {
                    debug!(node = %record.identity, "already verified or banned");
                } else if !targets.contains(&record.addr) {
                    targets.push(record.addr);
                }
                offset += MAX_POSE_CONNECTIONS;
            }

            let mut sent = 0;
            for addr in targets {
                if sent >= MAX_POSE_CONNECTIONS {
                    break;
                }
                if addr == local.addr {
                    continue;
                }
                if self.send_verify_request_locked(st, addr, height, now, &mut actions) {
                    sent += 1;
                }
            }
            sent
        };

        self.dispatch(actions);
        if sent > 0 {
            info!(sent, "sent verification requests");
        }
        sent
    }

    /// Among (pre-)enabled nodes sharing an address, a PoSe-verified node
    /// marks every other one with a PoSe point.
    pub fn check_same_addr(&self) {
        let mut st = self.state.lock();
        self.check_same_addr_locked(&mut st);
    }

    pub(crate) fn check_same_addr_locked(&self, st: &mut RegistryState) {
        let max_score = self.config.pose_ban_max_score;
        let mut groups: BTreeMap<SocketAddr, Vec<usize>> = BTreeMap::new();
        for (pos, record) in st.nodes.iter().enumerate() {
            if record.is_enabled() || record.is_pre_enabled() {
                groups.entry(record.addr).or_default().push(pos);
            }
        }

        let mut penalize = Vec::new();
        for (addr, mut positions) in groups {
            if positions.len() < 2 {
                continue;
            }
            positions.sort_by_key(|&p| st.nodes[p].identity);
            let Some(&keeper) = positions.iter().find(|&&p| st.nodes[p].is_pose_verified(max_score))
            else {
                continue;
            };
            debug!(%addr, nodes = positions.len(), "duplicate address with a verified node");
            penalize.extend(positions.into_iter().filter(|&p| p != keeper));
        }
        for pos in penalize {
            st.nodes[pos].increase_pose_score(max_score);
        }
    }

    // ════════════════════════════════════════════════════════════════════════════
    // CHALLENGER
    // ════════════════════════════════════════════════════════════════════════════

    /// Challenges the node at `addr` against the block at `tip - 1`.
    pub fn send_verify_request(&self, addr: SocketAddr) -> bool {
        let Some(tip) = self.chain.best_height() else {
            return false;
        };
        let now = self.now();
        let mut actions = Vec::new();
        let sent = {
            let mut st = self.state.lock();
            self.send_verify_request_locked(&mut st, addr, tip.saturating_sub(1), now, &mut actions)
        };
        self.dispatch(actions);
        sent
    }

    fn send_verify_request_locked(
        &self,
        st: &mut RegistryState,
        addr: SocketAddr,
        height: u64,
        now: u64,
        actions: &mut Vec<Action>,
    ) -> bool {
        let ip = addr.ip();
        if st.has_fulfilled(ip, FulfilledKind::VerifyRequest, now) {
            debug!(%addr, "verification already requested");
            return false;
        }
        st.add_fulfilled(ip, FulfilledKind::VerifyRequest, now + self.config.fulfilled_request_expire_secs);

        let nonce = rand::thread_rng().gen_range(0..VERIFY_NONCE_RANGE);
        let mnv = NodeVerification::request(addr, nonce, height);
        st.we_asked_for_verification.insert(ip, mnv.clone());
        st.temp_connections.insert(addr);
        debug!(%addr, nonce, height, "verification requested");
        actions.push(Action::ConnectAndSend { addr, messages: vec![NodeMessage::Verify(mnv)] });
        true
    }

    /// Checks an answer to one of our challenges and, if we run a service
    /// node, relays the countersigned result.
    pub fn process_verify_reply(&self, peer: SocketAddr, mnv: NodeVerification) -> Result<(), GossipError> {
        let now = self.now();
        let mut actions = Vec::new();
        let result = {
            let mut st = self.state.lock();
            self.process_verify_reply_locked(&mut st, peer, mnv, now, &mut actions)
        };
        self.dispatch(actions);
        result
    }

    fn process_verify_reply_locked(
        &self,
        st: &mut RegistryState,
        peer: SocketAddr,
        mnv: NodeVerification,
        now: u64,
        actions: &mut Vec<Action>,
    ) -> Result<(), GossipError> {
        let cfg = &self.config;
        let ip = peer.ip();
        if !st.has_fulfilled(ip, FulfilledKind::VerifyRequest, now) {
            return Err(GossipError::VerifyNotRequested(peer));
        }
        let Some(request) = st.we_asked_for_verification.get(&ip).cloned() else {
            return Err(GossipError::VerifyNotRequested(peer));
        };
        if request.nonce != mnv.nonce {
            return Err(GossipError::VerifyNonceMismatch { peer, expected: request.nonce, got: mnv.nonce });
        }
        if request.block_height != mnv.block_height {
            return Err(GossipError::VerifyHeightMismatch {
                peer,
                expected: request.block_height,
                got: mnv.block_height,
            });
        }
        let block_hash = self.chain.block_hash(mnv.block_height).ok_or(GossipError::UnknownBlock)?;
        if st.has_fulfilled(ip, FulfilledKind::VerifyDone, now) {
            return Err(GossipError::VerifyAlreadyDone(peer));
        }

        let mut reply = mnv;
        reply.addr = request.addr;
        let challenge = reply.challenge_message(&block_hash);
        let (real, impostors): (Vec<usize>, Vec<usize>) = st
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, r)| r.addr == request.addr)
            .map(|(pos, _)| pos)
            .partition(|&pos| self.verifier.verify(&st.nodes[pos].pubkey_node, &reply.sig1, &challenge));
        let Some(&real_pos) = real.first() else {
            return Err(GossipError::VerifyNoMatchingNode(peer));
        };

        st.add_fulfilled(ip, FulfilledKind::VerifyDone, now + cfg.fulfilled_request_expire_secs);
        for &pos in &real {
            let record = &mut st.nodes[pos];
            if !record.is_pose_verified(cfg.pose_ban_max_score) {
                record.decrease_pose_score(cfg.pose_ban_max_score);
            }
        }
        for &pos in &impostors {
            st.nodes[pos].increase_pose_score(cfg.pose_ban_max_score);
        }
        info!(
            addr = %request.addr,
            node = %st.nodes[real_pos].identity,
            impostors = impostors.len(),
            "verified node address"
        );

        if let Some(local) = &self.local {
            reply.identity1 = st.nodes[real_pos].identity;
            reply.identity2 = local.identity;
            reply.sig2 = local.signer.sign(&reply.broadcast_message(&block_hash));
            let hash = reply.hash();
            st.we_asked_for_verification.insert(ip, reply.clone());
            st.seen_verifications.insert(hash, reply);
            actions.push(Action::Relay(InventoryItem::Verify(hash)));
        }
        Ok(())
    }

    // ════════════════════════════════════════════════════════════════════════════
    // CHALLENGED
    // ════════════════════════════════════════════════════════════════════════════

    /// Signs a challenge addressed to our service node and sends it back.
    pub fn send_verify_reply(&self, peer: SocketAddr, mnv: NodeVerification) -> Result<(), GossipError> {
        let Some(local) = &self.local else {
            return Err(GossipError::NotAServiceNode);
        };
        let now = self.now();
        let reply = {
            let mut st = self.state.lock();
            let ip = peer.ip();
            if st.has_fulfilled(ip, FulfilledKind::VerifyReply, now) {
                return Err(GossipError::VerifyRequestRepeated(peer));
            }
            let block_hash = self.chain.block_hash(mnv.block_height).ok_or(GossipError::UnknownBlock)?;
            let mut reply = mnv;
            reply.addr = local.addr;
            reply.sig1 = local.signer.sign(&reply.challenge_message(&block_hash));
            st.add_fulfilled(ip, FulfilledKind::VerifyReply, now + self.config.fulfilled_request_expire_secs);
            reply
        };
        debug!(%peer, nonce = reply.nonce, "answering verification");
        self.dispatch(vec![Action::Send { peer, message: NodeMessage::Verify(reply) }]);
        Ok(())
    }

    // ════════════════════════════════════════════════════════════════════════════
    // THIRD PARTY
    // ════════════════════════════════════════════════════════════════════════════

    /// Applies a verification result relayed by another node.
    pub fn process_verify_broadcast(
        &self,
        peer: SocketAddr,
        mnv: NodeVerification,
    ) -> Result<(), GossipError> {
        let now = self.now();
        let mut actions = Vec::new();
        let result = {
            let mut st = self.state.lock();
            self.process_verify_broadcast_locked(&mut st, mnv, now, &mut actions)
        };
        if result.is_err() {
            debug!(%peer, "verification broadcast not applied");
        }
        self.dispatch(actions);
        result
    }

    fn process_verify_broadcast_locked(
        &self,
        st: &mut RegistryState,
        mnv: NodeVerification,
        now: u64,
        actions: &mut Vec<Action>,
    ) -> Result<(), GossipError> {
        let hash = mnv.hash();
        if st.seen_verifications.contains_key(&hash) {
            return Ok(());
        }
        st.seen_verifications.insert(hash, mnv.clone());

        let result = self.apply_verify_broadcast_locked(st, mnv, hash, now, actions);
        if result.is_err() {
            st.seen_verifications.remove(&hash);
        }
        result
    }

    fn apply_verify_broadcast_locked(
        &self,
        st: &mut RegistryState,
        mnv: NodeVerification,
        hash: Hash256,
        now: u64,
        actions: &mut Vec<Action>,
    ) -> Result<(), GossipError> {
        let max_score = self.config.pose_ban_max_score;
        let tip = self.chain.best_height().unwrap_or(0);
        if mnv.block_height > tip {
            return Err(GossipError::UnknownBlock);
        }
        if tip - mnv.block_height > MAX_POSE_BLOCKS {
            return Err(GossipError::VerifyOutdated { height: mnv.block_height, tip });
        }
        if mnv.identity1 == mnv.identity2 {
            return Err(GossipError::VerifySelf(mnv.identity1));
        }
        let block_hash = self.chain.block_hash(mnv.block_height).ok_or(GossipError::UnknownBlock)?;

        self.check_all_locked(st, now);
        let rank = self
            .ranked_positions_locked(st, mnv.block_height, MIN_POSE_PROTO_VERSION, true)
            .into_iter()
            .position(|pos| st.nodes[pos].identity == mnv.identity2)
            .map(|i| i + 1);
        if !rank.is_some_and(|r| r <= MAX_POSE_RANK) {
            return Err(GossipError::VerifierRankTooLow {
                identity: mnv.identity2,
                rank,
                max: MAX_POSE_RANK,
            });
        }

        let pos1 = st.position(&mnv.identity1).ok_or(GossipError::UnknownNode(mnv.identity1))?;
        let pos2 = st.position(&mnv.identity2).ok_or(GossipError::UnknownNode(mnv.identity2))?;
        if st.nodes[pos1].addr != mnv.addr {
            return Err(GossipError::VerifyAddressMismatch(mnv.identity1));
        }
        if !self.verifier.verify(&st.nodes[pos1].pubkey_node, &mnv.sig1, &mnv.challenge_message(&block_hash)) {
            return Err(GossipError::VerifySignature(mnv.identity1));
        }
        if !self.verifier.verify(&st.nodes[pos2].pubkey_node, &mnv.sig2, &mnv.broadcast_message(&block_hash)) {
            return Err(GossipError::VerifySignature(mnv.identity2));
        }

        if !st.nodes[pos1].is_pose_verified(max_score) {
            st.nodes[pos1].decrease_pose_score(max_score);
        }
        actions.push(Action::Relay(InventoryItem::Verify(hash)));

        let mut penalized = 0;
        for record in st.nodes.iter_mut() {
            if record.addr == mnv.addr && record.identity != mnv.identity1 {
                record.increase_pose_score(max_score);
                penalized += 1;
            }
        }
        info!(
            node = %mnv.identity1,
            verifier = %mnv.identity2,
            addr = %mnv.addr,
            penalized,
            "accepted verification broadcast"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{node_addr, node_record, TestHarness};
    use noir_common::NodeIdentity;

    const T0: u64 = 1_700_000_000;

    fn id(n: u8) -> NodeIdentity {
        NodeIdentity::new([n; 32], 0)
    }

    fn last_verify(h: &TestHarness) -> NodeVerification {
        h.transport
            .sent()
            .into_iter()
            .rev()
            .find_map(|(_, m)| match m {
                NodeMessage::Verify(mnv) => Some(mnv),
                _ => None,
            })
            .expect("a verification message was sent")
    }

    /// Challenger `id(1)`, target `id(2)`, impostor `id(3)` claiming the
    /// target's address.
    fn populate(h: &TestHarness) {
        h.registry.add(node_record(id(1), T0 - 100));
        h.registry.add(node_record(id(2), T0 - 100));
        let mut impostor = node_record(id(3), T0 - 100);
        impostor.addr = node_addr(&id(2));
        h.registry.add(impostor);
    }

    // ── 1. FULL EXCHANGE ─────────────────────────────────────────────────────

    #[test]
    fn test_challenge_reply_and_broadcast() {
        let challenger = TestHarness::with_local(T0, 200, id(1));
        let target = TestHarness::with_local(T0, 200, id(2));
        let observer = TestHarness::new(T0, 200);
        populate(&challenger);
        populate(&observer);

        let target_addr = node_addr(&id(2));
        assert!(challenger.registry.send_verify_request(target_addr));
        assert_eq!(challenger.transport.connected(), vec![target_addr]);
        assert!(!challenger.registry.send_verify_request(target_addr));

        let request = last_verify(&challenger);
        assert!(request.sig1.is_empty());
        let challenger_addr = node_addr(&id(1));
        target
            .registry
            .process_message(challenger_addr, NodeMessage::Verify(request))
            .expect("target answers");
        let reply = last_verify(&target);
        assert!(reply.is_reply());

        challenger
            .registry
            .process_message(target_addr, NodeMessage::Verify(reply.clone()))
            .expect("reply accepted");
        assert_eq!(challenger.registry.get_info(&id(2)).expect("info").pose_score, -1);
        assert_eq!(challenger.registry.get_info(&id(3)).expect("info").pose_score, 1);
        let relayed = challenger.transport.relayed();
        assert_eq!(relayed.len(), 1);

        // the same answer again is refused
        assert_eq!(
            challenger.registry.process_verify_reply(target_addr, reply),
            Err(GossipError::VerifyAlreadyDone(target_addr))
        );

        let InventoryItem::Verify(hash) = relayed[0] else {
            panic!("expected a verification item");
        };
        let broadcast = challenger
            .registry
            .state
            .lock()
            .seen_verifications
            .get(&hash)
            .cloned()
            .expect("stored for relay");
        assert_eq!(broadcast.identity1, id(2));
        assert_eq!(broadcast.identity2, id(1));

        let peer: SocketAddr = "198.51.100.7:8168".parse().expect("addr");
        observer
            .registry
            .process_message(peer, NodeMessage::Verify(broadcast.clone()))
            .expect("broadcast accepted");
        assert_eq!(observer.registry.get_info(&id(2)).expect("info").pose_score, -1);
        assert_eq!(observer.registry.get_info(&id(3)).expect("info").pose_score, 1);

        // duplicate is ignored without effect
        observer
            .registry
            .process_message(peer, NodeMessage::Verify(broadcast))
            .expect("duplicate");
        assert_eq!(observer.registry.get_info(&id(3)).expect("info").pose_score, 1);
        assert_eq!(observer.transport.relayed().len(), 1);
    }

    // ── 2. REJECTIONS ────────────────────────────────────────────────────────

    #[test]
    fn test_unrequested_reply_is_penalized() {
        let h = TestHarness::with_local(T0, 200, id(1));
        populate(&h);
        let peer = node_addr(&id(2));
        let mut mnv = NodeVerification::request(peer, 5, 199);
        mnv.sig1 = vec![1u8; 64];
        let err = h.registry.process_message(peer, NodeMessage::Verify(mnv)).unwrap_err();
        assert_eq!(err, GossipError::VerifyNotRequested(peer));
        assert_eq!(err.misbehavior(), 20);
    }

    #[test]
    fn test_nonce_mismatch_is_rejected() {
        let h = TestHarness::with_local(T0, 200, id(1));
        populate(&h);
        let peer = node_addr(&id(2));
        assert!(h.registry.send_verify_request(peer));
        let mut forged = last_verify(&h);
        forged.nonce = forged.nonce.wrapping_add(1);
        forged.sig1 = vec![1u8; 64];
        assert!(matches!(
            h.registry.process_verify_reply(peer, forged),
            Err(GossipError::VerifyNonceMismatch { .. })
        ));
    }

    #[test]
    fn test_regular_node_does_not_answer() {
        let h = TestHarness::new(T0, 200);
        let peer = node_addr(&id(1));
        let mnv = NodeVerification::request(node_addr(&id(2)), 1, 199);
        assert_eq!(h.registry.send_verify_reply(peer, mnv), Err(GossipError::NotAServiceNode));
    }

    #[test]
    fn test_repeated_challenge_is_penalized() {
        let h = TestHarness::with_local(T0, 200, id(2));
        let peer = node_addr(&id(1));
        let mnv = NodeVerification::request(node_addr(&id(2)), 1, 199);
        h.registry.send_verify_reply(peer, mnv.clone()).expect("first answer");
        assert_eq!(
            h.registry.send_verify_reply(peer, mnv),
            Err(GossipError::VerifyRequestRepeated(peer))
        );
    }

    #[test]
    fn test_self_verification_is_rejected() {
        let h = TestHarness::new(T0, 200);
        populate(&h);
        let mut mnv = NodeVerification::request(node_addr(&id(2)), 1, 199);
        mnv.identity1 = id(2);
        mnv.identity2 = id(2);
        mnv.sig1 = vec![1u8; 64];
        mnv.sig2 = vec![1u8; 64];
        let err = h.registry.process_verify_broadcast(node_addr(&id(1)), mnv).unwrap_err();
        assert_eq!(err, GossipError::VerifySelf(id(2)));
        assert_eq!(err.misbehavior(), 100);
    }

    #[test]
    fn test_outdated_broadcast_is_ignored() {
        let h = TestHarness::new(T0, 200);
        let mut mnv = NodeVerification::request(node_addr(&id(2)), 1, 150);
        mnv.identity1 = id(2);
        mnv.identity2 = id(1);
        mnv.sig1 = vec![1u8; 64];
        mnv.sig2 = vec![1u8; 64];
        assert!(matches!(
            h.registry.process_verify_broadcast(node_addr(&id(1)), mnv),
            Err(GossipError::VerifyOutdated { height: 150, tip: 200 })
        ));
    }

    #[test]
    fn test_height_beyond_tip_is_rejected() {
        let h = TestHarness::new(T0, 200);
        populate(&h);
        for height in [201, u64::MAX] {
            let mut mnv = NodeVerification::request(node_addr(&id(2)), 1, height);
            mnv.identity1 = id(2);
            mnv.identity2 = id(1);
            mnv.sig1 = vec![1u8; 64];
            mnv.sig2 = vec![1u8; 64];
            let err = h
                .registry
                .process_message(node_addr(&id(1)), NodeMessage::Verify(mnv))
                .unwrap_err();
            assert_eq!(err, GossipError::UnknownBlock);
        }
        assert!(h.registry.state.lock().seen_verifications.is_empty());
    }

    #[test]
    fn test_rejected_broadcast_is_forgotten() {
        let h = TestHarness::new(T0, 200);
        populate(&h);
        let mut mnv = NodeVerification::request(node_addr(&id(2)), 1, 199);
        mnv.identity1 = id(2);
        mnv.identity2 = id(1);
        mnv.sig1 = vec![1u8; 64];
        mnv.sig2 = vec![1u8; 64];
        assert!(h.registry.process_verify_broadcast(node_addr(&id(1)), mnv.clone()).is_err());
        assert!(!h.registry.state.lock().seen_verifications.contains_key(&mnv.hash()));
    }

    // ── 3. SWEEPS ────────────────────────────────────────────────────────────

    #[test]
    fn test_full_step_targets_shared_addresses() {
        let h = TestHarness::with_local(T0, 200, id(1));
        populate(&h);
        assert_eq!(h.registry.do_full_verification_step(), 1);
        assert_eq!(h.transport.connected(), vec![node_addr(&id(2))]);
        // throttled on the next round
        assert_eq!(h.registry.do_full_verification_step(), 0);
    }

    #[test]
    fn test_full_step_needs_service_node() {
        let h = TestHarness::new(T0, 200);
        populate(&h);
        assert_eq!(h.registry.do_full_verification_step(), 0);
        assert!(h.transport.connected().is_empty());
    }

    #[test]
    fn test_same_addr_penalizes_unverified_duplicates() {
        let h = TestHarness::new(T0, 200);
        populate(&h);
        h.registry.check();
        h.registry.state.lock().nodes[1].pose_score = -5;
        h.registry.check_same_addr();
        assert_eq!(h.registry.get_info(&id(3)).expect("info").pose_score, 1);
        assert_eq!(h.registry.get_info(&id(2)).expect("info").pose_score, -5);
        assert_eq!(h.registry.get_info(&id(1)).expect("info").pose_score, 0);
    }

    #[test]
    fn test_same_addr_without_verified_node_is_noop() {
        let h = TestHarness::new(T0, 200);
        populate(&h);
        h.registry.check_same_addr();
        assert_eq!(h.registry.get_info(&id(2)).expect("info").pose_score, 0);
        assert_eq!(h.registry.get_info(&id(3)).expect("info").pose_score, 0);
    }
}
