//! # Node Record
//!
//! One entry per known service node, owned by the registry and only ever
//! handed out as a clone or a [`NodeInfo`] snapshot.
//!
//! ## State Evaluation Order
//!
//! [`NodeRecord::check`] re-derives the lifecycle state. The first matching
//! rule wins:
//!
//! ```text
//! 1. collateral spent                            → OUTPOINT_SPENT (terminal)
//! 2. POSE_BAN and tip below ban height           → unchanged
//!    POSE_BAN and ban height reached             → score - 1, continue
//! 3. PoSe score >= max                           → POSE_BAN until tip + registry size
//! 4. protocol below floor                        → NEW_START_REQUIRED
//! 5. no ping within new_start_required_secs      → NEW_START_REQUIRED
//! 6. watchdog active, own vote too old           → WATCHDOG_EXPIRED
//! 7. no ping within expiration_secs              → EXPIRED
//! 8. last ping too close to the announcement     → PRE_ENABLED
//! 9. otherwise                                   → ENABLED
//! ```
//!
//! The result is applied only if [`NodeState::can_transition_to`] allows it,
//! which is what keeps NEW_START_REQUIRED sticky until a fresh broadcast.

use noir_common::{
    ChainView, Hash256, NodeBroadcast, NodeIdentity, NodePing, NodeState, PayeeScript,
    PublicKey, RegistryConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tracing::debug;

/// Inputs to a state evaluation that come from outside the record.
pub(crate) struct CheckContext<'a> {
    pub chain: &'a dyn ChainView,
    pub config: &'a RegistryConfig,
    pub now: u64,
    pub watchdog_active: bool,
    pub registry_size: usize,
}

// ════════════════════════════════════════════════════════════════════════════════
// NODE RECORD
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub identity: NodeIdentity,
    pub addr: SocketAddr,
    pub pubkey_collateral: PublicKey,
    pub pubkey_node: PublicKey,
    pub last_ping: Option<NodePing>,
    pub signature: Vec<u8>,
    /// Signed time of the broadcast currently in effect.
    pub sig_time: u64,
    pub last_dsq: i64,
    pub time_last_checked: u64,
    pub time_last_paid: u64,
    pub time_last_watchdog_vote: u64,
    pub state: NodeState,
    pub block_last_paid: u64,
    pub protocol_version: u32,
    /// Proof-of-service score. Positive is bad, `<= -max` is verified.
    pub pose_score: i32,
    pub pose_ban_height: u64,
    /// Governance objects this node voted on, with vote counts.
    pub governance_votes: BTreeMap<Hash256, u32>,
}

impl NodeRecord {
    /// Fresh record for a newly announced node.
    pub fn from_broadcast(mnb: &NodeBroadcast) -> Self {
        NodeRecord {
            identity: mnb.identity,
            addr: mnb.addr,
            pubkey_collateral: mnb.pubkey_collateral,
            pubkey_node: mnb.pubkey_node,
            last_ping: mnb.last_ping.clone(),
            signature: mnb.signature.clone(),
            sig_time: mnb.sig_time,
            last_dsq: 0,
            time_last_checked: 0,
            time_last_paid: 0,
            time_last_watchdog_vote: mnb.sig_time,
            state: NodeState::PreEnabled,
            block_last_paid: 0,
            protocol_version: mnb.protocol_version,
            pose_score: 0,
            pose_ban_height: 0,
            governance_votes: BTreeMap::new(),
        }
    }

    /// The broadcast this record was last updated from.
    pub fn to_broadcast(&self) -> NodeBroadcast {
        NodeBroadcast {
            identity: self.identity,
            addr: self.addr,
            pubkey_collateral: self.pubkey_collateral,
            pubkey_node: self.pubkey_node,
            signature: self.signature.clone(),
            sig_time: self.sig_time,
            protocol_version: self.protocol_version,
            last_ping: self.last_ping.clone(),
            recovery: false,
        }
    }

    #[must_use]
    pub fn broadcast_hash(&self) -> Hash256 {
        self.to_broadcast().hash()
    }

    #[must_use]
    pub fn payee_script(&self) -> PayeeScript {
        PayeeScript::for_key(&self.pubkey_collateral)
    }

    /// Copies the announced fields of a newer broadcast.
    ///
    /// Returns `false` (and changes nothing) unless `mnb` is strictly newer,
    /// or is a recovery re-feed. The ping is handled by the caller.
    pub fn update_from_broadcast(&mut self, mnb: &NodeBroadcast) -> bool {
        if mnb.sig_time <= self.sig_time && !mnb.recovery {
            return false;
        }
        self.pubkey_node = mnb.pubkey_node;
        self.sig_time = mnb.sig_time;
        self.signature = mnb.signature.clone();
        self.protocol_version = mnb.protocol_version;
        self.addr = mnb.addr;
        self.pose_score = 0;
        self.pose_ban_height = 0;
        self.time_last_checked = 0;
        if self.state == NodeState::NewStartRequired {
            self.state = NodeState::PreEnabled;
        }
        true
    }

    // ────────────────────────────────────────────────────────────────────────────
    // Predicates
    // ────────────────────────────────────────────────────────────────────────────

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state == NodeState::Enabled
    }

    #[must_use]
    pub fn is_pre_enabled(&self) -> bool {
        self.state == NodeState::PreEnabled
    }

    #[must_use]
    pub fn is_pose_banned(&self) -> bool {
        self.state == NodeState::PoseBan
    }

    #[must_use]
    pub fn is_pose_verified(&self, max_score: i32) -> bool {
        self.pose_score <= -max_score
    }

    #[must_use]
    pub fn is_valid_for_payment(&self, require_watchdog: bool) -> bool {
        match self.state {
            NodeState::Enabled => true,
            NodeState::WatchdogExpired => !require_watchdog,
            _ => false,
        }
    }

    /// Whether the last ping was signed less than `secs` before `at`.
    #[must_use]
    pub fn is_pinged_within(&self, secs: u64, at: u64) -> bool {
        match &self.last_ping {
            Some(ping) => at.saturating_sub(ping.sig_time) < secs,
            None => false,
        }
    }

    #[must_use]
    pub fn is_broadcasted_within(&self, secs: u64, now: u64) -> bool {
        now.saturating_sub(self.sig_time) < secs
    }

    // ────────────────────────────────────────────────────────────────────────────
    // PoSe score
    // ────────────────────────────────────────────────────────────────────────────

    pub fn increase_pose_score(&mut self, max_score: i32) {
        if self.pose_score < max_score {
            self.pose_score += 1;
        }
    }

    pub fn decrease_pose_score(&mut self, max_score: i32) {
        if self.pose_score > -max_score {
            self.pose_score -= 1;
        }
    }

    // ────────────────────────────────────────────────────────────────────────────
    // Governance
    // ────────────────────────────────────────────────────────────────────────────

    pub fn add_governance_vote(&mut self, hash: Hash256) {
        *self.governance_votes.entry(hash).or_insert(0) += 1;
    }

    pub fn remove_governance_object(&mut self, hash: &Hash256) {
        self.governance_votes.remove(hash);
    }

    // ────────────────────────────────────────────────────────────────────────────
    // State evaluation
    // ────────────────────────────────────────────────────────────────────────────

    /// Re-evaluates the lifecycle state. Skipped if the record was checked
    /// within `check_interval_secs`, unless `force`.
    pub(crate) fn check(&mut self, ctx: &CheckContext<'_>, force: bool) {
        if !force
            && self.time_last_checked != 0
            && ctx.now.saturating_sub(self.time_last_checked) < ctx.config.check_interval_secs
        {
            return;
        }
        self.time_last_checked = ctx.now;

        if self.state == NodeState::OutpointSpent {
            return;
        }
        if ctx.chain.is_outpoint_spent(&self.identity) {
            self.set_state(NodeState::OutpointSpent);
            return;
        }

        let height = ctx.chain.best_height().unwrap_or(0);
        let max_score = ctx.config.pose_ban_max_score;
        if self.is_pose_banned() {
            if height < self.pose_ban_height {
                return;
            }
            self.decrease_pose_score(max_score);
        } else if self.pose_score >= max_score {
            self.pose_ban_height = height + ctx.registry_size as u64;
            self.set_state(NodeState::PoseBan);
            return;
        }

        let target = self.evaluate_liveness(ctx);
        self.set_state(target);
    }

    fn evaluate_liveness(&self, ctx: &CheckContext<'_>) -> NodeState {
        let cfg = ctx.config;
        if self.protocol_version < cfg.min_payments_protocol {
            return NodeState::NewStartRequired;
        }
        if !self.is_pinged_within(cfg.new_start_required_secs, ctx.now) {
            return NodeState::NewStartRequired;
        }
        if ctx.watchdog_active
            && ctx.now.saturating_sub(self.time_last_watchdog_vote) > cfg.watchdog_max_secs
        {
            return NodeState::WatchdogExpired;
        }
        if !self.is_pinged_within(cfg.expiration_secs, ctx.now) {
            return NodeState::Expired;
        }
        let ping_gap = self
            .last_ping
            .as_ref()
            .map(|p| p.sig_time.saturating_sub(self.sig_time))
            .unwrap_or(0);
        if ping_gap < cfg.min_ping_interval_secs {
            return NodeState::PreEnabled;
        }
        NodeState::Enabled
    }

    fn set_state(&mut self, target: NodeState) {
        if self.state == target {
            return;
        }
        if !self.state.can_transition_to(target) {
            debug!(node = %self.identity, from = %self.state, to = %target, "state transition refused");
            return;
        }
        debug!(node = %self.identity, from = %self.state, to = %target, "state changed");
        self.state = target;
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// NODE INFO
// ════════════════════════════════════════════════════════════════════════════════

/// Read-only snapshot handed out by lookups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub identity: NodeIdentity,
    pub addr: SocketAddr,
    pub pubkey_collateral: PublicKey,
    pub pubkey_node: PublicKey,
    pub sig_time: u64,
    pub last_ping_time: Option<u64>,
    pub last_dsq: i64,
    pub time_last_checked: u64,
    pub time_last_paid: u64,
    pub block_last_paid: u64,
    pub time_last_watchdog_vote: u64,
    pub state: NodeState,
    pub protocol_version: u32,
    pub pose_score: i32,
}

impl From<&NodeRecord> for NodeInfo {
    fn from(r: &NodeRecord) -> Self {
        NodeInfo {
            identity: r.identity,
            addr: r.addr,
            pubkey_collateral: r.pubkey_collateral,
            pubkey_node: r.pubkey_node,
            sig_time: r.sig_time,
            last_ping_time: r.last_ping.as_ref().map(|p| p.sig_time),
            last_dsq: r.last_dsq,
            time_last_checked: r.time_last_checked,
            time_last_paid: r.time_last_paid,
            block_last_paid: r.block_last_paid,
            time_last_watchdog_vote: r.time_last_watchdog_vote,
            state: r.state,
            protocol_version: r.protocol_version,
            pose_score: r.pose_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChain;

    const T0: u64 = 1_700_000_000;

    fn record(sig_time: u64, ping_time: Option<u64>) -> NodeRecord {
        let identity = NodeIdentity::new([7u8; 32], 0);
        NodeRecord {
            identity,
            addr: "203.0.113.10:8168".parse().expect("addr"),
            pubkey_collateral: [1u8; 32],
            pubkey_node: [2u8; 32],
            last_ping: ping_time.map(|t| NodePing {
                identity,
                block_hash: [0u8; 32],
                sig_time: t,
                signature: vec![0u8; 64],
            }),
            signature: vec![0u8; 64],
            sig_time,
            last_dsq: 0,
            time_last_checked: 0,
            time_last_paid: 0,
            time_last_watchdog_vote: sig_time,
            state: NodeState::PreEnabled,
            block_last_paid: 0,
            protocol_version: 70206,
            pose_score: 0,
            pose_ban_height: 0,
            governance_votes: BTreeMap::new(),
        }
    }

    fn ctx<'a>(chain: &'a MockChain, config: &'a RegistryConfig, now: u64) -> CheckContext<'a> {
        CheckContext { chain, config, now, watchdog_active: false, registry_size: 10 }
    }

    // ── 1. LIVENESS ──────────────────────────────────────────────────────────

    #[test]
    fn test_pre_enabled_until_ping_gap_reached() {
        let chain = MockChain::with_height(100, T0);
        let cfg = RegistryConfig::default();
        let mut r = record(T0, Some(T0 + 60));
        r.check(&ctx(&chain, &cfg, T0 + 61), true);
        assert_eq!(r.state, NodeState::PreEnabled);

        r.last_ping.as_mut().expect("ping").sig_time = T0 + cfg.min_ping_interval_secs;
        r.check(&ctx(&chain, &cfg, T0 + cfg.min_ping_interval_secs + 1), true);
        assert_eq!(r.state, NodeState::Enabled);
    }

    #[test]
    fn test_enabled_expires_and_comes_back() {
        let chain = MockChain::with_height(100, T0);
        let cfg = RegistryConfig::default();
        let ping = T0 + 1000;
        let mut r = record(T0, Some(ping));
        r.check(&ctx(&chain, &cfg, ping + 1), true);
        assert_eq!(r.state, NodeState::Enabled);

        r.check(&ctx(&chain, &cfg, ping + cfg.expiration_secs + 1), true);
        assert_eq!(r.state, NodeState::Expired);

        let later = ping + cfg.expiration_secs + 10;
        r.last_ping.as_mut().expect("ping").sig_time = later;
        r.check(&ctx(&chain, &cfg, later + 1), true);
        assert_eq!(r.state, NodeState::Enabled);
    }

    #[test]
    fn test_new_start_required_is_sticky() {
        let chain = MockChain::with_height(100, T0);
        let cfg = RegistryConfig::default();
        let mut r = record(T0, Some(T0 + 1000));
        r.check(&ctx(&chain, &cfg, T0 + 1000 + cfg.new_start_required_secs), true);
        assert_eq!(r.state, NodeState::NewStartRequired);

        // a fresh ping alone does not revive it
        let now = T0 + 50_000;
        r.last_ping.as_mut().expect("ping").sig_time = now;
        r.check(&ctx(&chain, &cfg, now + 1), true);
        assert_eq!(r.state, NodeState::NewStartRequired);
    }

    #[test]
    fn test_old_protocol_needs_new_start() {
        let chain = MockChain::with_height(100, T0);
        let cfg = RegistryConfig::default();
        let mut r = record(T0, Some(T0 + 1000));
        r.protocol_version = cfg.min_payments_protocol - 1;
        r.check(&ctx(&chain, &cfg, T0 + 1001), true);
        assert_eq!(r.state, NodeState::NewStartRequired);
    }

    #[test]
    fn test_watchdog_expired_only_when_active() {
        let chain = MockChain::with_height(100, T0);
        let cfg = RegistryConfig::default();
        let now = T0 + cfg.watchdog_max_secs + 100;
        let mut r = record(T0, Some(now - 10));
        let mut c = ctx(&chain, &cfg, now);
        r.check(&c, true);
        assert_eq!(r.state, NodeState::Enabled);

        c.watchdog_active = true;
        r.check(&c, true);
        assert_eq!(r.state, NodeState::WatchdogExpired);
    }

    // ── 2. TERMINAL AND BAN ──────────────────────────────────────────────────

    #[test]
    fn test_spent_collateral_is_terminal() {
        let chain = MockChain::with_height(100, T0);
        let cfg = RegistryConfig::default();
        let mut r = record(T0, Some(T0 + 1000));
        chain.set_spent(r.identity);
        r.check(&ctx(&chain, &cfg, T0 + 1001), true);
        assert_eq!(r.state, NodeState::OutpointSpent);

        chain.unset_spent(&r.identity);
        r.check(&ctx(&chain, &cfg, T0 + 1002), true);
        assert_eq!(r.state, NodeState::OutpointSpent);
    }

    #[test]
    fn test_pose_ban_held_until_height_then_decays() {
        let chain = MockChain::with_height(100, T0);
        let cfg = RegistryConfig::default();
        let mut r = record(T0, Some(T0 + 1000));
        r.pose_score = cfg.pose_ban_max_score;
        r.check(&ctx(&chain, &cfg, T0 + 1001), true);
        assert_eq!(r.state, NodeState::PoseBan);
        assert_eq!(r.pose_ban_height, 110);

        r.check(&ctx(&chain, &cfg, T0 + 1002), true);
        assert_eq!(r.state, NodeState::PoseBan);

        chain.extend_to(110, T0 + 1003);
        r.check(&ctx(&chain, &cfg, T0 + 1003), true);
        assert_eq!(r.pose_score, cfg.pose_ban_max_score - 1);
        assert_eq!(r.state, NodeState::Enabled);
    }

    #[test]
    fn test_check_is_cached_unless_forced() {
        let chain = MockChain::with_height(100, T0);
        let cfg = RegistryConfig::default();
        let mut r = record(T0, Some(T0 + 1000));
        r.check(&ctx(&chain, &cfg, T0 + 1001), false);
        assert_eq!(r.state, NodeState::Enabled);

        chain.set_spent(r.identity);
        r.check(&ctx(&chain, &cfg, T0 + 1002), false);
        assert_eq!(r.state, NodeState::Enabled);
        r.check(&ctx(&chain, &cfg, T0 + 1002), true);
        assert_eq!(r.state, NodeState::OutpointSpent);
    }

    // ── 3. SCORE AND UPDATE ──────────────────────────────────────────────────

    #[test]
    fn test_pose_score_is_clamped() {
        let mut r = record(T0, None);
        for _ in 0..20 {
            r.increase_pose_score(5);
        }
        assert_eq!(r.pose_score, 5);
        for _ in 0..20 {
            r.decrease_pose_score(5);
        }
        assert_eq!(r.pose_score, -5);
        assert!(r.is_pose_verified(5));
    }

    #[test]
    fn test_update_requires_newer_broadcast() {
        let mut r = record(T0, None);
        let mut mnb = r.to_broadcast();
        assert!(!r.update_from_broadcast(&mnb));

        mnb.recovery = true;
        assert!(r.update_from_broadcast(&mnb));

        mnb.recovery = false;
        mnb.sig_time = T0 + 1;
        mnb.protocol_version = 70300;
        r.state = NodeState::NewStartRequired;
        r.pose_score = 3;
        assert!(r.update_from_broadcast(&mnb));
        assert_eq!(r.protocol_version, 70300);
        assert_eq!(r.pose_score, 0);
        assert_eq!(r.state, NodeState::PreEnabled);
    }

    #[test]
    fn test_governance_vote_counts() {
        let mut r = record(T0, None);
        r.add_governance_vote([1u8; 32]);
        r.add_governance_vote([1u8; 32]);
        r.add_governance_vote([2u8; 32]);
        assert_eq!(r.governance_votes.get(&[1u8; 32]), Some(&2));
        r.remove_governance_object(&[1u8; 32]);
        assert_eq!(r.governance_votes.len(), 1);
    }
}
