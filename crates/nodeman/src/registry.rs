//! # Node Registry
//!
//! The authoritative collection of node records and every piece of request
//! bookkeeping that goes with it.
//!
//! ## Locking
//!
//! [`NodeRegistry`] holds one `parking_lot::Mutex<RegistryState>`. The node
//! vector, both index generations, the seen maps and all asked/recovery maps
//! sit behind that single lock, so every cross-map invariant is checked and
//! restored inside one critical section.
//!
//! Nothing blocks on I/O under the lock. Operations that talk to peers
//! return a list of [`Action`]s from their `*_locked` helper; the public
//! method drops the guard and then hands them to the transport.
//!
//! ## Invariants
//!
//! 1. At most one record per identity in `nodes`.
//! 2. Every added identity has an ordinal in `index`. Ordinals of removed
//!    nodes stay reserved until the next rebuild and are never resolved by
//!    the public ordinal lookups.
//! 3. `index_rebuilt` is observed at most once per rebuild.

use noir_common::{
    ChainView, Clock, Hash256, MessageVerifier, MessageSigner, NodeBroadcast, NodeIdentity,
    NodePing, NodeState, NodeVerification, PayeeScript, PublicKey, RegistryConfig,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

use crate::index::NodeIndex;
use crate::record::{CheckContext, NodeInfo, NodeRecord};
use crate::recovery::RecoveryRequest;
use crate::transport::{Action, GovernanceNotifier, Transport};
use crate::verification::FulfilledKind;
use crate::{LAST_PAID_SCAN_BLOCKS, MAX_EXPECTED_INDEX_SIZE, MAX_POSE_BLOCKS, MIN_INDEX_REBUILD_TIME};

// ════════════════════════════════════════════════════════════════════════════════
// LOCAL NODE
// ════════════════════════════════════════════════════════════════════════════════

/// The service node run by this process, if any.
#[derive(Clone)]
pub struct LocalNode {
    pub identity: NodeIdentity,
    pub addr: SocketAddr,
    /// Node key. Signs pings and verification replies.
    pub signer: Arc<dyn MessageSigner>,
}

impl LocalNode {
    pub fn pubkey(&self) -> PublicKey {
        self.signer.public_key()
    }
}

impl fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalNode")
            .field("identity", &self.identity)
            .field("addr", &self.addr)
            .finish()
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// STATE
// ════════════════════════════════════════════════════════════════════════════════

/// Everything guarded by the registry lock.
#[derive(Debug, Default)]
pub(crate) struct RegistryState {
    pub(crate) nodes: Vec<NodeRecord>,
    /// Peer → time after which it may ask us for the full list again.
    pub(crate) asked_us_for_list: BTreeMap<IpAddr, u64>,
    /// Peer → time after which we may ask it for the full list again.
    pub(crate) we_asked_for_list: BTreeMap<IpAddr, u64>,
    pub(crate) we_asked_for_list_entry: BTreeMap<NodeIdentity, BTreeMap<IpAddr, u64>>,
    pub(crate) we_asked_for_verification: BTreeMap<IpAddr, NodeVerification>,
    pub(crate) recovery_requests: BTreeMap<Hash256, RecoveryRequest>,
    pub(crate) recovery_good_replies: BTreeMap<Hash256, Vec<NodeBroadcast>>,
    pub(crate) scheduled_requests: VecDeque<(SocketAddr, Hash256)>,
    /// Connections we opened ourselves and close in `process_node_connections`.
    pub(crate) temp_connections: BTreeSet<SocketAddr>,
    /// (peer, request kind) → expiry time.
    pub(crate) fulfilled: BTreeMap<(IpAddr, FulfilledKind), u64>,
    pub(crate) last_index_rebuild_time: u64,
    pub(crate) index: NodeIndex,
    pub(crate) index_old: NodeIndex,
    pub(crate) index_rebuilt: bool,
    pub(crate) nodes_added: bool,
    pub(crate) nodes_removed: bool,
    pub(crate) dirty_governance_hashes: Vec<Hash256>,
    pub(crate) last_watchdog_vote_time: u64,
    /// Broadcast hash → (first seen, broadcast).
    pub(crate) seen_broadcasts: BTreeMap<Hash256, (u64, NodeBroadcast)>,
    pub(crate) seen_pings: BTreeMap<Hash256, NodePing>,
    pub(crate) seen_verifications: BTreeMap<Hash256, NodeVerification>,
    pub(crate) dsq_count: i64,
    pub(crate) last_paid_scanned: bool,
}

impl RegistryState {
    pub(crate) fn position(&self, identity: &NodeIdentity) -> Option<usize> {
        self.nodes.iter().position(|r| r.identity == *identity)
    }

    pub(crate) fn position_by_pubkey(&self, pubkey: &PublicKey) -> Option<usize> {
        self.nodes.iter().position(|r| r.pubkey_node == *pubkey)
    }

    pub(crate) fn find(&self, identity: &NodeIdentity) -> Option<&NodeRecord> {
        self.nodes.iter().find(|r| r.identity == *identity)
    }

    pub(crate) fn find_mut(&mut self, identity: &NodeIdentity) -> Option<&mut NodeRecord> {
        self.nodes.iter_mut().find(|r| r.identity == *identity)
    }

    pub(crate) fn has(&self, identity: &NodeIdentity) -> bool {
        self.position(identity).is_some()
    }

    /// Appends a record and gives it an ordinal. Rejects duplicates and the
    /// null identity.
    pub(crate) fn add(&mut self, record: NodeRecord) -> bool {
        if record.identity.is_null() || self.has(&record.identity) {
            return false;
        }
        debug!(node = %record.identity, addr = %record.addr, "adding node");
        self.index.insert(record.identity);
        self.nodes.push(record);
        self.nodes_added = true;
        true
    }

    /// Removes the record at `pos` and every map entry derived from it.
    pub(crate) fn remove_at(&mut self, pos: usize) -> NodeRecord {
        let record = self.nodes.remove(pos);
        let hash = record.broadcast_hash();
        self.seen_broadcasts.remove(&hash);
        self.seen_pings.retain(|_, p| p.identity != record.identity);
        self.we_asked_for_list_entry.remove(&record.identity);
        self.recovery_requests.remove(&hash);
        self.recovery_good_replies.remove(&hash);
        self.dirty_governance_hashes.extend(record.governance_votes.keys().copied());
        self.nodes_removed = true;
        record
    }

    pub(crate) fn count_nodes(&self, min_protocol: u32) -> usize {
        self.nodes.iter().filter(|r| r.protocol_version >= min_protocol).count()
    }

    pub(crate) fn count_enabled(&self, min_protocol: u32) -> usize {
        self.nodes
            .iter()
            .filter(|r| r.protocol_version >= min_protocol && r.is_enabled())
            .count()
    }

    pub(crate) fn is_watchdog_active(&self, now: u64, watchdog_max_secs: u64) -> bool {
        now.saturating_sub(self.last_watchdog_vote_time) <= watchdog_max_secs
    }

    /// Stores an accepted ping on the record and on its seen broadcast.
    pub(crate) fn set_last_ping(&mut self, identity: &NodeIdentity, ping: NodePing) {
        let Some(record) = self.find_mut(identity) else {
            return;
        };
        record.last_ping = Some(ping.clone());
        let hash = record.broadcast_hash();
        if let Some((_, mnb)) = self.seen_broadcasts.get_mut(&hash) {
            mnb.last_ping = Some(ping.clone());
        }
        self.seen_pings.insert(ping.hash(), ping);
    }

    /// Replaces the current index with one rebuilt from the live records,
    /// demoting the current one to the old generation.
    ///
    /// Runs only when the index holds more than `MAX_EXPECTED_INDEX_SIZE`
    /// entries, more entries than there are records, and the previous
    /// rebuild is at least `MIN_INDEX_REBUILD_TIME` old.
    pub(crate) fn check_and_rebuild_index(&mut self, now: u64) -> bool {
        if now.saturating_sub(self.last_index_rebuild_time) < MIN_INDEX_REBUILD_TIME {
            return false;
        }
        if self.index.size() <= MAX_EXPECTED_INDEX_SIZE {
            return false;
        }
        if self.index.size() <= self.nodes.len() {
            return false;
        }

        let mut fresh = NodeIndex::new();
        for record in &self.nodes {
            fresh.insert(record.identity);
        }
        info!(old_size = self.index.size(), new_size = fresh.size(), "rebuilt node index");
        self.index_old = std::mem::replace(&mut self.index, fresh);
        self.index_rebuilt = true;
        self.last_index_rebuild_time = now;
        true
    }

    /// Drops everything, as after a version mismatch on load.
    pub(crate) fn clear(&mut self) {
        *self = RegistryState::default();
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// REGISTRY
// ════════════════════════════════════════════════════════════════════════════════

/// Shared handle to the node registry and its collaborators.
pub struct NodeRegistry {
    pub(crate) state: Mutex<RegistryState>,
    pub(crate) config: RegistryConfig,
    pub(crate) chain: Arc<dyn ChainView>,
    pub(crate) verifier: Arc<dyn MessageVerifier>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) notifier: Arc<dyn GovernanceNotifier>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) local: Option<LocalNode>,
}

impl NodeRegistry {
    pub fn new(
        config: RegistryConfig,
        chain: Arc<dyn ChainView>,
        verifier: Arc<dyn MessageVerifier>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn GovernanceNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        NodeRegistry {
            state: Mutex::new(RegistryState::default()),
            config,
            chain,
            verifier,
            transport,
            notifier,
            clock,
            local: None,
        }
    }

    /// Marks this process as running the given service node.
    pub fn with_local_node(mut self, local: LocalNode) -> Self {
        self.local = Some(local);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn local_node(&self) -> Option<&LocalNode> {
        self.local.as_ref()
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now()
    }

    pub(crate) fn is_local_pubkey(&self, pubkey: &PublicKey) -> bool {
        self.local.as_ref().is_some_and(|l| l.pubkey() == *pubkey)
    }

    fn min_protocol(&self, min_protocol: Option<u32>) -> u32 {
        min_protocol.unwrap_or(self.config.min_payments_protocol)
    }

    pub(crate) fn check_ctx(&self, st: &RegistryState, now: u64) -> CheckContext<'_> {
        CheckContext {
            chain: self.chain.as_ref(),
            config: &self.config,
            now,
            watchdog_active: st.is_watchdog_active(now, self.config.watchdog_max_secs),
            registry_size: st.nodes.len(),
        }
    }

    pub(crate) fn check_node_at(&self, st: &mut RegistryState, pos: usize, force: bool, now: u64) {
        let ctx = self.check_ctx(st, now);
        if let Some(record) = st.nodes.get_mut(pos) {
            record.check(&ctx, force);
        }
    }

    pub(crate) fn check_all_locked(&self, st: &mut RegistryState, now: u64) {
        let ctx = self.check_ctx(st, now);
        for record in st.nodes.iter_mut() {
            record.check(&ctx, false);
        }
    }

    // ────────────────────────────────────────────────────────────────────────────
    // Membership and lookup
    // ────────────────────────────────────────────────────────────────────────────

    /// Adds a record. Returns `false` if the identity is already known or
    /// null.
    pub fn add(&self, record: NodeRecord) -> bool {
        self.state.lock().add(record)
    }

    pub fn has(&self, identity: &NodeIdentity) -> bool {
        self.state.lock().has(identity)
    }

    pub fn find(&self, identity: &NodeIdentity) -> Option<NodeRecord> {
        self.state.lock().find(identity).cloned()
    }

    /// Lookup by node key.
    pub fn find_by_pubkey(&self, pubkey: &PublicKey) -> Option<NodeRecord> {
        let st = self.state.lock();
        st.position_by_pubkey(pubkey).map(|p| st.nodes[p].clone())
    }

    pub fn find_by_payee(&self, payee: &PayeeScript) -> Option<NodeRecord> {
        self.state
            .lock()
            .nodes
            .iter()
            .find(|r| r.payee_script() == *payee)
            .cloned()
    }

    pub fn get_info(&self, identity: &NodeIdentity) -> Option<NodeInfo> {
        self.state.lock().find(identity).map(NodeInfo::from)
    }

    pub fn get_info_by_pubkey(&self, pubkey: &PublicKey) -> Option<NodeInfo> {
        let st = self.state.lock();
        st.position_by_pubkey(pubkey).map(|p| NodeInfo::from(&st.nodes[p]))
    }

    pub fn full_node_list(&self) -> Vec<NodeRecord> {
        self.state.lock().nodes.clone()
    }

    pub fn size(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Nodes speaking at least `min_protocol` (default: payments floor).
    pub fn count_nodes(&self, min_protocol: Option<u32>) -> usize {
        let min = self.min_protocol(min_protocol);
        self.state.lock().count_nodes(min)
    }

    pub fn count_enabled(&self, min_protocol: Option<u32>) -> usize {
        let min = self.min_protocol(min_protocol);
        self.state.lock().count_enabled(min)
    }

    // ────────────────────────────────────────────────────────────────────────────
    // State checks
    // ────────────────────────────────────────────────────────────────────────────

    /// Re-evaluates every record (subject to the per-record cache).
    pub fn check(&self) {
        let now = self.now();
        let mut st = self.state.lock();
        self.check_all_locked(&mut st, now);
    }

    pub fn check_node(&self, identity: &NodeIdentity, force: bool) {
        let now = self.now();
        let mut st = self.state.lock();
        if let Some(pos) = st.position(identity) {
            self.check_node_at(&mut st, pos, force, now);
        }
    }

    pub fn check_node_by_pubkey(&self, pubkey: &PublicKey, force: bool) {
        let now = self.now();
        let mut st = self.state.lock();
        if let Some(pos) = st.position_by_pubkey(pubkey) {
            self.check_node_at(&mut st, pos, force, now);
        }
    }

    pub fn node_state(&self, identity: &NodeIdentity) -> Option<NodeState> {
        self.state.lock().find(identity).map(|r| r.state)
    }

    pub fn node_state_by_pubkey(&self, pubkey: &PublicKey) -> Option<NodeState> {
        let st = self.state.lock();
        st.position_by_pubkey(pubkey).map(|p| st.nodes[p].state)
    }

    /// Whether the node pinged less than `secs` before `at` (default: now).
    pub fn is_pinged_within(&self, identity: &NodeIdentity, secs: u64, at: Option<u64>) -> bool {
        let at = at.unwrap_or_else(|| self.now());
        self.state
            .lock()
            .find(identity)
            .is_some_and(|r| r.is_pinged_within(secs, at))
    }

    pub fn set_last_ping(&self, identity: &NodeIdentity, ping: NodePing) {
        self.state.lock().set_last_ping(identity, ping);
    }

    // ────────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ────────────────────────────────────────────────────────────────────────────

    /// Removes dead nodes, opens and resolves recovery requests, expires
    /// bookkeeping, then checks whether the index needs a rebuild.
    pub fn check_and_remove(&self) {
        let actions = {
            let mut st = self.state.lock();
            self.check_and_remove_locked(&mut st)
        };
        self.dispatch(actions);
    }

    pub(crate) fn check_and_remove_locked(&self, st: &mut RegistryState) -> Vec<Action> {
        let now = self.now();
        let cfg = &self.config;
        let mut actions = Vec::new();

        self.check_all_locked(st, now);

        let mut pos = 0;
        while pos < st.nodes.len() {
            let record = &st.nodes[pos];
            let last_seen = record.last_ping.as_ref().map_or(record.sig_time, |p| p.sig_time);
            let spent = record.state == NodeState::OutpointSpent;
            let gone = now.saturating_sub(last_seen) >= cfg.removal_secs;
            if spent || gone {
                let removed = st.remove_at(pos);
                info!(
                    node = %removed.identity,
                    addr = %removed.addr,
                    state = %removed.state,
                    remaining = st.nodes.len(),
                    "removing node"
                );
            } else {
                pos += 1;
            }
        }

        self.open_recovery_requests_locked(st, now);
        actions.extend(self.process_recovery_replies_locked(st, now));
        st.recovery_requests
            .retain(|_, req| !req.retry_window_elapsed(now));

        st.asked_us_for_list.retain(|_, until| *until >= now);
        st.we_asked_for_list.retain(|_, until| *until >= now);
        for peers in st.we_asked_for_list_entry.values_mut() {
            peers.retain(|_, until| *until >= now);
        }
        st.we_asked_for_list_entry.retain(|_, peers| !peers.is_empty());
        st.fulfilled.retain(|_, until| *until >= now);

        let tip = self.chain.best_height().unwrap_or(0);
        let floor = tip.saturating_sub(MAX_POSE_BLOCKS);
        let in_window = |height: u64| height >= floor && height <= tip;
        st.we_asked_for_verification.retain(|_, mnv| in_window(mnv.block_height));
        st.seen_verifications.retain(|_, mnv| in_window(mnv.block_height));

        let nsr = cfg.new_start_required_secs;
        let latest = now.saturating_add(cfg.max_sig_time_drift_secs);
        st.seen_pings
            .retain(|_, ping| !ping.is_expired(now, nsr) && ping.sig_time <= latest);

        // superseded or orphaned broadcasts live for one removal window
        let current: BTreeSet<Hash256> = st.nodes.iter().map(NodeRecord::broadcast_hash).collect();
        st.seen_broadcasts.retain(|hash, (first_seen, _)| {
            current.contains(hash) || now.saturating_sub(*first_seen) < cfg.removal_secs
        });

        st.check_and_rebuild_index(now);
        info!("check_and_remove: {}", summary_of(st));
        actions
    }

    /// Drops every record and map.
    pub fn clear(&self) {
        self.state.lock().clear();
    }

    // ────────────────────────────────────────────────────────────────────────────
    // Watchdog and dsq
    // ────────────────────────────────────────────────────────────────────────────

    pub fn is_watchdog_active(&self) -> bool {
        let now = self.now();
        self.state.lock().is_watchdog_active(now, self.config.watchdog_max_secs)
    }

    pub fn update_watchdog_vote_time(&self, identity: &NodeIdentity) {
        let now = self.now();
        let mut st = self.state.lock();
        let Some(record) = st.find_mut(identity) else {
            return;
        };
        record.time_last_watchdog_vote = now;
        st.last_watchdog_vote_time = now;
    }

    pub fn dsq_count(&self) -> i64 {
        self.state.lock().dsq_count
    }

    /// Bumps the mixing-queue counter and stamps it on the node.
    pub fn mark_dsq(&self, identity: &NodeIdentity) -> Option<i64> {
        let mut st = self.state.lock();
        let pos = st.position(identity)?;
        st.dsq_count += 1;
        let count = st.dsq_count;
        st.nodes[pos].last_dsq = count;
        Some(count)
    }

    // ────────────────────────────────────────────────────────────────────────────
    // Stable index
    // ────────────────────────────────────────────────────────────────────────────

    /// Identity at `ordinal` in the current index, and whether the index
    /// was rebuilt since the flag was last observed.
    pub fn get_by_ordinal(&self, ordinal: usize) -> (Option<NodeIdentity>, bool) {
        let mut st = self.state.lock();
        let rebuilt = std::mem::take(&mut st.index_rebuilt);
        let identity = st.index.get(ordinal).filter(|id| st.has(id));
        (identity, rebuilt)
    }

    pub fn ordinal_of(&self, identity: &NodeIdentity) -> Option<usize> {
        let st = self.state.lock();
        if !st.has(identity) {
            return None;
        }
        st.index.ordinal_of(identity)
    }

    pub fn get_by_ordinal_old(&self, ordinal: usize) -> Option<NodeIdentity> {
        self.state.lock().index_old.get(ordinal)
    }

    pub fn ordinal_of_old(&self, identity: &NodeIdentity) -> Option<usize> {
        self.state.lock().index_old.ordinal_of(identity)
    }

    pub fn index_size(&self) -> usize {
        self.state.lock().index.size()
    }

    /// Drops the previous generation once consumers have moved over.
    pub fn clear_old_index(&self) {
        let mut st = self.state.lock();
        st.index_old.clear();
        st.index_rebuilt = false;
    }

    pub fn take_index_rebuilt_flag(&self) -> bool {
        std::mem::take(&mut self.state.lock().index_rebuilt)
    }

    // ────────────────────────────────────────────────────────────────────────────
    // Chain tip
    // ────────────────────────────────────────────────────────────────────────────

    /// Called on every new best block.
    pub fn updated_block_tip(&self, height: u64) {
        debug!(height, "updated block tip");
        let mut st = self.state.lock();
        self.check_same_addr_locked(&mut st);
        if self.local.is_some() {
            self.update_last_paid_locked(&mut st, height);
        }
    }

    pub fn update_last_paid(&self) {
        let Some(tip) = self.chain.best_height() else {
            return;
        };
        let mut st = self.state.lock();
        self.update_last_paid_locked(&mut st, tip);
    }

    /// Records the most recent payment of every node found in the last
    /// blocks. The first scan covers `payments_storage_limit` blocks.
    pub(crate) fn update_last_paid_locked(&self, st: &mut RegistryState, tip: u64) {
        let window = if !st.last_paid_scanned || self.local.is_none() {
            self.config.payments_storage_limit
        } else {
            LAST_PAID_SCAN_BLOCKS
        };
        st.last_paid_scanned = true;
        if window == 0 {
            return;
        }

        let lowest = tip.saturating_sub(window - 1);
        let mut latest: HashMap<PayeeScript, (u64, u64)> = HashMap::new();
        for height in (lowest..=tip).rev() {
            if let Some(payee) = self.chain.payee_at(height) {
                let time = self.chain.block_time(height).unwrap_or(0);
                latest.entry(payee).or_insert((height, time));
            }
        }

        for record in st.nodes.iter_mut() {
            if let Some(&(height, time)) = latest.get(&record.payee_script()) {
                if height > record.block_last_paid {
                    record.block_last_paid = height;
                    record.time_last_paid = time;
                }
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────────────
    // Periodic engine
    // ────────────────────────────────────────────────────────────────────────────

    /// One maintenance round: cleanup, connection housekeeping, verification
    /// sweep, then governance notification with the lock released.
    pub fn tick(&self) {
        self.check_and_remove();
        self.process_node_connections();
        self.run_scheduled_connections();
        self.do_full_verification_step();
        self.notify_node_updates();
    }

    /// One-line counts for logs.
    pub fn summary(&self) -> String {
        summary_of(&self.state.lock())
    }
}

fn summary_of(st: &RegistryState) -> String {
    format!(
        "nodes: {}, peers who asked us for list: {}, peers we asked for list: {}, \
         entries we asked for: {}, index size: {}, dsq count: {}",
        st.nodes.len(),
        st.asked_us_for_list.len(),
        st.we_asked_for_list.len(),
        st.we_asked_for_list_entry.len(),
        st.index.size(),
        st.dsq_count
    )
}

impl fmt::Display for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{node_addr, node_record, signed_ping, TestHarness};

    const T0: u64 = 1_700_000_000;

    fn id(n: u8) -> NodeIdentity {
        NodeIdentity::new([n; 32], 0)
    }

    // ── 1. MEMBERSHIP ────────────────────────────────────────────────────────

    #[test]
    fn test_add_rejects_duplicates_and_null() {
        let h = TestHarness::new(T0, 200);
        assert!(h.registry.add(node_record(id(1), T0)));
        assert!(!h.registry.add(node_record(id(1), T0 + 5)));
        assert!(!h.registry.add(node_record(NodeIdentity::null(), T0)));
        assert_eq!(h.registry.size(), 1);
        assert_eq!(h.registry.ordinal_of(&id(1)), Some(0));
    }

    #[test]
    fn test_lookups_return_snapshots() {
        let h = TestHarness::new(T0, 200);
        let mut record = node_record(id(2), T0);
        record.pubkey_node = [42u8; 32];
        h.registry.add(record.clone());

        let mut copy = h.registry.find(&id(2)).expect("found");
        copy.protocol_version = 1;
        assert_eq!(h.registry.find(&id(2)).expect("found").protocol_version, record.protocol_version);

        assert_eq!(h.registry.find_by_pubkey(&[42u8; 32]).map(|r| r.identity), Some(id(2)));
        assert_eq!(
            h.registry.find_by_payee(&record.payee_script()).map(|r| r.identity),
            Some(id(2))
        );
        assert!(h.registry.find_by_pubkey(&[43u8; 32]).is_none());
    }

    // ── 2. REMOVAL ───────────────────────────────────────────────────────────

    #[test]
    fn test_check_and_remove_purges_spent_nodes() {
        let h = TestHarness::new(T0, 200);
        let record = node_record(id(3), T0 - 1000);
        let hash = record.broadcast_hash();
        h.registry.add(record.clone());
        {
            let mut st = h.registry.state.lock();
            st.seen_broadcasts.insert(hash, (T0, record.to_broadcast()));
            st.nodes[0].add_governance_vote([5u8; 32]);
        }
        h.chain.set_spent(id(3));
        h.registry.check_and_remove();

        assert!(!h.registry.has(&id(3)));
        let st = h.registry.state.lock();
        assert!(st.seen_broadcasts.is_empty());
        assert!(st.nodes_removed);
        assert_eq!(st.dirty_governance_hashes, vec![[5u8; 32]]);
        // ordinal stays reserved but no longer resolves
        assert_eq!(st.index.ordinal_of(&id(3)), Some(0));
        drop(st);
        assert_eq!(h.registry.get_by_ordinal(0).0, None);
    }

    #[test]
    fn test_check_and_remove_drops_long_silent_nodes() {
        let h = TestHarness::new(T0, 200);
        let cfg = RegistryConfig::default();
        h.registry.add(node_record(id(4), T0 - cfg.removal_secs - 10));
        h.registry.add(node_record(id(5), T0 - 1000));
        h.registry.check_and_remove();
        assert!(!h.registry.has(&id(4)));
        assert!(h.registry.has(&id(5)));
    }

    #[test]
    fn test_check_and_remove_expires_asked_maps() {
        let h = TestHarness::new(T0, 200);
        let peer: IpAddr = "198.51.100.9".parse().expect("ip");
        {
            let mut st = h.registry.state.lock();
            st.asked_us_for_list.insert(peer, T0 - 1);
            st.we_asked_for_list.insert(peer, T0 + 100);
            st.we_asked_for_list_entry.entry(id(9)).or_default().insert(peer, T0 - 1);
        }
        h.registry.check_and_remove();
        let st = h.registry.state.lock();
        assert!(st.asked_us_for_list.is_empty());
        assert_eq!(st.we_asked_for_list.len(), 1);
        assert!(st.we_asked_for_list_entry.is_empty());
    }

    #[test]
    fn test_check_and_remove_prunes_seen_maps() {
        let h = TestHarness::new(T0, 200);
        let orphan = node_record(id(2), T0).to_broadcast();
        let future_ping = signed_ping(id(3), [0u8; 32], u64::MAX);
        let recent = NodeVerification::request(node_addr(&id(4)), 1, 199);
        let beyond_tip = NodeVerification::request(node_addr(&id(4)), 2, u64::MAX);
        {
            let mut st = h.registry.state.lock();
            st.seen_broadcasts.insert(orphan.hash(), (T0, orphan.clone()));
            st.seen_pings.insert(future_ping.hash(), future_ping.clone());
            st.seen_verifications.insert(recent.hash(), recent.clone());
            st.seen_verifications.insert(beyond_tip.hash(), beyond_tip.clone());
        }

        h.clock.advance(RegistryConfig::default().removal_secs);
        let record = node_record(id(1), h.now() - 100);
        let current = record.to_broadcast();
        let mut superseded = current.clone();
        superseded.sig_time -= 5000;
        h.registry.add(record);
        {
            let mut st = h.registry.state.lock();
            st.seen_broadcasts.insert(current.hash(), (T0, current.clone()));
            st.seen_broadcasts.insert(superseded.hash(), (T0, superseded.clone()));
        }

        h.registry.check_and_remove();
        let st = h.registry.state.lock();
        assert_eq!(st.seen_broadcasts.keys().copied().collect::<Vec<_>>(), vec![current.hash()]);
        assert!(!st.seen_pings.contains_key(&future_ping.hash()));
        assert!(st.seen_verifications.contains_key(&recent.hash()));
        assert!(!st.seen_verifications.contains_key(&beyond_tip.hash()));
    }

    // ── 3. INDEX REBUILD ─────────────────────────────────────────────────────

    fn bloated_state(index_entries: usize, live: usize) -> RegistryState {
        let mut st = RegistryState::default();
        for n in 0..index_entries {
            st.index.insert(NodeIdentity::new([0xee; 32], n as u32 + 1));
        }
        for n in 0..live {
            st.nodes.push(node_record(NodeIdentity::new([0xee; 32], n as u32 + 1), T0));
        }
        st
    }

    #[test]
    fn test_rebuild_when_index_sparse() {
        let mut st = bloated_state(MAX_EXPECTED_INDEX_SIZE + 1, 3);
        assert!(st.check_and_rebuild_index(T0));
        assert_eq!(st.index.size(), 3);
        assert_eq!(st.index_old.size(), MAX_EXPECTED_INDEX_SIZE + 1);
        assert!(st.index_rebuilt);
        assert_eq!(st.last_index_rebuild_time, T0);
    }

    #[test]
    fn test_no_rebuild_at_threshold_or_too_soon() {
        let mut st = bloated_state(MAX_EXPECTED_INDEX_SIZE, 3);
        assert!(!st.check_and_rebuild_index(T0));
        assert_eq!(st.index.size(), MAX_EXPECTED_INDEX_SIZE);

        let mut st = bloated_state(MAX_EXPECTED_INDEX_SIZE + 1, 3);
        st.last_index_rebuild_time = T0 - MIN_INDEX_REBUILD_TIME + 1;
        assert!(!st.check_and_rebuild_index(T0));
        assert!(!st.index_rebuilt);
    }

    #[test]
    fn test_no_rebuild_when_population_matches() {
        let mut st = bloated_state(MAX_EXPECTED_INDEX_SIZE + 1, MAX_EXPECTED_INDEX_SIZE + 1);
        assert!(!st.check_and_rebuild_index(T0));
    }

    #[test]
    fn test_rebuilt_flag_observed_once() {
        let h = TestHarness::new(T0, 200);
        h.registry.add(node_record(id(1), T0));
        h.registry.state.lock().index_rebuilt = true;
        let (found, rebuilt) = h.registry.get_by_ordinal(0);
        assert_eq!(found, Some(id(1)));
        assert!(rebuilt);
        assert!(!h.registry.get_by_ordinal(0).1);
        assert!(!h.registry.take_index_rebuilt_flag());
    }

    // ── 4. WATCHDOG, DSQ, LAST PAID ──────────────────────────────────────────

    #[test]
    fn test_watchdog_vote_activates_watchdog() {
        let h = TestHarness::new(T0, 200);
        h.registry.add(node_record(id(1), T0));
        assert!(!h.registry.is_watchdog_active());
        h.registry.update_watchdog_vote_time(&id(1));
        assert!(h.registry.is_watchdog_active());
        assert_eq!(h.registry.get_info(&id(1)).expect("info").time_last_watchdog_vote, T0);
    }

    #[test]
    fn test_mark_dsq_stamps_counter() {
        let h = TestHarness::new(T0, 200);
        h.registry.add(node_record(id(1), T0));
        h.registry.add(node_record(id(2), T0));
        assert_eq!(h.registry.mark_dsq(&id(2)), Some(1));
        assert_eq!(h.registry.mark_dsq(&id(1)), Some(2));
        assert_eq!(h.registry.mark_dsq(&id(9)), None);
        assert_eq!(h.registry.dsq_count(), 2);
        assert_eq!(h.registry.get_info(&id(1)).expect("info").last_dsq, 2);
    }

    #[test]
    fn test_update_last_paid_takes_most_recent_payment() {
        let h = TestHarness::new(T0, 200);
        let record = node_record(id(1), T0);
        let payee = record.payee_script();
        h.registry.add(record);
        h.chain.set_payee(150, payee.clone());
        h.chain.set_payee(180, payee);
        h.registry.update_last_paid();
        let info = h.registry.get_info(&id(1)).expect("info");
        assert_eq!(info.block_last_paid, 180);
        assert_eq!(info.time_last_paid, h.chain.block_time(180).expect("time"));
    }
}
