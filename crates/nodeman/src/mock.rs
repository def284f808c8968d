//! # In-Memory Collaborators
//!
//! Deterministic stand-ins for the chain, clock, transport and governance
//! notifier, plus builders for records and signed payloads.
//!
//! Keys are derived from the node identity, so a record built with
//! [`node_record`] and a broadcast built with [`signed_broadcast`] for the
//! same identity agree on address, keys and protocol version.
//!
//! Block hashes depend only on the height. Two [`MockChain`]s of the same
//! height therefore describe the same chain.

use noir_common::{
    ChainView, Clock, Ed25519Signer, Ed25519Verifier, Hash256, InventoryItem, MessageSigner,
    NodeBroadcast, NodeIdentity, NodeMessage, NodePing, NodeState, PayeeScript, RegistryConfig,
};
use parking_lot::Mutex;
use sha3::{Digest, Sha3_256};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::record::NodeRecord;
use crate::registry::{LocalNode, NodeRegistry};
use crate::transport::{GovernanceNotifier, Transport};

/// Seconds between consecutive mock blocks.
pub const BLOCK_SPACING: u64 = 150;

/// Protocol version used by the builders.
pub const TEST_PROTOCOL: u32 = 70206;

// ════════════════════════════════════════════════════════════════════════════════
// CHAIN
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct ChainInner {
    /// (hash, time) per height.
    blocks: Vec<(Hash256, u64)>,
    spent: BTreeSet<NodeIdentity>,
    payees: BTreeMap<u64, PayeeScript>,
}

#[derive(Default)]
pub struct MockChain {
    inner: Mutex<ChainInner>,
}

fn mock_block_hash(height: u64) -> Hash256 {
    let mut hasher = Sha3_256::new();
    hasher.update(b"noir-mock-block");
    hasher.update(height.to_le_bytes());
    hasher.finalize().into()
}

impl MockChain {
    /// Blocks `0..=tip`, the tip stamped `tip_time`.
    pub fn with_height(tip: u64, tip_time: u64) -> Self {
        let chain = MockChain::default();
        chain.extend_to(tip, tip_time);
        chain
    }

    /// Appends blocks up to `tip`, spaced `BLOCK_SPACING` back from
    /// `tip_time`.
    pub fn extend_to(&self, tip: u64, tip_time: u64) {
        let mut inner = self.inner.lock();
        let start = inner.blocks.len() as u64;
        for height in start..=tip {
            let time = tip_time.saturating_sub((tip - height) * BLOCK_SPACING);
            inner.blocks.push((mock_block_hash(height), time));
        }
    }

    pub fn set_spent(&self, identity: NodeIdentity) {
        self.inner.lock().spent.insert(identity);
    }

    pub fn unset_spent(&self, identity: &NodeIdentity) {
        self.inner.lock().spent.remove(identity);
    }

    pub fn set_payee(&self, height: u64, payee: PayeeScript) {
        self.inner.lock().payees.insert(height, payee);
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.inner.lock().blocks.last().map(|b| b.0).unwrap_or_default()
    }
}

impl ChainView for MockChain {
    fn best_height(&self) -> Option<u64> {
        (self.inner.lock().blocks.len() as u64).checked_sub(1)
    }

    fn block_hash(&self, height: u64) -> Option<Hash256> {
        let index = usize::try_from(height).ok()?;
        self.inner.lock().blocks.get(index).map(|b| b.0)
    }

    fn block_time(&self, height: u64) -> Option<u64> {
        let index = usize::try_from(height).ok()?;
        self.inner.lock().blocks.get(index).map(|b| b.1)
    }

    fn height_of(&self, hash: &Hash256) -> Option<u64> {
        self.inner
            .lock()
            .blocks
            .iter()
            .position(|b| b.0 == *hash)
            .map(|h| h as u64)
    }

    fn is_outpoint_spent(&self, identity: &NodeIdentity) -> bool {
        self.inner.lock().spent.contains(identity)
    }

    fn payee_at(&self, height: u64) -> Option<PayeeScript> {
        self.inner.lock().payees.get(&height).cloned()
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// CLOCK
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        ManualClock { now: AtomicU64::new(now) }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// TRANSPORT AND NOTIFIER
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct TransportLog {
    sent: Vec<(SocketAddr, NodeMessage)>,
    relayed: Vec<InventoryItem>,
    connected: Vec<SocketAddr>,
    disconnected: Vec<SocketAddr>,
    refuse: bool,
}

/// Records every call. Connection attempts are recorded even when refused.
#[derive(Default)]
pub struct RecordingTransport {
    log: Mutex<TransportLog>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(SocketAddr, NodeMessage)> {
        self.log.lock().sent.clone()
    }

    pub fn relayed(&self) -> Vec<InventoryItem> {
        self.log.lock().relayed.clone()
    }

    pub fn connected(&self) -> Vec<SocketAddr> {
        self.log.lock().connected.clone()
    }

    pub fn disconnected(&self) -> Vec<SocketAddr> {
        self.log.lock().disconnected.clone()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.log.lock().refuse = refuse;
    }

    pub fn clear(&self) {
        let mut log = self.log.lock();
        log.sent.clear();
        log.relayed.clear();
        log.connected.clear();
        log.disconnected.clear();
    }
}

impl Transport for RecordingTransport {
    fn send(&self, peer: SocketAddr, message: NodeMessage) {
        self.log.lock().sent.push((peer, message));
    }

    fn relay(&self, item: InventoryItem) {
        self.log.lock().relayed.push(item);
    }

    fn connect(&self, addr: SocketAddr) -> bool {
        let mut log = self.log.lock();
        log.connected.push(addr);
        !log.refuse
    }

    fn disconnect(&self, addr: SocketAddr) {
        self.log.lock().disconnected.push(addr);
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    added: AtomicUsize,
    removed: AtomicUsize,
}

impl RecordingNotifier {
    pub fn added(&self) -> usize {
        self.added.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}

impl GovernanceNotifier for RecordingNotifier {
    fn nodes_added(&self) {
        self.added.fetch_add(1, Ordering::SeqCst);
    }

    fn nodes_removed(&self) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// BUILDERS
// ════════════════════════════════════════════════════════════════════════════════

fn derived_seed(tag: &[u8], identity: &NodeIdentity) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(tag);
    hasher.update(identity.to_bytes());
    hasher.finalize().into()
}

/// Node key of `identity`.
pub fn node_signer(identity: &NodeIdentity) -> Ed25519Signer {
    Ed25519Signer::from_seed(derived_seed(b"node", identity))
}

/// Collateral key of `identity`.
pub fn collateral_signer(identity: &NodeIdentity) -> Ed25519Signer {
    Ed25519Signer::from_seed(derived_seed(b"collateral", identity))
}

/// Public address `203.0.113.<txid[0]>`, port offset by `vout`.
pub fn node_addr(identity: &NodeIdentity) -> SocketAddr {
    let port = 8168u16.wrapping_add(identity.vout as u16);
    SocketAddr::from(([203, 0, 113, identity.txid[0]], port))
}

/// An ENABLED record whose last ping is at `last_seen` and whose broadcast
/// is 1000 seconds older. The embedded signatures are empty.
pub fn node_record(identity: NodeIdentity, last_seen: u64) -> NodeRecord {
    let sig_time = last_seen.saturating_sub(1000);
    NodeRecord {
        identity,
        addr: node_addr(&identity),
        pubkey_collateral: collateral_signer(&identity).public_key(),
        pubkey_node: node_signer(&identity).public_key(),
        last_ping: Some(NodePing {
            identity,
            block_hash: [0u8; 32],
            sig_time: last_seen,
            signature: Vec::new(),
        }),
        signature: Vec::new(),
        sig_time,
        last_dsq: 0,
        time_last_checked: 0,
        time_last_paid: 0,
        time_last_watchdog_vote: sig_time,
        state: NodeState::Enabled,
        block_last_paid: 0,
        protocol_version: TEST_PROTOCOL,
        pose_score: 0,
        pose_ban_height: 0,
        governance_votes: BTreeMap::new(),
    }
}

/// Ping signed with the node key of `identity`.
pub fn signed_ping(identity: NodeIdentity, block_hash: Hash256, sig_time: u64) -> NodePing {
    NodePing::new_signed(identity, block_hash, sig_time, &node_signer(&identity))
}

/// Broadcast signed with the collateral key of `identity`.
pub fn signed_broadcast(
    identity: NodeIdentity,
    sig_time: u64,
    last_ping: Option<NodePing>,
) -> NodeBroadcast {
    NodeBroadcast::new_signed(
        identity,
        node_addr(&identity),
        &collateral_signer(&identity),
        node_signer(&identity).public_key(),
        TEST_PROTOCOL,
        sig_time,
        last_ping,
    )
}

// ════════════════════════════════════════════════════════════════════════════════
// HARNESS
// ════════════════════════════════════════════════════════════════════════════════

/// A registry wired to mock collaborators. The chain tip is stamped `now`.
pub struct TestHarness {
    pub registry: NodeRegistry,
    pub chain: Arc<MockChain>,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<RecordingTransport>,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestHarness {
    pub fn new(now: u64, height: u64) -> Self {
        Self::build(RegistryConfig::default(), now, height, None, None)
    }

    pub fn with_config(config: RegistryConfig, now: u64, height: u64) -> Self {
        Self::build(config, now, height, None, None)
    }

    /// Harness whose process runs the service node `identity`.
    pub fn with_local(now: u64, height: u64, identity: NodeIdentity) -> Self {
        let local = LocalNode {
            identity,
            addr: node_addr(&identity),
            signer: Arc::new(node_signer(&identity)),
        };
        Self::build(RegistryConfig::default(), now, height, Some(local), None)
    }

    /// Harness delivering governance notifications to `notifier`.
    pub fn with_notifier(now: u64, height: u64, notifier: Arc<dyn GovernanceNotifier>) -> Self {
        Self::build(RegistryConfig::default(), now, height, None, Some(notifier))
    }

    fn build(
        config: RegistryConfig,
        now: u64,
        height: u64,
        local: Option<LocalNode>,
        notifier_override: Option<Arc<dyn GovernanceNotifier>>,
    ) -> Self {
        let chain = Arc::new(MockChain::with_height(height, now));
        let clock = Arc::new(ManualClock::new(now));
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let delivered: Arc<dyn GovernanceNotifier> = match notifier_override {
            Some(n) => n,
            None => notifier.clone(),
        };

        let mut registry = NodeRegistry::new(
            config,
            chain.clone(),
            Arc::new(Ed25519Verifier),
            transport.clone(),
            delivered,
            clock.clone(),
        );
        if let Some(local) = local {
            registry = registry.with_local_node(local);
        }
        TestHarness { registry, chain, clock, transport, notifier }
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.chain.tip_hash()
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }
}
