//! # Payment Ranking
//!
//! Deterministic ordering of nodes for a given block height.
//!
//! ## Score
//!
//! ```text
//! score(node, h) = | sha3(hash(h) ‖ txid ‖ vout) - sha3(hash(h)) |
//! ```
//!
//! computed as a 256-bit big-endian unsigned difference. Nodes are sorted by
//! `(score, identity)` ascending, so the order is total and does not depend
//! on the order records were inserted in. Rank 1 is the lowest score.
//!
//! ## Payment Queue
//!
//! Candidates must be payable, speak the payments protocol, must not have
//! been paid in the last `LAST_PAID_SCAN_BLOCKS` blocks and, when the
//! sig-time filter is on, must have been announced at least one payment
//! cycle ago. If the filter leaves fewer than a third of the enabled nodes,
//! the query is repeated without it. The winner is the candidate with the
//! lowest `block_last_paid`, ties broken by the score at
//! `height - PAYMENT_SCORE_BLOCK_OFFSET`, then by identity.

use noir_common::{Hash256, NodeIdentity, NodeState};
use rand::seq::SliceRandom;
use sha3::{Digest, Sha3_256};
use std::fmt;
use tracing::debug;

use crate::record::{NodeInfo, NodeRecord};
use crate::registry::{NodeRegistry, RegistryState};
use crate::{LAST_PAID_SCAN_BLOCKS, PAYMENT_SCORE_BLOCK_OFFSET};

// ════════════════════════════════════════════════════════════════════════════════
// SCORE
// ════════════════════════════════════════════════════════════════════════════════

/// Ranking score of `identity` against the block `block_hash`.
#[must_use]
pub fn calculate_score(identity: &NodeIdentity, block_hash: &Hash256) -> Hash256 {
    let anchor: Hash256 = Sha3_256::digest(block_hash).into();
    let mut hasher = Sha3_256::new();
    hasher.update(block_hash);
    hasher.update(identity.to_bytes());
    let mixed: Hash256 = hasher.finalize().into();
    abs_diff(&mixed, &anchor)
}

/// `|a - b|` for 256-bit big-endian integers.
fn abs_diff(a: &Hash256, b: &Hash256) -> Hash256 {
    // byte arrays compare lexicographically, which is big-endian order
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    let mut out = [0u8; 32];
    let mut borrow = 0i16;
    for i in (0..32).rev() {
        let mut d = i16::from(hi[i]) - i16::from(lo[i]) - borrow;
        borrow = 0;
        if d < 0 {
            d += 256;
            borrow = 1;
        }
        out[i] = d as u8;
    }
    out
}

// ════════════════════════════════════════════════════════════════════════════════
// NOT-QUALIFY REASONS
// ════════════════════════════════════════════════════════════════════════════════

/// Why a node is not in the payment queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotQualifyReason {
    UnknownNode,
    NotPayable(NodeState),
    ObsoleteProtocol { version: u32, min: u32 },
    /// Announced less than one payment cycle ago.
    TooNew { sig_time: u64, eligible_at: u64 },
    RecentlyPaid { block_last_paid: u64 },
}

impl fmt::Display for NotQualifyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotQualifyReason::UnknownNode => write!(f, "not in the registry"),
            NotQualifyReason::NotPayable(state) => write!(f, "state {} is not payable", state),
            NotQualifyReason::ObsoleteProtocol { version, min } => {
                write!(f, "protocol {} below {}", version, min)
            }
            NotQualifyReason::TooNew { sig_time, eligible_at } => {
                write!(f, "too new: announced at {}, eligible at {}", sig_time, eligible_at)
            }
            NotQualifyReason::RecentlyPaid { block_last_paid } => {
                write!(f, "paid recently at height {}", block_last_paid)
            }
        }
    }
}

impl NodeRegistry {
    // ════════════════════════════════════════════════════════════════════════════
    // RANKS
    // ════════════════════════════════════════════════════════════════════════════

    /// Positions in `st.nodes`, best rank first. Empty if the block at
    /// `height` is unknown.
    ///
    /// `only_active` keeps ENABLED nodes only; otherwise every state is
    /// ranked.
    pub(crate) fn ranked_positions_locked(
        &self,
        st: &RegistryState,
        height: u64,
        min_protocol: u32,
        only_active: bool,
    ) -> Vec<usize> {
        let Some(block_hash) = self.chain.block_hash(height) else {
            debug!(height, "no block hash for ranking");
            return Vec::new();
        };
        let mut scored: Vec<(Hash256, NodeIdentity, usize)> = st
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, r)| r.protocol_version >= min_protocol)
            .filter(|(_, r)| !only_active || r.is_enabled())
            .map(|(pos, r)| (calculate_score(&r.identity, &block_hash), r.identity, pos))
            .collect();
        scored.sort_unstable();
        scored.into_iter().map(|(_, _, pos)| pos).collect()
    }

    /// `(rank, node)` for every enabled node at `height`, rank 1 first.
    pub fn get_node_ranks(&self, height: u64, min_protocol: u32) -> Vec<(usize, NodeInfo)> {
        let now = self.now();
        let mut st = self.state.lock();
        self.check_all_locked(&mut st, now);
        self.ranked_positions_locked(&st, height, min_protocol, true)
            .into_iter()
            .enumerate()
            .map(|(i, pos)| (i + 1, NodeInfo::from(&st.nodes[pos])))
            .collect()
    }

    pub fn get_node_rank(
        &self,
        identity: &NodeIdentity,
        height: u64,
        min_protocol: u32,
        only_active: bool,
    ) -> Option<usize> {
        let now = self.now();
        let mut st = self.state.lock();
        if only_active {
            self.check_all_locked(&mut st, now);
        }
        self.ranked_positions_locked(&st, height, min_protocol, only_active)
            .into_iter()
            .position(|pos| st.nodes[pos].identity == *identity)
            .map(|i| i + 1)
    }

    pub fn get_node_by_rank(
        &self,
        rank: usize,
        height: u64,
        min_protocol: u32,
        only_active: bool,
    ) -> Option<NodeInfo> {
        let now = self.now();
        let mut st = self.state.lock();
        if only_active {
            self.check_all_locked(&mut st, now);
        }
        let ranked = self.ranked_positions_locked(&st, height, min_protocol, only_active);
        let pos = *ranked.get(rank.checked_sub(1)?)?;
        Some(NodeInfo::from(&st.nodes[pos]))
    }

    // ════════════════════════════════════════════════════════════════════════════
    // PAYMENT QUEUE
    // ════════════════════════════════════════════════════════════════════════════

    /// The node to pay at `height`, and the number of candidates considered.
    pub fn get_next_in_queue_for_payment(
        &self,
        height: u64,
        filter_sig_time: bool,
    ) -> (Option<NodeInfo>, usize) {
        let now = self.now();
        let mut st = self.state.lock();
        self.check_all_locked(&mut st, now);
        self.next_in_queue_locked(&st, height, filter_sig_time, now)
    }

    fn next_in_queue_locked(
        &self,
        st: &RegistryState,
        height: u64,
        filter_sig_time: bool,
        now: u64,
    ) -> (Option<NodeInfo>, usize) {
        let enabled = st.count_enabled(self.config.min_payments_protocol);
        let candidates: Vec<&NodeRecord> = st
            .nodes
            .iter()
            .filter(|r| self.disqualification(r, height, filter_sig_time, enabled, now).is_none())
            .collect();

        if filter_sig_time && candidates.len() < enabled / 3 {
            return self.next_in_queue_locked(st, height, false, now);
        }
        let count = candidates.len();

        let seed = height
            .checked_sub(PAYMENT_SCORE_BLOCK_OFFSET)
            .and_then(|h| self.chain.block_hash(h));
        let Some(seed) = seed else {
            debug!(height, "no score block for payment queue");
            return (None, count);
        };
        let best = candidates
            .into_iter()
            .min_by_key(|r| (r.block_last_paid, calculate_score(&r.identity, &seed), r.identity));
        (best.map(NodeInfo::from), count)
    }

    fn disqualification(
        &self,
        record: &NodeRecord,
        height: u64,
        filter_sig_time: bool,
        node_count: usize,
        now: u64,
    ) -> Option<NotQualifyReason> {
        let cfg = &self.config;
        if !record.is_valid_for_payment(cfg.require_watchdog) {
            return Some(NotQualifyReason::NotPayable(record.state));
        }
        if record.protocol_version < cfg.min_payments_protocol {
            return Some(NotQualifyReason::ObsoleteProtocol {
                version: record.protocol_version,
                min: cfg.min_payments_protocol,
            });
        }
        let eligible_at = record.sig_time + node_count as u64 * cfg.payment_cycle_secs_per_node;
        if filter_sig_time && eligible_at > now {
            return Some(NotQualifyReason::TooNew { sig_time: record.sig_time, eligible_at });
        }
        if record.block_last_paid != 0
            && height.saturating_sub(record.block_last_paid) < LAST_PAID_SCAN_BLOCKS
        {
            return Some(NotQualifyReason::RecentlyPaid { block_last_paid: record.block_last_paid });
        }
        None
    }

    /// Why `identity` would not be picked at `height`; `None` if it
    /// qualifies. `node_count` defaults to the enabled count.
    pub fn not_qualify_reason(
        &self,
        identity: &NodeIdentity,
        height: u64,
        filter_sig_time: bool,
        node_count: Option<usize>,
    ) -> Option<NotQualifyReason> {
        let now = self.now();
        let st = self.state.lock();
        let Some(record) = st.find(identity) else {
            return Some(NotQualifyReason::UnknownNode);
        };
        let count = node_count.unwrap_or_else(|| st.count_enabled(self.config.min_payments_protocol));
        self.disqualification(record, height, filter_sig_time, count, now)
    }

    /// A random enabled node outside `exclude`.
    pub fn find_random_not_in(
        &self,
        exclude: &[NodeIdentity],
        min_protocol: Option<u32>,
    ) -> Option<NodeInfo> {
        let min = min_protocol.unwrap_or(self.config.min_payments_protocol);
        let st = self.state.lock();
        let candidates: Vec<&NodeRecord> = st
            .nodes
            .iter()
            .filter(|r| r.protocol_version >= min && r.is_enabled())
            .filter(|r| !exclude.contains(&r.identity))
            .collect();
        candidates
            .choose(&mut rand::thread_rng())
            .map(|r| NodeInfo::from(*r))
    }
}
