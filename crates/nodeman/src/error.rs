//! Rejection reasons for inbound gossip and persistence failures.
//!
//! A rejected message is never fatal. The caller feeds
//! [`GossipError::misbehavior`] into its peer-penalty logic; a score of zero
//! means the message was stale or unknown rather than hostile.

use noir_common::NodeIdentity;
use std::net::SocketAddr;
use thiserror::Error;

/// What happened to a message that was not rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GossipOutcome {
    /// Accepted and relayed to other peers.
    Relayed,
    /// Accepted and applied, but not relayed.
    Stored,
    /// Already processed; registry state untouched.
    AlreadySeen,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GossipError {
    // ── broadcasts ────────────────────────────────────────────────────────────
    #[error("node {identity} announced unroutable address {addr}")]
    InvalidAddress { identity: NodeIdentity, addr: SocketAddr },

    #[error("signed time {sig_time} is too far in the future (now {now})")]
    FutureSigTime { sig_time: u64, now: u64 },

    #[error("signed time {sig_time} is too far in the past (now {now})")]
    PastSigTime { sig_time: u64, now: u64 },

    #[error("protocol {version} below minimum {min}")]
    ObsoleteProtocol { version: u32, min: u32 },

    #[error("broadcast for {identity} is not newer than known (got {got}, have {known})")]
    StaleBroadcast { identity: NodeIdentity, got: u64, known: u64 },

    #[error("node {0} is PoSe-banned")]
    PoseBanned(NodeIdentity),

    #[error("collateral key of {0} does not match the registered one")]
    CollateralKeyMismatch(NodeIdentity),

    #[error("invalid signature for {0}")]
    InvalidSignature(NodeIdentity),

    #[error("collateral of {0} is spent or unknown")]
    CollateralUnavailable(NodeIdentity),

    #[error("node {0} is not well formed")]
    Malformed(NodeIdentity),

    // ── pings ─────────────────────────────────────────────────────────────────
    #[error("unknown node {0}")]
    UnknownNode(NodeIdentity),

    #[error("node {0} requires a new start")]
    NewStartRequired(NodeIdentity),

    #[error("ping references an unknown block")]
    UnknownBlock,

    #[error("ping block at height {height} is older than {max_age} blocks")]
    PingBlockTooOld { height: u64, max_age: u64 },

    #[error("ping for {0} arrived too early")]
    PingTooEarly(NodeIdentity),

    // ── list requests ─────────────────────────────────────────────────────────
    #[error("peer {0} already asked for the list")]
    ListRequestTooSoon(SocketAddr),

    // ── verification ──────────────────────────────────────────────────────────
    #[error("this process is not running a service node")]
    NotAServiceNode,

    #[error("peer {0} already asked us to verify")]
    VerifyRequestRepeated(SocketAddr),

    #[error("we did not ask {0} for verification")]
    VerifyNotRequested(SocketAddr),

    #[error("verification nonce mismatch from {peer}: expected {expected}, got {got}")]
    VerifyNonceMismatch { peer: SocketAddr, expected: u32, got: u32 },

    #[error("verification height mismatch from {peer}: expected {expected}, got {got}")]
    VerifyHeightMismatch { peer: SocketAddr, expected: u64, got: u64 },

    #[error("address {0} already verified")]
    VerifyAlreadyDone(SocketAddr),

    #[error("no node at {0} signed the challenge")]
    VerifyNoMatchingNode(SocketAddr),

    #[error("verification at height {height} is outdated (tip {tip})")]
    VerifyOutdated { height: u64, tip: u64 },

    #[error("node {0} tried to verify itself")]
    VerifySelf(NodeIdentity),

    #[error("verifier {identity} rank {rank:?} is outside the top {max}")]
    VerifierRankTooLow { identity: NodeIdentity, rank: Option<usize>, max: usize },

    #[error("verification signature does not match {0}")]
    VerifySignature(NodeIdentity),

    #[error("verified node {0} is registered at another address")]
    VerifyAddressMismatch(NodeIdentity),
}

impl GossipError {
    /// Penalty the caller should apply to the peer that sent the message.
    #[must_use]
    pub const fn misbehavior(&self) -> u32 {
        match self {
            GossipError::FutureSigTime { .. } | GossipError::PastSigTime { .. } => 1,
            GossipError::VerifyRequestRepeated(_)
            | GossipError::VerifyNotRequested(_)
            | GossipError::VerifyNonceMismatch { .. }
            | GossipError::VerifyHeightMismatch { .. }
            | GossipError::VerifyAlreadyDone(_)
            | GossipError::VerifyNoMatchingNode(_) => 20,
            GossipError::CollateralKeyMismatch(_) | GossipError::InvalidSignature(_) => 33,
            GossipError::ListRequestTooSoon(_) => 34,
            GossipError::VerifySelf(_) | GossipError::Malformed(_) => 100,
            _ => 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "198.51.100.1:8168".parse().expect("addr")
    }

    #[test]
    fn test_stale_messages_are_not_penalized() {
        let id = NodeIdentity::new([1u8; 32], 0);
        assert_eq!(GossipError::StaleBroadcast { identity: id, got: 1, known: 2 }.misbehavior(), 0);
        assert_eq!(GossipError::UnknownNode(id).misbehavior(), 0);
        assert_eq!(GossipError::UnknownBlock.misbehavior(), 0);
    }

    #[test]
    fn test_penalty_scale() {
        let id = NodeIdentity::new([1u8; 32], 0);
        assert_eq!(GossipError::FutureSigTime { sig_time: 9, now: 1 }.misbehavior(), 1);
        assert_eq!(GossipError::VerifyNotRequested(peer()).misbehavior(), 20);
        assert_eq!(GossipError::InvalidSignature(id).misbehavior(), 33);
        assert_eq!(GossipError::ListRequestTooSoon(peer()).misbehavior(), 34);
        assert_eq!(GossipError::VerifySelf(id).misbehavior(), 100);
    }
}
