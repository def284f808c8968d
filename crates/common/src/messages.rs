//! # Gossip Payloads
//!
//! Three signed payloads circulate between participants:
//!
//! | Payload | Signed by | Hash covers |
//! |---------|-----------|-------------|
//! | [`NodeBroadcast`] | collateral key | identity, collateral key, `sig_time` |
//! | [`NodePing`] | node key | identity, `sig_time` |
//! | [`NodeVerification`] | node key (both sides) | address, nonce, block height |
//!
//! Hashes are SHA3-256 over fixed-layout byte strings and are used as the
//! keys of the duplicate-suppression maps, so they must not depend on
//! signature bytes. Signing messages are separate byte strings that bind
//! every field a forger could profit from changing.
//!
//! [`NodeMessage`] is the decoded wire enum the registry accepts; the
//! transport frames it with [`NodeMessage::encode`] / [`NodeMessage::decode`].

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::net::SocketAddr;
use thiserror::Error;

use crate::crypto::{MessageSigner, MessageVerifier};
use crate::identity::{Hash256, NodeIdentity, PublicKey};

fn sha3(parts: &[&[u8]]) -> Hash256 {
    let mut hasher = Sha3_256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

// ════════════════════════════════════════════════════════════════════════════════
// PING
// ════════════════════════════════════════════════════════════════════════════════

/// Liveness heartbeat for a known node, anchored to a recent block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePing {
    pub identity: NodeIdentity,
    pub block_hash: Hash256,
    pub sig_time: u64,
    pub signature: Vec<u8>,
}

impl NodePing {
    /// Builds and signs a ping with the node key.
    pub fn new_signed(
        identity: NodeIdentity,
        block_hash: Hash256,
        sig_time: u64,
        signer: &dyn MessageSigner,
    ) -> Self {
        let mut ping = Self { identity, block_hash, sig_time, signature: Vec::new() };
        ping.signature = signer.sign(&ping.signing_message());
        ping
    }

    #[must_use]
    pub fn hash(&self) -> Hash256 {
        sha3(&[&self.identity.to_bytes(), &self.sig_time.to_le_bytes()])
    }

    #[must_use]
    pub fn signing_message(&self) -> Vec<u8> {
        format!("{}{}{}", self.identity, hex::encode(self.block_hash), self.sig_time)
            .into_bytes()
    }

    pub fn check_signature(&self, verifier: &dyn MessageVerifier, pubkey_node: &PublicKey) -> bool {
        verifier.verify(pubkey_node, &self.signature, &self.signing_message())
    }

    /// `true` if this ping is older than `secs` at `now`.
    #[must_use]
    pub fn is_expired(&self, now: u64, secs: u64) -> bool {
        now.saturating_sub(self.sig_time) > secs
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// BROADCAST
// ════════════════════════════════════════════════════════════════════════════════

/// Announcement of a node: where it listens, which keys it uses, which
/// protocol it speaks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBroadcast {
    pub identity: NodeIdentity,
    pub addr: SocketAddr,
    /// Key controlling the collateral output. Signs the broadcast.
    pub pubkey_collateral: PublicKey,
    /// Operational key of the running node. Signs pings and verifications.
    pub pubkey_node: PublicKey,
    pub signature: Vec<u8>,
    pub sig_time: u64,
    pub protocol_version: u32,
    pub last_ping: Option<NodePing>,
    /// Set only when the registry re-feeds a quorum-recovered copy. Never
    /// taken from the wire.
    #[serde(skip)]
    pub recovery: bool,
}

impl NodeBroadcast {
    /// Builds and signs a broadcast with the collateral key.
    #[allow(clippy::too_many_arguments)]
    pub fn new_signed(
        identity: NodeIdentity,
        addr: SocketAddr,
        collateral_signer: &dyn MessageSigner,
        pubkey_node: PublicKey,
        protocol_version: u32,
        sig_time: u64,
        last_ping: Option<NodePing>,
    ) -> Self {
        let mut mnb = Self {
            identity,
            addr,
            pubkey_collateral: collateral_signer.public_key(),
            pubkey_node,
            signature: Vec::new(),
            sig_time,
            protocol_version,
            last_ping,
            recovery: false,
        };
        mnb.signature = collateral_signer.sign(&mnb.signing_message());
        mnb
    }

    #[must_use]
    pub fn hash(&self) -> Hash256 {
        sha3(&[
            &self.identity.to_bytes(),
            &self.pubkey_collateral,
            &self.sig_time.to_le_bytes(),
        ])
    }

    #[must_use]
    pub fn signing_message(&self) -> Vec<u8> {
        format!(
            "{}{}{}{}{}",
            self.addr,
            self.sig_time,
            hex::encode(self.pubkey_collateral),
            hex::encode(self.pubkey_node),
            self.protocol_version
        )
        .into_bytes()
    }

    pub fn check_signature(&self, verifier: &dyn MessageVerifier) -> bool {
        verifier.verify(&self.pubkey_collateral, &self.signature, &self.signing_message())
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// VERIFICATION
// ════════════════════════════════════════════════════════════════════════════════

/// Proof-of-service challenge and its answers.
///
/// A request carries only `addr`, `nonce` and `block_height`. The challenged
/// node fills `identity1`/`sig1`; the challenger, after checking the reply,
/// fills `identity2`/`sig2` and relays it as a verification broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeVerification {
    pub addr: SocketAddr,
    pub nonce: u32,
    pub block_height: u64,
    pub identity1: NodeIdentity,
    pub identity2: NodeIdentity,
    pub sig1: Vec<u8>,
    pub sig2: Vec<u8>,
}

impl NodeVerification {
    #[must_use]
    pub fn request(addr: SocketAddr, nonce: u32, block_height: u64) -> Self {
        Self {
            addr,
            nonce,
            block_height,
            identity1: NodeIdentity::null(),
            identity2: NodeIdentity::null(),
            sig1: Vec::new(),
            sig2: Vec::new(),
        }
    }

    #[must_use]
    pub fn hash(&self) -> Hash256 {
        sha3(&[
            self.addr.to_string().as_bytes(),
            &self.nonce.to_le_bytes(),
            &self.block_height.to_le_bytes(),
        ])
    }

    /// Message the challenged node signs into `sig1`.
    #[must_use]
    pub fn challenge_message(&self, block_hash: &Hash256) -> Vec<u8> {
        format!("{}{}{}", self.addr, self.nonce, hex::encode(block_hash)).into_bytes()
    }

    /// Message the challenger signs into `sig2`.
    #[must_use]
    pub fn broadcast_message(&self, block_hash: &Hash256) -> Vec<u8> {
        format!(
            "{}{}{}{}{}",
            self.addr,
            self.nonce,
            hex::encode(block_hash),
            self.identity1,
            self.identity2
        )
        .into_bytes()
    }

    /// `true` once a reply signature is attached.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        !self.sig1.is_empty()
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// WIRE ENUM
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InventoryItem {
    Broadcast(Hash256),
    Ping(Hash256),
    Verify(Hash256),
}

/// Every message the registry sends or accepts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeMessage {
    Broadcast(NodeBroadcast),
    Ping(NodePing),
    Verify(NodeVerification),
    /// Full list when `None`, one node otherwise.
    ListRequest(Option<NodeIdentity>),
    GetData(InventoryItem),
    Inventory(Vec<InventoryItem>),
    /// Number of nodes advertised in reply to a list request.
    ListCount(u32),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageDecodeError {
    #[error("empty message")]
    EmptyData,

    #[error("deserialization failed: {reason}")]
    DeserializationFailed { reason: String },
}

impl NodeMessage {
    /// Encodes with bincode. Returns an empty vector if encoding fails.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageDecodeError> {
        if bytes.is_empty() {
            return Err(MessageDecodeError::EmptyData);
        }
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(msg, _)| msg)
            .map_err(|e| MessageDecodeError::DeserializationFailed { reason: e.to_string() })
    }

    /// Short command name for logs.
    #[must_use]
    pub const fn command(&self) -> &'static str {
        match self {
            NodeMessage::Broadcast(_) => "mnb",
            NodeMessage::Ping(_) => "mnp",
            NodeMessage::Verify(_) => "mnv",
            NodeMessage::ListRequest(_) => "dseg",
            NodeMessage::GetData(_) => "getdata",
            NodeMessage::Inventory(_) => "inv",
            NodeMessage::ListCount(_) => "ssc",
        }
    }
}
