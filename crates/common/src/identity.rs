//! # Node Identity
//!
//! A service node is keyed everywhere by the collateral output backing it:
//! the funding transaction hash plus the output index. Equality and ordering
//! follow the `(txid, vout)` tuple, so a sorted collection of identities is
//! identical on every participant.
//!
//! The payee script a node is paid to is derived from its collateral key, not
//! from its identity, so both are exposed here.

use serde::{Deserialize, Serialize};
use std::fmt;

// ════════════════════════════════════════════════════════════════════════════════
// PRIMITIVES
// ════════════════════════════════════════════════════════════════════════════════

/// 32-byte digest used for message hashes, block hashes and transaction ids.
pub type Hash256 = [u8; 32];

/// Raw Ed25519 public key bytes.
pub type PublicKey = [u8; 32];

/// The all-zero hash. Used as "no block" / "no transaction".
pub const ZERO_HASH: Hash256 = [0u8; 32];

/// Lowercase hex rendering of a hash.
pub fn hash_hex(hash: &Hash256) -> String {
    hex::encode(hash)
}

// ════════════════════════════════════════════════════════════════════════════════
// NODE IDENTITY
// ════════════════════════════════════════════════════════════════════════════════

/// Reference to the collateral transaction output backing a node.
///
/// Field order matters: the derived `Ord` compares `txid` first and `vout`
/// second.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Hash of the collateral transaction.
    pub txid: Hash256,
    /// Output index inside the collateral transaction.
    pub vout: u32,
}

impl NodeIdentity {
    /// Creates an identity from its parts.
    #[must_use]
    pub const fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// The null identity (`0000…:0`). Never a valid registry key.
    #[must_use]
    pub const fn null() -> Self {
        Self { txid: ZERO_HASH, vout: 0 }
    }

    /// Returns `true` for the null identity.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.txid == ZERO_HASH && self.vout == 0
    }

    /// Canonical 36-byte encoding: `txid || vout (little-endian)`.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 36] {
        let mut out = [0u8; 36];
        out[..32].copy_from_slice(&self.txid);
        out[32..].copy_from_slice(&self.vout.to_le_bytes());
        out
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", hex::encode(self.txid), self.vout)
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// PAYEE SCRIPT
// ════════════════════════════════════════════════════════════════════════════════

/// Output script a node's payments are sent to.
///
/// Pay-to-pubkey over the collateral key: `PUSH32 <key> OP_CHECKSIG`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayeeScript(pub Vec<u8>);

const OP_PUSH32: u8 = 0x20;
const OP_CHECKSIG: u8 = 0xac;

impl PayeeScript {
    /// Builds the payee script for a collateral public key.
    #[must_use]
    pub fn for_key(key: &PublicKey) -> Self {
        let mut script = Vec::with_capacity(34);
        script.push(OP_PUSH32);
        script.extend_from_slice(key);
        script.push(OP_CHECKSIG);
        Self(script)
    }

    /// Raw script bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_txid_then_vout() {
        let a = NodeIdentity::new([1u8; 32], 9);
        let b = NodeIdentity::new([2u8; 32], 0);
        let c = NodeIdentity::new([2u8; 32], 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_null_identity() {
        assert!(NodeIdentity::null().is_null());
        assert!(!NodeIdentity::new([0u8; 32], 1).is_null());
    }

    #[test]
    fn test_display_is_hex_dash_vout() {
        let id = NodeIdentity::new([0xab; 32], 3);
        let s = id.to_string();
        assert!(s.starts_with("abab"));
        assert!(s.ends_with("-3"));
    }

    #[test]
    fn test_payee_script_layout() {
        let script = PayeeScript::for_key(&[7u8; 32]);
        assert_eq!(script.as_bytes().len(), 34);
        assert_eq!(script.as_bytes()[0], OP_PUSH32);
        assert_eq!(script.as_bytes()[33], OP_CHECKSIG);
    }
}
