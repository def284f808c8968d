//! Read-only view of the chain tip, and the wall clock.
//!
//! Both are injected into the registry so tests can drive heights and time
//! deterministically.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::identity::{Hash256, NodeIdentity, PayeeScript};

/// Read-only chain-tip collaborator.
///
/// Every method must be cheap: the registry calls them while holding its
/// lock.
pub trait ChainView: Send + Sync {
    /// Height of the current best block, or `None` before the first block.
    fn best_height(&self) -> Option<u64>;

    /// Hash of the active-chain block at `height`.
    fn block_hash(&self, height: u64) -> Option<Hash256>;

    /// Timestamp of the active-chain block at `height`.
    fn block_time(&self, height: u64) -> Option<u64>;

    /// Height of a block on the active chain, looked up by hash.
    fn height_of(&self, hash: &Hash256) -> Option<u64>;

    /// Whether the collateral output is missing from the unspent set.
    fn is_outpoint_spent(&self, identity: &NodeIdentity) -> bool;

    /// Script of the service-node payment output in the block at `height`.
    fn payee_at(&self, height: u64) -> Option<PayeeScript>;
}

pub trait Clock: Send + Sync {
    /// Unix seconds.
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now() > 1_577_836_800);
    }
}
