//! # Stable Node Index
//!
//! Bidirectional map between node identities and dense ordinals.
//!
//! ## Invariants
//!
//! 1. `forward[id] == n` iff `reverse[n] == id`.
//! 2. Ordinals are assigned as `0, 1, 2, …` in insertion order and are never
//!    reused or reassigned while the index lives.
//! 3. `size() == forward.len() == reverse.len()`.
//!
//! Entries are never removed one by one. The registry replaces the whole
//! index when it has grown far beyond the live population; see
//! `RegistryState::check_and_rebuild_index`.
//!
//! Only the forward map is persisted. The reverse map is rebuilt on load.

use noir_common::NodeIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "IndexRepr", into = "IndexRepr")]
pub struct NodeIndex {
    forward: BTreeMap<NodeIdentity, usize>,
    reverse: BTreeMap<usize, NodeIdentity>,
}

/// On-disk shape: the forward map only.
#[derive(Serialize, Deserialize)]
struct IndexRepr {
    forward: BTreeMap<NodeIdentity, usize>,
}

impl From<IndexRepr> for NodeIndex {
    fn from(repr: IndexRepr) -> Self {
        let reverse = repr.forward.iter().map(|(id, n)| (*n, *id)).collect();
        NodeIndex { forward: repr.forward, reverse }
    }
}

impl From<NodeIndex> for IndexRepr {
    fn from(index: NodeIndex) -> Self {
        IndexRepr { forward: index.forward }
    }
}

impl NodeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.forward.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Identity at `ordinal`.
    #[must_use]
    pub fn get(&self, ordinal: usize) -> Option<NodeIdentity> {
        self.reverse.get(&ordinal).copied()
    }

    #[must_use]
    pub fn ordinal_of(&self, identity: &NodeIdentity) -> Option<usize> {
        self.forward.get(identity).copied()
    }

    /// Appends `identity` with ordinal `size()`. No-op if already present.
    pub fn insert(&mut self, identity: NodeIdentity) {
        if self.forward.contains_key(&identity) {
            return;
        }
        let ordinal = self.forward.len();
        self.forward.insert(identity, ordinal);
        self.reverse.insert(ordinal, identity);
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }

    /// Whether the ordinals are exactly `0..size()`, one identity each.
    /// Only a decoded index can fail this.
    #[must_use]
    pub fn is_dense(&self) -> bool {
        self.reverse.len() == self.forward.len()
            && self.reverse.keys().enumerate().all(|(i, n)| i == *n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(n: u8, vout: u32) -> NodeIdentity {
        NodeIdentity::new([n; 32], vout)
    }

    #[test]
    fn test_insert_assigns_dense_ordinals() {
        let mut index = NodeIndex::new();
        index.insert(id(3, 0));
        index.insert(id(1, 0));
        index.insert(id(2, 0));
        assert_eq!(index.size(), 3);
        assert_eq!(index.ordinal_of(&id(3, 0)), Some(0));
        assert_eq!(index.ordinal_of(&id(1, 0)), Some(1));
        assert_eq!(index.get(2), Some(id(2, 0)));
        assert_eq!(index.get(3), None);
    }

    #[test]
    fn test_insert_existing_is_noop() {
        let mut index = NodeIndex::new();
        index.insert(id(1, 0));
        index.insert(id(2, 0));
        index.insert(id(1, 0));
        assert_eq!(index.size(), 2);
        assert_eq!(index.ordinal_of(&id(1, 0)), Some(0));
    }

    #[test]
    fn test_clear_resets() {
        let mut index = NodeIndex::new();
        index.insert(id(1, 0));
        index.clear();
        assert!(index.is_empty());
        assert_eq!(index.get(0), None);
        index.insert(id(9, 9));
        assert_eq!(index.ordinal_of(&id(9, 9)), Some(0));
    }

    #[test]
    fn test_reverse_map_rebuilt_after_decode() {
        let mut index = NodeIndex::new();
        index.insert(id(5, 1));
        index.insert(id(6, 2));
        let bytes = bincode::serde::encode_to_vec(&index, bincode::config::standard())
            .expect("encode");
        let (back, _): (NodeIndex, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .expect("decode");
        assert_eq!(back, index);
        assert_eq!(back.get(1), Some(id(6, 2)));
    }

    #[test]
    fn test_decoded_index_density() {
        let config = bincode::config::standard();
        let decode = |forward: BTreeMap<NodeIdentity, usize>| -> NodeIndex {
            let bytes = bincode::serde::encode_to_vec(&forward, config).expect("encode");
            bincode::serde::decode_from_slice::<NodeIndex, _>(&bytes, config).expect("decode").0
        };
        assert!(decode([(id(1, 0), 0), (id(2, 0), 1)].into_iter().collect()).is_dense());
        assert!(!decode([(id(1, 0), 0), (id(2, 0), 2)].into_iter().collect()).is_dense());
        assert!(!decode([(id(1, 0), 1), (id(2, 0), 1)].into_iter().collect()).is_dense());
        assert!(NodeIndex::new().is_dense());
    }

    proptest! {
        #[test]
        fn prop_index_is_a_bijection(raw in proptest::collection::vec((any::<u8>(), 0u32..4), 0..200)) {
            let mut index = NodeIndex::new();
            let mut seen = Vec::new();
            for (b, vout) in raw {
                let identity = id(b, vout);
                let before = index.size();
                index.insert(identity);
                if seen.contains(&identity) {
                    prop_assert_eq!(index.size(), before);
                } else {
                    prop_assert_eq!(index.ordinal_of(&identity), Some(before));
                    seen.push(identity);
                }
            }
            prop_assert_eq!(index.size(), seen.len());
            for (n, identity) in seen.iter().enumerate() {
                let ordinal = index.ordinal_of(identity);
                prop_assert_eq!(ordinal, Some(n));
                prop_assert_eq!(index.get(n), Some(*identity));
            }
        }
    }
}
