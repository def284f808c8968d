//! # Registry Persistence
//!
//! The registry is saved as one versioned blob:
//!
//! ```text
//! ┌────────────────────────┬──────────────────────────────────────────────┐
//! │ version tag (String)   │ body (bincode, fields in declaration order)  │
//! └────────────────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! The tag is decoded on its own first. If it differs from
//! [`SERIALIZATION_VERSION`] the body is not decoded at all and the registry
//! is reset to empty: the node resyncs from peers instead of migrating.
//!
//! Only the forward map of the current index is stored. The reverse map is
//! rebuilt on decode, the previous generation and the rebuilt flag start
//! empty.

use noir_common::{Hash256, NodeBroadcast, NodeIdentity, NodePing};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use tracing::{info, warn};

use crate::error::PersistenceError;
use crate::index::NodeIndex;
use crate::record::NodeRecord;
use crate::recovery::RecoveryRequest;
use crate::registry::{NodeRegistry, RegistryState};
use crate::SERIALIZATION_VERSION;

/// Result of a load attempt that did not fail.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadStatus {
    Loaded { nodes: usize },
    /// Stored tag did not match; registry reset to empty.
    VersionMismatch,
    /// No file at the path; registry untouched.
    Missing,
}

#[derive(Serialize, Deserialize)]
struct PersistedRegistry {
    nodes: Vec<NodeRecord>,
    asked_us_for_list: BTreeMap<IpAddr, u64>,
    we_asked_for_list: BTreeMap<IpAddr, u64>,
    we_asked_for_list_entry: BTreeMap<NodeIdentity, BTreeMap<IpAddr, u64>>,
    recovery_requests: BTreeMap<Hash256, RecoveryRequest>,
    recovery_good_replies: BTreeMap<Hash256, Vec<NodeBroadcast>>,
    last_watchdog_vote_time: u64,
    dsq_count: i64,
    seen_broadcasts: BTreeMap<Hash256, (u64, NodeBroadcast)>,
    seen_pings: BTreeMap<Hash256, NodePing>,
    index: NodeIndex,
}

impl PersistedRegistry {
    fn capture(st: &RegistryState) -> Self {
        PersistedRegistry {
            nodes: st.nodes.clone(),
            asked_us_for_list: st.asked_us_for_list.clone(),
            we_asked_for_list: st.we_asked_for_list.clone(),
            we_asked_for_list_entry: st.we_asked_for_list_entry.clone(),
            recovery_requests: st.recovery_requests.clone(),
            recovery_good_replies: st.recovery_good_replies.clone(),
            last_watchdog_vote_time: st.last_watchdog_vote_time,
            dsq_count: st.dsq_count,
            seen_broadcasts: st.seen_broadcasts.clone(),
            seen_pings: st.seen_pings.clone(),
            index: st.index.clone(),
        }
    }

    fn restore(self, st: &mut RegistryState) {
        st.clear();
        st.nodes = self.nodes;
        st.asked_us_for_list = self.asked_us_for_list;
        st.we_asked_for_list = self.we_asked_for_list;
        st.we_asked_for_list_entry = self.we_asked_for_list_entry;
        st.recovery_requests = self.recovery_requests;
        st.recovery_good_replies = self.recovery_good_replies;
        st.last_watchdog_vote_time = self.last_watchdog_vote_time;
        st.dsq_count = self.dsq_count;
        st.seen_broadcasts = self.seen_broadcasts;
        st.seen_pings = self.seen_pings;
        st.index = self.index;
        if !st.index.is_dense() {
            warn!(entries = st.index.size(), "stored index is not dense, rebuilding");
            st.index.clear();
        }
        for record in &st.nodes {
            st.index.insert(record.identity);
        }
    }
}

impl NodeRegistry {
    pub fn to_bytes(&self) -> Result<Vec<u8>, PersistenceError> {
        let config = bincode::config::standard();
        let body = PersistedRegistry::capture(&self.state.lock());
        let mut bytes = bincode::serde::encode_to_vec(SERIALIZATION_VERSION, config)
            .map_err(|e| PersistenceError::Encode(e.to_string()))?;
        let body = bincode::serde::encode_to_vec(&body, config)
            .map_err(|e| PersistenceError::Encode(e.to_string()))?;
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Replaces the registry with a decoded blob.
    ///
    /// A decode error leaves the registry untouched.
    pub fn load_bytes(&self, bytes: &[u8]) -> Result<LoadStatus, PersistenceError> {
        let config = bincode::config::standard();
        let (version, consumed): (String, usize) = bincode::serde::decode_from_slice(bytes, config)
            .map_err(|e| PersistenceError::Decode(e.to_string()))?;

        if version != SERIALIZATION_VERSION {
            warn!(found = %version, expected = SERIALIZATION_VERSION, "registry version mismatch, starting empty");
            self.state.lock().clear();
            return Ok(LoadStatus::VersionMismatch);
        }

        let (body, _): (PersistedRegistry, usize) =
            bincode::serde::decode_from_slice(&bytes[consumed..], config)
                .map_err(|e| PersistenceError::Decode(e.to_string()))?;
        let mut st = self.state.lock();
        body.restore(&mut st);
        let nodes = st.nodes.len();
        info!(nodes, index = st.index.size(), "loaded node registry");
        Ok(LoadStatus::Loaded { nodes })
    }

    /// Writes the registry to `path` through a temporary file and a rename.
    pub fn save_to_file(&self, path: &Path) -> Result<(), PersistenceError> {
        let bytes = self.to_bytes()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        info!(path = %path.display(), bytes = bytes.len(), "saved node registry");
        Ok(())
    }

    pub fn load_from_file(&self, path: &Path) -> Result<LoadStatus, PersistenceError> {
        if !path.exists() {
            return Ok(LoadStatus::Missing);
        }
        let bytes = std::fs::read(path)?;
        self.load_bytes(&bytes)
    }
}
