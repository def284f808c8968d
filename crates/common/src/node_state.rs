//! # Node Lifecycle State
//!
//! Every registered service node is in exactly one of seven states. The
//! allowed transitions form a **closed set**: anything not listed in
//! [`NodeState::can_transition_to`] is rejected by the registry and the node
//! keeps its previous state.
//!
//! ## Transition Rules
//!
//! ```text
//! From                         → To                              Trigger
//! ──────────────────────────── ─────────────────────────────── ───────────────────────────
//! PRE_ENABLED/ENABLED/         → any other of these four         ping freshness, watchdog
//!   EXPIRED/WATCHDOG_EXPIRED
//! any except OUTPOINT_SPENT    → NEW_START_REQUIRED              no ping for too long,
//!                                                                protocol below the floor
//! any except OUTPOINT_SPENT    → POSE_BAN                        PoSe score reached maximum
//! POSE_BAN                     → PRE_ENABLED/ENABLED/EXPIRED/    ban height passed
//!                                WATCHDOG_EXPIRED
//! any                          → OUTPOINT_SPENT                  collateral consumed
//! ```
//!
//! `NEW_START_REQUIRED` is left only through a fresh broadcast
//! ([`NodeState::can_refresh_from_broadcast`]); periodic checks never revive
//! it. `OUTPOINT_SPENT` is terminal.

use serde::{Deserialize, Serialize};
use std::fmt;

// ════════════════════════════════════════════════════════════════════════════════
// NODE STATE
// ════════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a service node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Announced, but the first ping has not yet been spaced far enough from
    /// the announcement.
    PreEnabled,
    /// Live and eligible for ranking and payment.
    Enabled,
    /// No ping within the expiration window.
    Expired,
    /// The network watchdog is active and this node has not voted recently.
    WatchdogExpired,
    /// Broadcast is unusable (too old, or protocol below the floor); only a
    /// newer broadcast can bring the node back.
    NewStartRequired,
    /// Failed proof-of-service verification too many times.
    PoseBan,
    /// Collateral output was spent. Terminal.
    OutpointSpent,
}

impl NodeState {
    /// Returns `true` for the four states driven purely by liveness.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(
            self,
            NodeState::PreEnabled
                | NodeState::Enabled
                | NodeState::Expired
                | NodeState::WatchdogExpired
        )
    }

    /// Whether a periodic re-evaluation may move a node from `self` to
    /// `target`. Self-transitions are not transitions and return `false`.
    #[must_use]
    pub const fn can_transition_to(&self, target: NodeState) -> bool {
        if (*self as u8) == (target as u8) {
            return false;
        }
        match (self, target) {
            (NodeState::OutpointSpent, _) => false,
            (_, NodeState::OutpointSpent) => true,
            (_, NodeState::PoseBan) => true,
            (_, NodeState::NewStartRequired) => true,
            (NodeState::NewStartRequired, _) => false,
            (NodeState::PoseBan, t) => t.is_live(),
            (s, t) => s.is_live() && t.is_live(),
        }
    }

    /// Whether a newer, valid broadcast may reset this node to a fresh
    /// announcement.
    #[must_use]
    pub const fn can_refresh_from_broadcast(&self) -> bool {
        !matches!(self, NodeState::OutpointSpent | NodeState::PoseBan)
    }

    /// Stable upper-case name used in logs and summaries.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            NodeState::PreEnabled => "PRE_ENABLED",
            NodeState::Enabled => "ENABLED",
            NodeState::Expired => "EXPIRED",
            NodeState::WatchdogExpired => "WATCHDOG_EXPIRED",
            NodeState::NewStartRequired => "NEW_START_REQUIRED",
            NodeState::PoseBan => "POSE_BAN",
            NodeState::OutpointSpent => "OUTPOINT_SPENT",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [NodeState; 7] = [
        NodeState::PreEnabled,
        NodeState::Enabled,
        NodeState::Expired,
        NodeState::WatchdogExpired,
        NodeState::NewStartRequired,
        NodeState::PoseBan,
        NodeState::OutpointSpent,
    ];

    #[test]
    fn test_no_self_transitions() {
        for s in ALL {
            assert!(!s.can_transition_to(s), "{} -> {}", s, s);
        }
    }

    #[test]
    fn test_outpoint_spent_is_terminal() {
        for t in ALL {
            assert!(!NodeState::OutpointSpent.can_transition_to(t));
        }
        assert!(!NodeState::OutpointSpent.can_refresh_from_broadcast());
    }

    #[test]
    fn test_every_other_state_can_reach_spent_ban_and_new_start() {
        for s in ALL.iter().filter(|s| **s != NodeState::OutpointSpent) {
            assert!(s.can_transition_to(NodeState::OutpointSpent));
            if *s != NodeState::PoseBan {
                assert!(s.can_transition_to(NodeState::PoseBan));
            }
            if *s != NodeState::NewStartRequired {
                assert!(s.can_transition_to(NodeState::NewStartRequired));
            }
        }
    }

    #[test]
    fn test_enabled_expired_round_trip() {
        assert!(NodeState::PreEnabled.can_transition_to(NodeState::Enabled));
        assert!(NodeState::Enabled.can_transition_to(NodeState::Expired));
        assert!(NodeState::Expired.can_transition_to(NodeState::Enabled));
        assert!(NodeState::Enabled.can_transition_to(NodeState::WatchdogExpired));
        assert!(NodeState::Expired.can_transition_to(NodeState::WatchdogExpired));
    }

    #[test]
    fn test_new_start_required_only_leaves_via_broadcast() {
        for t in [
            NodeState::PreEnabled,
            NodeState::Enabled,
            NodeState::Expired,
            NodeState::WatchdogExpired,
        ] {
            assert!(!NodeState::NewStartRequired.can_transition_to(t));
        }
        assert!(NodeState::NewStartRequired.can_refresh_from_broadcast());
    }

    #[test]
    fn test_pose_ban_lifts_into_live_states_only() {
        assert!(NodeState::PoseBan.can_transition_to(NodeState::Enabled));
        assert!(NodeState::PoseBan.can_transition_to(NodeState::Expired));
        assert!(!NodeState::PoseBan.can_refresh_from_broadcast());
    }
}
