//! # Noir Node Manager
//!
//! Authoritative in-memory registry of collateral-backed service nodes and
//! the gossip rules that feed it.
//!
//! ## Components
//!
//! ```text
//!  inbound NodeMessage
//!          │
//!  ┌───────▼────────┐  mutate   ┌──────────────┐  ordinals  ┌───────────┐
//!  │ gossip         │ ────────▶ │ NodeRegistry │ ─────────▶ │ NodeIndex │
//!  │ (dedup, DoS)   │           │  one lock    │            │ cur + old │
//!  └────────────────┘           └──────┬───────┘            └───────────┘
//!                                      │ snapshot
//!               ┌──────────────────────┼──────────────────────┐
//!        ┌──────▼──────┐      ┌────────▼───────┐      ┌───────▼──────┐
//!        │ ranking     │      │ verification   │      │ recovery     │
//!        │ (payments)  │      │ (PoSe)         │      │ (quorum)     │
//!        └─────────────┘      └────────────────┘      └──────────────┘
//! ```
//!
//! All state lives behind a single `parking_lot::Mutex`. Outbound traffic
//! produced while the lock is held is collected as [`Action`] values and
//! handed to the [`Transport`] only after the guard is dropped.

pub mod error;
pub mod governance;
pub mod gossip;
pub mod index;
pub mod mock;
pub mod persistence;
pub mod ranking;
pub mod record;
pub mod recovery;
pub mod registry;
pub mod sync_view;
pub mod transport;
pub mod verification;

pub use error::{GossipError, GossipOutcome, PersistenceError};
pub use index::NodeIndex;
pub use persistence::LoadStatus;
pub use ranking::NotQualifyReason;
pub use record::{NodeInfo, NodeRecord};
pub use recovery::RecoveryRequest;
pub use registry::{LocalNode, NodeRegistry};
pub use sync_view::SyncView;
pub use transport::{Action, GovernanceNotifier, Transport};

// ════════════════════════════════════════════════════════════════════════════════
// PROTOCOL CONSTANTS
// ════════════════════════════════════════════════════════════════════════════════

/// Tag written at the head of every persisted registry blob.
pub const SERIALIZATION_VERSION: &str = "NoirNodeRegistry-Version-1";

/// An index larger than this (and larger than the registry) is rebuilt.
pub const MAX_EXPECTED_INDEX_SIZE: usize = 30_000;
/// At most one index rebuild per this many seconds.
pub const MIN_INDEX_REBUILD_TIME: u64 = 3600;

/// Cooldown for list requests in both directions.
pub const DSEG_UPDATE_SECONDS: u64 = 3 * 60 * 60;

/// Blocks scanned for payments per tip update, and the minimum unpaid span
/// of a payment candidate.
pub const LAST_PAID_SCAN_BLOCKS: u64 = 100;

pub const MIN_POSE_PROTO_VERSION: u32 = 70203;
pub const MAX_POSE_CONNECTIONS: usize = 10;
pub const MAX_POSE_RANK: usize = 10;
pub const MAX_POSE_BLOCKS: u64 = 10;

pub const MNB_RECOVERY_QUORUM_TOTAL: usize = 10;
pub const MNB_RECOVERY_QUORUM_REQUIRED: usize = 6;
pub const MNB_RECOVERY_MAX_ASK_ENTRIES: usize = 10;
pub const MNB_RECOVERY_WAIT_SECONDS: u64 = 60;
pub const MNB_RECOVERY_RETRY_SECONDS: u64 = 3 * 60 * 60;

/// Blocks between the payment height and the block whose hash seeds the
/// payment score.
pub const PAYMENT_SCORE_BLOCK_OFFSET: u64 = 101;

/// Nonces for verification requests are drawn from `0..VERIFY_NONCE_RANGE`.
pub const VERIFY_NONCE_RANGE: u32 = 999_999;
