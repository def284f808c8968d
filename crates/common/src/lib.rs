//! # Noir Common Crate
//!
//! Value types and collaborator seams shared by the node registry and the
//! components around it.
//!
//! ## Modules
//! - `identity`: `NodeIdentity`, hashes, payee scripts
//! - `node_state`: closed lifecycle state set
//! - `messages`: broadcast / ping / verification payloads and the wire enum
//! - `crypto`: signing capability and its Ed25519 implementation
//! - `chain`: read-only chain-tip view and clock
//! - `config`: TOML registry configuration
//!
//! ## Collaborators
//! ```text
//!            ┌──────────────┐
//!  wire ───▶ │ NodeMessage  │
//!            └──────┬───────┘
//!                   │ decoded
//!            ┌──────▼───────┐   verify    ┌─────────────────┐
//!            │   registry   │ ──────────▶ │ MessageVerifier │
//!            └──────┬───────┘             └─────────────────┘
//!                   │ height / spent / payee
//!            ┌──────▼───────┐
//!            │  ChainView   │
//!            └──────────────┘
//! ```

pub mod chain;
pub mod config;
pub mod crypto;
pub mod identity;
pub mod messages;
pub mod node_state;

pub use chain::{ChainView, Clock, SystemClock};
pub use config::{ConfigError, RegistryConfig};
pub use crypto::{CryptoError, Ed25519Signer, Ed25519Verifier, MessageSigner, MessageVerifier};
pub use identity::{hash_hex, Hash256, NodeIdentity, PayeeScript, PublicKey, ZERO_HASH};
pub use messages::{
    InventoryItem, MessageDecodeError, NodeBroadcast, NodeMessage, NodePing, NodeVerification,
};
pub use node_state::NodeState;
