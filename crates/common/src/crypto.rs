//! Signing capability used to authenticate gossip payloads.
//!
//! The registry never touches key material directly. It receives a
//! [`MessageVerifier`] (every participant) and, when the process itself runs
//! a service node, a [`MessageSigner`] holding that node's key.
//!
//! Keys are raw 32-byte Ed25519 public keys; signatures are 64 bytes and
//! checked with `verify_strict`.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::identity::PublicKey;

pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, found {found}")]
    InvalidKeyLength { expected: usize, found: usize },

    #[error("invalid signature length: expected {expected}, found {found}")]
    InvalidSignatureLength { expected: usize, found: usize },

    #[error("public key is not a valid curve point")]
    InvalidPublicKey,

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}

// ════════════════════════════════════════════════════════════════════════════════
// CAPABILITIES
// ════════════════════════════════════════════════════════════════════════════════

/// `verify(pubkey, signature, message)`.
pub trait MessageVerifier: Send + Sync {
    fn verify(&self, pubkey: &PublicKey, signature: &[u8], message: &[u8]) -> bool;
}

/// Signs on behalf of the local service node.
pub trait MessageSigner: Send + Sync {
    fn public_key(&self) -> PublicKey;
    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

// ════════════════════════════════════════════════════════════════════════════════
// ED25519
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl Ed25519Verifier {
    /// Verifies and reports *why* a check could not run.
    ///
    /// `Ok(false)` means the inputs were well formed but the signature does
    /// not match.
    pub fn try_verify(
        pubkey: &PublicKey,
        signature: &[u8],
        message: &[u8],
    ) -> Result<bool, CryptoError> {
        if signature.len() != SIGNATURE_LEN {
            return Err(CryptoError::InvalidSignatureLength {
                expected: SIGNATURE_LEN,
                found: signature.len(),
            });
        }
        let vk = VerifyingKey::from_bytes(pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;
        let mut sig_arr = [0u8; SIGNATURE_LEN];
        sig_arr.copy_from_slice(signature);
        let sig = Signature::from_bytes(&sig_arr);
        Ok(vk.verify_strict(message, &sig).is_ok())
    }
}

impl MessageVerifier for Ed25519Verifier {
    fn verify(&self, pubkey: &PublicKey, signature: &[u8], message: &[u8]) -> bool {
        matches!(Self::try_verify(pubkey, signature, message), Ok(true))
    }
}

/// Holds a node's Ed25519 signing key.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn generate() -> Self {
        let mut rng = OsRng;
        Self { key: SigningKey::generate(&mut rng) }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { key: SigningKey::from_bytes(&seed) }
    }

    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self, CryptoError> {
        if secret.len() != 32 {
            return Err(CryptoError::InvalidKeyLength { expected: 32, found: secret.len() });
        }
        let mut sk = [0u8; 32];
        sk.copy_from_slice(secret);
        Ok(Self::from_seed(sk))
    }

    /// Loads a secret key from its hex encoding, as stored in node config.
    pub fn from_secret_hex(hexstr: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hexstr.trim())?;
        Self::from_secret_bytes(&bytes)
    }
}

impl MessageSigner for Ed25519Signer {
    fn public_key(&self) -> PublicKey {
        self.key.verifying_key().to_bytes()
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}
