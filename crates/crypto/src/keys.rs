//! Approver key registry and Ed25519 helpers.
//!
//! The multisig controller verifies each approval against the registered
//! public key of its approver. Keys are registered at startup (or through
//! a `system` upgrade manifest); they are never removed silently.

use std::collections::BTreeMap;
use std::sync::RwLock;

use base64::Engine as _;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};

use crate::error::CryptoError;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Verifies an Ed25519 signature over a message with raw key bytes.
pub fn verify_ed25519(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<bool, CryptoError> {
    let pk_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("ed25519 public key must be 32 bytes".into()))?;
    let vk = VerifyingKey::from_bytes(&pk_bytes)
        .map_err(|e| CryptoError::InvalidKey(format!("bad ed25519 public key: {}", e)))?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature("ed25519 signature must be 64 bytes".into()))?;
    Ok(vk.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok())
}

/// In-process registry mapping approver ids to verification keys.
#[derive(Default)]
pub struct ApproverKeyRegistry {
    keys: RwLock<BTreeMap<String, VerifyingKey>>,
}

impl ApproverKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) an approver's public key.
    pub fn register(&self, approver_id: &str, public_key: &[u8]) -> Result<(), CryptoError> {
        let pk_bytes: [u8; 32] = public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("ed25519 public key must be 32 bytes".into()))?;
        let vk = VerifyingKey::from_bytes(&pk_bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("bad ed25519 public key: {}", e)))?;
        let mut keys = self
            .keys
            .write()
            .map_err(|_| CryptoError::Backend("key registry lock poisoned".into()))?;
        keys.insert(approver_id.to_string(), vk);
        Ok(())
    }

    pub fn is_registered(&self, approver_id: &str) -> bool {
        self.keys
            .read()
            .map(|k| k.contains_key(approver_id))
            .unwrap_or(false)
    }

    /// Verifies a base64 signature over `message` against the approver's
    /// registered key.
    pub fn verify(
        &self,
        approver_id: &str,
        message: &[u8],
        signature_b64: &str,
    ) -> Result<bool, CryptoError> {
        let keys = self
            .keys
            .read()
            .map_err(|_| CryptoError::Backend("key registry lock poisoned".into()))?;
        let vk = keys
            .get(approver_id)
            .ok_or_else(|| CryptoError::UnknownKid(approver_id.to_string()))?;
        let raw = B64
            .decode(signature_b64)
            .map_err(|e| CryptoError::InvalidSignature(format!("bad base64: {}", e)))?;
        let sig_bytes: [u8; 64] = raw.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidSignature("ed25519 signature must be 64 bytes".into())
        })?;
        Ok(vk.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok())
    }

    /// All registered approver ids, sorted.
    pub fn approver_ids(&self) -> Vec<String> {
        self.keys
            .read()
            .map(|k| k.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Generates a fresh Ed25519 keypair. Used by tests and the key
/// provisioning CLI.
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let signing = SigningKey::generate(&mut rand::rngs::OsRng);
    let verifying = signing.verifying_key();
    (signing, verifying)
}

/// Signs a message and returns the base64 signature. Test-side helper for
/// producing approval signatures.
pub fn sign_b64(key: &SigningKey, message: &[u8]) -> String {
    B64.encode(key.sign(message).to_bytes())
}
