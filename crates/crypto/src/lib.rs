//! Cryptographic backends for the Sentinel control plane.
//!
//! The crate exposes a `SignerBackend` abstraction over digest signing
//! (KMS-style service, signing proxy, local HMAC for development), a
//! registry that selects the first backend whose probe passes and tracks
//! readiness, the approver public-key registry used by the multisig
//! controller, and SHA-256 helpers shared by the audit chain.

pub mod error;
pub mod hash;
pub mod keys;
pub mod signer;

pub use error::CryptoError;
pub use keys::ApproverKeyRegistry;
pub use signer::{
    local::LocalDevSigner, proxy::ProxySigner, Readiness, SignatureAlgorithm, SignatureBundle,
    SignerBackend, SignerRecord, SignerRegistry,
};
