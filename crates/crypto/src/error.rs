//! Error types for cryptographic operations.

use sentinel_types::error::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key material could not be parsed or is the wrong length.
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    /// A signature failed to parse or verify.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    /// The backend's readiness probe failed.
    #[error("Signer probe failed for '{kid}': {reason}")]
    ProbeFailed {
        /// Key id of the failing backend.
        kid: String,
        /// Probe failure detail.
        reason: String,
    },
    /// A remote signing call failed.
    #[error("Signer backend error: {0}")]
    Backend(String),
    /// No backend is currently able to sign.
    #[error("No ready signer backend: {0}")]
    NotReady(String),
    /// The operation is not supported by this backend.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    /// The requested key id is not registered.
    #[error("Unknown key id: {0}")]
    UnknownKid(String),
    /// Refused by an environment guard (e.g. dev signer in production).
    #[error("Refused by environment guard: {0}")]
    Refused(String),
}

impl ErrorCode for CryptoError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidKey(_) => "CRYPTO_INVALID_KEY",
            Self::InvalidSignature(_) => "CRYPTO_INVALID_SIGNATURE",
            Self::ProbeFailed { .. } => "CRYPTO_PROBE_FAILED",
            Self::Backend(_) => "CRYPTO_BACKEND_ERROR",
            Self::NotReady(_) => "CRYPTO_SIGNER_NOT_READY",
            Self::Unsupported(_) => "CRYPTO_UNSUPPORTED",
            Self::UnknownKid(_) => "CRYPTO_UNKNOWN_KID",
            Self::Refused(_) => "CRYPTO_REFUSED",
        }
    }
}

impl From<reqwest::Error> for CryptoError {
    fn from(e: reqwest::Error) -> Self {
        CryptoError::Backend(e.to_string())
    }
}
