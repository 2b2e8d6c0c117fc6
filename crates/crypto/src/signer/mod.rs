//! The signer abstraction: digest-mode signing behind interchangeable
//! backends, plus the registry that selects and monitors them.

pub mod kms;
pub mod local;
pub mod proxy;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::CryptoError;

/// Signature algorithms the plane understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    #[serde(rename = "hmac-sha256")]
    HmacSha256,
    #[serde(rename = "rsa-sha256")]
    RsaSha256,
    #[serde(rename = "ed25519")]
    Ed25519,
}

impl SignatureAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HmacSha256 => "hmac-sha256",
            Self::RsaSha256 => "rsa-sha256",
            Self::Ed25519 => "ed25519",
        }
    }

    /// Symmetric schemes cannot publish a verification key and are only
    /// acceptable in development.
    pub fn is_asymmetric(self) -> bool {
        !matches!(self, Self::HmacSha256)
    }
}

/// A produced signature together with the key that made it.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureBundle {
    pub signature: Vec<u8>,
    pub signer_kid: String,
    pub algorithm: SignatureAlgorithm,
}

impl SignatureBundle {
    pub fn signature_b64(&self) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(&self.signature)
    }
}

/// A published signer record, served by `GET /signers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerRecord {
    pub kid: String,
    pub algorithm: SignatureAlgorithm,
    /// Base64 public material for asymmetric backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// An abstract producer of `(signature, signer_kid)` over a 32-byte digest.
#[async_trait]
pub trait SignerBackend: Send + Sync {
    /// Key id this backend signs with.
    fn kid(&self) -> &str;

    fn algorithm(&self) -> SignatureAlgorithm;

    /// Raw public key bytes, once known. Asymmetric backends populate this
    /// during their probe.
    fn public_key(&self) -> Option<Vec<u8>>;

    /// Readiness probe (`describe-key`, `/health`, or a local check).
    async fn probe(&self) -> Result<(), CryptoError>;

    /// Signs a 32-byte digest. Digest-mode only: backends never hash.
    async fn sign(&self, digest: &[u8; 32]) -> Result<SignatureBundle, CryptoError>;

    /// Verifies a signature over a digest produced by this backend's key.
    fn verify(&self, digest: &[u8; 32], signature: &[u8]) -> Result<bool, CryptoError>;
}

/// Readiness of the signing plane as reported by `/ready`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Readiness {
    Ready {
        /// Kid of the backend that answered the probe.
        backend: String,
    },
    Degraded {
        reason: String,
    },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

struct RegistryState {
    active: Option<usize>,
    readiness: Readiness,
}

/// Ordered collection of signer backends. The first backend whose probe
/// passes is selected for signing; a later failure demotes readiness to
/// degraded, which blocks signing (and therefore appends) while
/// verification stays available.
pub struct SignerRegistry {
    backends: Vec<Arc<dyn SignerBackend>>,
    state: RwLock<RegistryState>,
}

impl SignerRegistry {
    pub fn new(backends: Vec<Arc<dyn SignerBackend>>) -> Self {
        Self {
            backends,
            state: RwLock::new(RegistryState {
                active: None,
                readiness: Readiness::Degraded {
                    reason: "not probed".into(),
                },
            }),
        }
    }

    /// Probes backends in order and selects the first that answers.
    pub async fn probe(&self) -> Readiness {
        let mut failures = Vec::new();
        for (idx, backend) in self.backends.iter().enumerate() {
            match backend.probe().await {
                Ok(()) => {
                    let readiness = Readiness::Ready {
                        backend: backend.kid().to_string(),
                    };
                    let mut state = self.state.write().await;
                    state.active = Some(idx);
                    state.readiness = readiness.clone();
                    tracing::info!(target: "signer", kid = backend.kid(), "signer backend selected");
                    return readiness;
                }
                Err(e) => {
                    tracing::warn!(target: "signer", kid = backend.kid(), error = %e, "signer probe failed");
                    failures.push(format!("{}: {}", backend.kid(), e));
                }
            }
        }
        let readiness = Readiness::Degraded {
            reason: if failures.is_empty() {
                "no signer backends configured".into()
            } else {
                failures.join("; ")
            },
        };
        let mut state = self.state.write().await;
        state.active = None;
        state.readiness = readiness.clone();
        readiness
    }

    /// Startup guard: probes and, when `require_asymmetric` is set,
    /// demands that the selected backend publishes a public key. The
    /// caller exits non-zero on error.
    pub async fn startup(&self, require_asymmetric: bool) -> Result<Readiness, CryptoError> {
        let readiness = self.probe().await;
        if require_asymmetric {
            match &readiness {
                Readiness::Ready { backend } => {
                    let selected = self
                        .backend_by_kid(backend)
                        .ok_or_else(|| CryptoError::UnknownKid(backend.clone()))?;
                    if !selected.algorithm().is_asymmetric() {
                        return Err(CryptoError::Refused(format!(
                            "asymmetric signer required but '{}' is {}",
                            backend,
                            selected.algorithm().as_str()
                        )));
                    }
                }
                Readiness::Degraded { reason } => {
                    return Err(CryptoError::NotReady(reason.clone()))
                }
            }
        }
        Ok(readiness)
    }

    /// Signs a digest through the active backend. Failure demotes
    /// readiness and surfaces the error to the caller.
    pub async fn sign(&self, digest: &[u8; 32]) -> Result<SignatureBundle, CryptoError> {
        let active = {
            let state = self.state.read().await;
            match (&state.readiness, state.active) {
                (Readiness::Ready { .. }, Some(idx)) => idx,
                (Readiness::Degraded { reason }, _) => {
                    return Err(CryptoError::NotReady(reason.clone()))
                }
                _ => return Err(CryptoError::NotReady("no active backend".into())),
            }
        };
        let backend = self.backends[active].clone();
        match backend.sign(digest).await {
            Ok(bundle) => Ok(bundle),
            Err(e) => {
                let mut state = self.state.write().await;
                state.readiness = Readiness::Degraded {
                    reason: format!("sign via '{}' failed: {}", backend.kid(), e),
                };
                state.active = None;
                Err(e)
            }
        }
    }

    /// Verifies a signature against the named key. Available even when
    /// signing is degraded.
    pub fn verify(
        &self,
        kid: &str,
        digest: &[u8; 32],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        let backend = self
            .backend_by_kid(kid)
            .ok_or_else(|| CryptoError::UnknownKid(kid.to_string()))?;
        backend.verify(digest, signature)
    }

    pub async fn readiness(&self) -> Readiness {
        self.state.read().await.readiness.clone()
    }

    /// Published `(kid, algorithm, public_key)` records.
    pub fn records(&self) -> Vec<SignerRecord> {
        use base64::Engine as _;
        self.backends
            .iter()
            .map(|b| SignerRecord {
                kid: b.kid().to_string(),
                algorithm: b.algorithm(),
                public_key: b
                    .public_key()
                    .map(|pk| base64::engine::general_purpose::STANDARD.encode(pk)),
            })
            .collect()
    }

    fn backend_by_kid(&self, kid: &str) -> Option<&Arc<dyn SignerBackend>> {
        self.backends.iter().find(|b| b.kid() == kid)
    }
}

#[cfg(test)]
mod tests {
    use super::local::LocalDevSigner;
    use super::*;
    use sentinel_types::config::Environment;

    fn dev_registry() -> SignerRegistry {
        let signer =
            LocalDevSigner::new("dev-1", b"0123456789abcdef", Environment::Development).unwrap();
        SignerRegistry::new(vec![Arc::new(signer)])
    }

    #[tokio::test]
    async fn probe_selects_first_passing_backend() {
        let registry = dev_registry();
        let readiness = registry.probe().await;
        assert_eq!(
            readiness,
            Readiness::Ready {
                backend: "dev-1".into()
            }
        );
    }

    #[tokio::test]
    async fn sign_requires_probe() {
        let registry = dev_registry();
        let digest = [7u8; 32];
        assert!(matches!(
            registry.sign(&digest).await,
            Err(CryptoError::NotReady(_))
        ));
        registry.probe().await;
        let bundle = registry.sign(&digest).await.unwrap();
        assert_eq!(bundle.signer_kid, "dev-1");
        assert!(registry.verify("dev-1", &digest, &bundle.signature).unwrap());
    }

    #[tokio::test]
    async fn startup_rejects_symmetric_when_kms_required() {
        let registry = dev_registry();
        let err = registry.startup(true).await.unwrap_err();
        assert!(matches!(err, CryptoError::Refused(_)));
        // Without the requirement the dev signer is fine.
        let readiness = registry.startup(false).await.unwrap();
        assert!(readiness.is_ready());
    }

    #[tokio::test]
    async fn verify_rejects_unknown_kid() {
        let registry = dev_registry();
        assert!(matches!(
            registry.verify("ghost", &[0u8; 32], b"sig"),
            Err(CryptoError::UnknownKid(_))
        ));
    }
}
