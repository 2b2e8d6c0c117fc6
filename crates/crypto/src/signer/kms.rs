//! KMS-style remote signer.
//!
//! Speaks a minimal REST dialect of a key-management service: the probe is
//! a describe-key call, signing is digest-mode only (the service never
//! sees plaintext). This is the backend production deployments are
//! required to run.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::signer::{SignatureAlgorithm, SignatureBundle, SignerBackend};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

#[derive(Debug, Deserialize)]
struct DescribeKeyResponse {
    key_id: String,
    algorithm: String,
    /// Base64 public material.
    public_key: String,
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    digest: String,
    message_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: String,
}

pub struct KmsSigner {
    endpoint: String,
    kid: String,
    client: reqwest::Client,
    /// Cached by the probe; verification uses it locally.
    public_key: RwLock<Option<Vec<u8>>>,
}

impl KmsSigner {
    pub fn new(endpoint: &str, key_id: &str, timeout: Duration) -> Result<Self, CryptoError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CryptoError::Backend(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            kid: key_id.to_string(),
            client,
            public_key: RwLock::new(None),
        })
    }

    fn describe_url(&self) -> String {
        format!("{}/keys/{}", self.endpoint, self.kid)
    }

    fn sign_url(&self) -> String {
        format!("{}/keys/{}/sign", self.endpoint, self.kid)
    }

    fn cached_public_key(&self) -> Option<Vec<u8>> {
        self.public_key.read().ok().and_then(|g| g.clone())
    }
}

#[async_trait]
impl SignerBackend for KmsSigner {
    fn kid(&self) -> &str {
        &self.kid
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Ed25519
    }

    fn public_key(&self) -> Option<Vec<u8>> {
        self.cached_public_key()
    }

    async fn probe(&self) -> Result<(), CryptoError> {
        let resp = self
            .client
            .get(self.describe_url())
            .send()
            .await
            .map_err(|e| CryptoError::ProbeFailed {
                kid: self.kid.clone(),
                reason: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(CryptoError::ProbeFailed {
                kid: self.kid.clone(),
                reason: format!("describe-key returned {}", resp.status()),
            });
        }
        let body: DescribeKeyResponse =
            resp.json().await.map_err(|e| CryptoError::ProbeFailed {
                kid: self.kid.clone(),
                reason: format!("bad describe-key body: {}", e),
            })?;
        if body.key_id != self.kid {
            return Err(CryptoError::ProbeFailed {
                kid: self.kid.clone(),
                reason: format!("endpoint answered for key '{}'", body.key_id),
            });
        }
        if body.algorithm != SignatureAlgorithm::Ed25519.as_str() {
            return Err(CryptoError::Unsupported(format!(
                "KMS key algorithm '{}' is not supported",
                body.algorithm
            )));
        }
        let pk = B64
            .decode(&body.public_key)
            .map_err(|e| CryptoError::InvalidKey(format!("bad public key: {}", e)))?;
        if let Ok(mut guard) = self.public_key.write() {
            *guard = Some(pk);
        }
        Ok(())
    }

    async fn sign(&self, digest: &[u8; 32]) -> Result<SignatureBundle, CryptoError> {
        let req = SignRequest {
            digest: B64.encode(digest),
            message_type: "DIGEST",
        };
        let resp = self
            .client
            .post(self.sign_url())
            .json(&req)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CryptoError::Backend(format!(
                "sign returned {}",
                resp.status()
            )));
        }
        let body: SignResponse = resp
            .json()
            .await
            .map_err(|e| CryptoError::Backend(format!("bad sign body: {}", e)))?;
        let signature = B64
            .decode(&body.signature)
            .map_err(|e| CryptoError::InvalidSignature(format!("bad base64: {}", e)))?;
        Ok(SignatureBundle {
            signature,
            signer_kid: self.kid.clone(),
            algorithm: SignatureAlgorithm::Ed25519,
        })
    }

    fn verify(&self, digest: &[u8; 32], signature: &[u8]) -> Result<bool, CryptoError> {
        let pk_bytes = self
            .cached_public_key()
            .ok_or_else(|| CryptoError::NotReady("KMS public key not yet fetched".into()))?;
        crate::keys::verify_ed25519(&pk_bytes, digest, signature)
    }
}
