//! Signing-proxy backend.
//!
//! The proxy fronts an organization HSM behind `POST /sign/hash`. Callers
//! authenticate with an API key (mTLS is terminated in front of the
//! process); the probe hits `/health`, which also publishes the proxy's
//! verification key.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::signer::{SignatureAlgorithm, SignatureBundle, SignerBackend};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;
const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    public_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct SignHashRequest<'a> {
    key_id: &'a str,
    digest: String,
}

#[derive(Debug, Deserialize)]
struct SignHashResponse {
    signature: String,
    #[serde(default)]
    kid: Option<String>,
}

pub struct ProxySigner {
    endpoint: String,
    kid: String,
    api_key: Option<String>,
    client: reqwest::Client,
    public_key: RwLock<Option<Vec<u8>>>,
}

impl ProxySigner {
    pub fn new(
        endpoint: &str,
        key_id: &str,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, CryptoError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CryptoError::Backend(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            kid: key_id.to_string(),
            api_key: api_key.map(str::to_string),
            client,
            public_key: RwLock::new(None),
        })
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header(API_KEY_HEADER, key),
            None => req,
        }
    }
}

#[async_trait]
impl SignerBackend for ProxySigner {
    fn kid(&self) -> &str {
        &self.kid
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Ed25519
    }

    fn public_key(&self) -> Option<Vec<u8>> {
        self.public_key.read().ok().and_then(|g| g.clone())
    }

    async fn probe(&self) -> Result<(), CryptoError> {
        let resp = self
            .with_auth(self.client.get(format!("{}/health", self.endpoint)))
            .send()
            .await
            .map_err(|e| CryptoError::ProbeFailed {
                kid: self.kid.clone(),
                reason: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(CryptoError::ProbeFailed {
                kid: self.kid.clone(),
                reason: format!("/health returned {}", resp.status()),
            });
        }
        let body: HealthResponse = resp.json().await.map_err(|e| CryptoError::ProbeFailed {
            kid: self.kid.clone(),
            reason: format!("bad /health body: {}", e),
        })?;
        if body.status != "ok" {
            return Err(CryptoError::ProbeFailed {
                kid: self.kid.clone(),
                reason: format!("proxy reports status '{}'", body.status),
            });
        }
        if let Some(pk_b64) = body.public_key {
            let pk = B64
                .decode(pk_b64)
                .map_err(|e| CryptoError::InvalidKey(format!("bad public key: {}", e)))?;
            if let Ok(mut guard) = self.public_key.write() {
                *guard = Some(pk);
            }
        }
        Ok(())
    }

    async fn sign(&self, digest: &[u8; 32]) -> Result<SignatureBundle, CryptoError> {
        let req = SignHashRequest {
            key_id: &self.kid,
            digest: B64.encode(digest),
        };
        let resp = self
            .with_auth(self.client.post(format!("{}/sign/hash", self.endpoint)))
            .json(&req)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CryptoError::Backend(format!(
                "/sign/hash returned {}",
                resp.status()
            )));
        }
        let body: SignHashResponse = resp
            .json()
            .await
            .map_err(|e| CryptoError::Backend(format!("bad /sign/hash body: {}", e)))?;
        if let Some(kid) = &body.kid {
            if kid != &self.kid {
                return Err(CryptoError::Backend(format!(
                    "proxy signed with unexpected key '{}'",
                    kid
                )));
            }
        }
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
            .public_key()
            .ok_or_else(|| CryptoError::NotReady("proxy public key not yet fetched".into()))?;
        crate::keys::verify_ed25519(&pk_bytes, digest, signature)
    }
}
