//! HMAC-SHA256 development signer.
//!
//! Symmetric, fast, and self-contained: the right tool for unit and
//! integration tests. The constructor refuses to build in production so a
//! misconfigured deployment fails at startup rather than minting audit
//! rows nobody else can verify.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sentinel_types::config::Environment;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::signer::{SignatureAlgorithm, SignatureBundle, SignerBackend};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug)]
pub struct LocalDevSigner {
    kid: String,
    secret: Zeroizing<Vec<u8>>,
}

impl LocalDevSigner {
    pub fn new(
        kid: &str,
        secret: &[u8],
        environment: Environment,
    ) -> Result<Self, CryptoError> {
        if environment.is_production() {
            return Err(CryptoError::Refused(
                "the HMAC dev signer must not load in production".into(),
            ));
        }
        if secret.len() < 16 {
            return Err(CryptoError::InvalidKey(
                "dev signer secret must be at least 16 bytes".into(),
            ));
        }
        Ok(Self {
            kid: kid.to_string(),
            secret: Zeroizing::new(secret.to_vec()),
        })
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts any key length; new_from_slice cannot fail here.
        HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length")
    }
}

#[async_trait]
impl SignerBackend for LocalDevSigner {
    fn kid(&self) -> &str {
        &self.kid
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::HmacSha256
    }

    fn public_key(&self) -> Option<Vec<u8>> {
        None
    }

    async fn probe(&self) -> Result<(), CryptoError> {
        Ok(())
    }

    async fn sign(&self, digest: &[u8; 32]) -> Result<SignatureBundle, CryptoError> {
        let mut mac = self.mac();
        mac.update(digest);
        Ok(SignatureBundle {
            signature: mac.finalize().into_bytes().to_vec(),
            signer_kid: self.kid.clone(),
            algorithm: SignatureAlgorithm::HmacSha256,
        })
    }

    fn verify(&self, digest: &[u8; 32], signature: &[u8]) -> Result<bool, CryptoError> {
        let mut mac = self.mac();
        mac.update(digest);
        Ok(mac.verify_slice(signature).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_verify_round_trip() {
        let signer =
            LocalDevSigner::new("dev", b"sixteen-byte-key", Environment::Development).unwrap();
        let digest = [42u8; 32];
        let bundle = signer.sign(&digest).await.unwrap();
        assert!(signer.verify(&digest, &bundle.signature).unwrap());
        assert!(!signer.verify(&[0u8; 32], &bundle.signature).unwrap());
    }

    #[test]
    fn refuses_production() {
        let err =
            LocalDevSigner::new("dev", b"sixteen-byte-key", Environment::Production).unwrap_err();
        assert!(matches!(err, CryptoError::Refused(_)));
    }

    #[test]
    fn refuses_short_secrets() {
        assert!(LocalDevSigner::new("dev", b"short", Environment::Development).is_err());
    }
}
