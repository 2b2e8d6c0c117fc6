//! SHA-256 helpers shared by the audit chain and the multisig controller.

use sha2::{Digest, Sha256};

/// Hashes arbitrary bytes to a 32-byte digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hashes arbitrary bytes and renders the digest as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Parses a lowercase-hex digest back to its 32-byte form.
pub fn digest_from_hex(s: &str) -> Result<[u8; 32], crate::CryptoError> {
    let bytes = hex::decode(s)
        .map_err(|e| crate::CryptoError::InvalidKey(format!("bad hex digest: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| crate::CryptoError::InvalidKey("digest must be 32 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // SHA-256("abc")
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hex_round_trip() {
        let d = sha256(b"sentinel");
        assert_eq!(digest_from_hex(&hex::encode(d)).unwrap(), d);
        assert!(digest_from_hex("zz").is_err());
        assert!(digest_from_hex("00ff").is_err());
    }
}
