//! RSA key handling and detached PKCS#1 v1.5 signatures.
//!
//! Devices prove possession of their private key by signing challenges and
//! submission plaintexts with PKCS#1 v1.5 over SHA-256; the collector only
//! ever sees public keys.

use base64::URL_SAFE_NO_PAD;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use sha2::{Digest, Sha256};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::{ProtocolError, Result};

pub const KEY_BITS: usize = 2048;

/// URL-safe random token with `bytes * 8` bits of entropy.
pub fn urlsafe_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    base64::encode_config(buf, URL_SAFE_NO_PAD)
}

pub fn generate_keypair() -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, KEY_BITS)
        .map_err(|e| ProtocolError::InternalError(format!("RSA key generation failed: {}", e)))
}

pub fn private_key_to_pem(key: &RsaPrivateKey) -> Result<String> {
    key.to_pkcs8_pem(LineEnding::LF)
        .map(|pem| pem.to_string())
        .map_err(|e| ProtocolError::InternalError(format!("Failed to encode private key: {}", e)))
}

/// Accepts both PKCS#8 and legacy PKCS#1 PEM, since field devices still
/// carry keys exported in either shape.
pub fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| ProtocolError::ProtocolViolation(format!("Invalid private key PEM: {}", e)))
}

pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<String> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| ProtocolError::InternalError(format!("Failed to encode public key: {}", e)))
}

pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| ProtocolError::ProtocolViolation(format!("Invalid public key PEM: {}", e)))
}

pub fn sign(key: &RsaPrivateKey, message: &[u8]) -> Vec<u8> {
    let signing_key = SigningKey::<Sha256>::new(key.clone());
    signing_key.sign(message).to_vec()
}

pub fn sign_base64(key: &RsaPrivateKey, message: &[u8]) -> String {
    base64::encode(sign(key, message))
}

pub fn verify(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let verifying_key = VerifyingKey::<Sha256>::new(key.clone());
    match Signature::try_from(signature) {
        Ok(signature) => verifying_key.verify(message, &signature).is_ok(),
        Err(_) => false,
    }
}

/// Short SHA-256 fingerprint of a PEM key, whitespace-normalized, used in
/// logs instead of the key material itself.
pub fn fingerprint(pem: &str) -> String {
    let normalized: String = pem.split_whitespace().collect();
    let digest = Sha256::digest(normalized.as_bytes());
    digest
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let key = generate_keypair().unwrap();
        let public = RsaPublicKey::from(&key);
        let signature = sign(&key, b"challenge-bytes");
        assert!(verify(&public, b"challenge-bytes", &signature));
        assert!(!verify(&public, b"different-bytes", &signature));
    }

    #[test]
    fn verify_rejects_foreign_key() {
        let key_a = generate_keypair().unwrap();
        let key_b = generate_keypair().unwrap();
        let signature = sign(&key_a, b"message");
        assert!(!verify(&RsaPublicKey::from(&key_b), b"message", &signature));
    }

    #[test]
    fn pem_roundtrip() {
        let key = generate_keypair().unwrap();
        let pem = private_key_to_pem(&key).unwrap();
        let restored = private_key_from_pem(&pem).unwrap();
        assert_eq!(key, restored);

        let pub_pem = public_key_to_pem(&RsaPublicKey::from(&key)).unwrap();
        let restored_pub = public_key_from_pem(&pub_pem).unwrap();
        assert_eq!(RsaPublicKey::from(&key), restored_pub);
    }

    #[test]
    fn tokens_are_distinct_and_urlsafe() {
        let a = urlsafe_token(32);
        let b = urlsafe_token(32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn fingerprint_ignores_whitespace() {
        let key = generate_keypair().unwrap();
        let pem = public_key_to_pem(&RsaPublicKey::from(&key)).unwrap();
        let reflowed = pem.replace('\n', "\r\n");
        assert_eq!(fingerprint(&pem), fingerprint(&reflowed));
    }
}
