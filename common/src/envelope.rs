//! Hybrid end-to-end encryption envelopes.
//!
//! A fresh AES-256-GCM key and nonce are generated per message; the key
//! travels RSA-OAEP-wrapped under the recipient's public key. The four wire
//! fields (`session_key`, `nonce`, `ciphertext`, `tag`) are base64 and match
//! what deployed sensor firmware already emits.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ProtocolError;

const SYM_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Key unwrap and tag verification failures are deliberately collapsed
    /// into one variant so callers cannot be used as a padding/tag oracle.
    #[error("envelope failed key unwrap or authentication")]
    TamperedOrInvalid,
    #[error("plaintext integrity hash mismatch")]
    IntegrityMismatch,
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<EnvelopeError> for ProtocolError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::TamperedOrInvalid | EnvelopeError::IntegrityMismatch => {
                ProtocolError::IntegrityFailure(err.to_string())
            }
            EnvelopeError::Malformed(_) | EnvelopeError::Serialization(_) => {
                ProtocolError::ProtocolViolation(err.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// OAEP-wrapped symmetric key, base64.
    pub session_key: String,
    pub nonce: String,
    pub ciphertext: String,
    pub tag: String,
}

/// Canonical serialization: JSON with lexicographically ordered object keys
/// at every level. Signatures and content hashes are computed over these
/// bytes so device and server agree byte-for-byte.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, EnvelopeError> {
    // serde_json maps are BTree-backed, so going through Value sorts keys.
    let value = serde_json::to_value(value).map_err(|e| EnvelopeError::Serialization(e.to_string()))?;
    serde_json::to_vec(&value).map_err(|e| EnvelopeError::Serialization(e.to_string()))
}

/// Hex SHA-256 of the canonical plaintext, carried alongside the envelope as
/// a second integrity layer over the AEAD tag.
pub fn content_hash(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub fn seal<T: Serialize>(
    value: &T,
    recipient: &RsaPublicKey,
) -> Result<EncryptedEnvelope, EnvelopeError> {
    let plaintext = canonical_bytes(value)?;

    let mut sym_key = [0u8; SYM_KEY_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut sym_key);
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(&sym_key)
        .map_err(|e| EnvelopeError::Serialization(e.to_string()))?;
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
        .map_err(|_| EnvelopeError::Serialization("AEAD encryption failed".to_string()))?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    let wrapped_key = recipient
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &sym_key)
        .map_err(|e| EnvelopeError::Serialization(format!("key wrap failed: {}", e)))?;

    Ok(EncryptedEnvelope {
        session_key: base64::encode(wrapped_key),
        nonce: base64::encode(nonce),
        ciphertext: base64::encode(sealed),
        tag: base64::encode(tag),
    })
}

pub fn open<T: DeserializeOwned>(
    envelope: &EncryptedEnvelope,
    key: &RsaPrivateKey,
) -> Result<T, EnvelopeError> {
    let plaintext = open_raw(envelope, key)?;
    serde_json::from_slice(&plaintext).map_err(|e| EnvelopeError::Serialization(e.to_string()))
}

/// Decrypt without deserializing; callers that need the canonical bytes for
/// hash/signature checks parse the value themselves.
pub fn open_raw(envelope: &EncryptedEnvelope, key: &RsaPrivateKey) -> Result<Vec<u8>, EnvelopeError> {
    let wrapped_key = decode_field(&envelope.session_key, "session_key")?;
    let nonce = decode_field(&envelope.nonce, "nonce")?;
    let ciphertext = decode_field(&envelope.ciphertext, "ciphertext")?;
    let tag = decode_field(&envelope.tag, "tag")?;

    if nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(EnvelopeError::Malformed(
            "unexpected nonce or tag length".to_string(),
        ));
    }

    // From here on every failure is the same error: no partial plaintext,
    // no distinction between a bad unwrap and a bad tag.
    let sym_key = key
        .decrypt(Oaep::new::<Sha256>(), &wrapped_key)
        .map_err(|_| EnvelopeError::TamperedOrInvalid)?;
    if sym_key.len() != SYM_KEY_LEN {
        return Err(EnvelopeError::TamperedOrInvalid);
    }

    let cipher =
        Aes256Gcm::new_from_slice(&sym_key).map_err(|_| EnvelopeError::TamperedOrInvalid)?;
    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);
    cipher
        .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
        .map_err(|_| EnvelopeError::TamperedOrInvalid)
}

/// Recompute the content hash over `value` and compare against the hash the
/// sender shipped next to the envelope.
pub fn verify_content_hash<T: Serialize>(value: &T, expected: &str) -> Result<(), EnvelopeError> {
    let bytes = canonical_bytes(value)?;
    if content_hash(&bytes) == expected {
        Ok(())
    } else {
        Err(EnvelopeError::IntegrityMismatch)
    }
}

fn decode_field(value: &str, field: &str) -> Result<Vec<u8>, EnvelopeError> {
    base64::decode(value).map_err(|_| EnvelopeError::Malformed(format!("bad base64 in {}", field)))
}
