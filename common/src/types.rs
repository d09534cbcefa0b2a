use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::envelope::EncryptedEnvelope;

/// Lifecycle status of a registered sensor identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStatus {
    Active,
    Inactive,
    Revoked,
}

impl IdentityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityStatus::Active => "active",
            IdentityStatus::Inactive => "inactive",
            IdentityStatus::Revoked => "revoked",
        }
    }
}

/// A tenant-scoped sensor registration.
///
/// `device_id` is only unique within a tenant; several tenants may register
/// the same human-assigned identifier, which is why signature trial is the
/// authority for resolving a wire message to one of these rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorIdentity {
    pub device_id: String,
    pub tenant_id: String,
    /// PEM-encoded RSA public key. Absent until provisioning lands a key.
    pub public_key: Option<String>,
    pub status: IdentityStatus,
    pub device_type: String,
}

/// One-shot challenge minted for a device before session establishment.
/// Held in process memory only; lost on restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceChallenge {
    pub challenge_id: String,
    pub device_id: String,
    pub challenge_secret: String,
    pub expires_at: DateTime<Utc>,
}

/// Persisted device session with a strictly-increasing anti-replay counter
/// and sliding expiration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSession {
    pub session_token: String,
    pub device_id: String,
    pub counter: u64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Decrypted submission plaintext. The device signs and hashes the canonical
/// serialization of the whole structure, session fields included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// Kept loose on purpose: devices have been observed sending the counter
    /// both as a number and as a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<serde_json::Value>,
    #[serde(flatten)]
    pub metrics: HashMap<String, serde_json::Value>,
}

/// Wire shape of `POST /submit-data`: the four envelope fields plus the
/// plaintext integrity hash and the detached device signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedSubmission {
    #[serde(flatten)]
    pub envelope: EncryptedEnvelope,
    pub sha256: String,
    pub sensor_id: String,
    pub signature: String,
}

/// Device -> server public key announcement on `keys/{device_id}/public`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyAnnouncement {
    pub device_id: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Body of a provisioning message. `update`/`delete` bodies travel sealed in
/// an [`EncryptedEnvelope`]; `request` bodies are plaintext (the device may
/// not have keys yet).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionCommand {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_wire_fields_are_stable() {
        let submission = SignedSubmission {
            envelope: EncryptedEnvelope {
                session_key: "sk".to_string(),
                nonce: "n".to_string(),
                ciphertext: "ct".to_string(),
                tag: "t".to_string(),
            },
            sha256: "hash".to_string(),
            sensor_id: "pH01".to_string(),
            signature: "sig".to_string(),
        };
        let value = serde_json::to_value(&submission).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["ciphertext", "nonce", "sensor_id", "session_key", "sha256", "signature", "tag"]
        );

        let roundtrip: SignedSubmission = serde_json::from_value(value).unwrap();
        assert_eq!(roundtrip.envelope.session_key, "sk");
        assert_eq!(roundtrip.sensor_id, "pH01");
    }

    #[test]
    fn reading_metrics_flatten_alongside_session_fields() {
        let json = serde_json::json!({
            "device_id": "pH01",
            "device_type": "ph",
            "session_token": "tok",
            "counter": 3,
            "ph": 7.2,
            "temperature": 21.5,
        });
        let reading: SensorReading = serde_json::from_value(json).unwrap();
        assert_eq!(reading.device_id, "pH01");
        assert_eq!(reading.counter.as_ref().unwrap().as_u64(), Some(3));
        assert_eq!(reading.metrics.len(), 2);
        assert!(reading.metrics.contains_key("ph"));
    }

    #[test]
    fn identity_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&IdentityStatus::Active).unwrap(),
            "\"active\""
        );
        assert_eq!(IdentityStatus::Revoked.as_str(), "revoked");
    }
}
