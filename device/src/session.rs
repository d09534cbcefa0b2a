//! Device-side session lifecycle and secure submission.
//!
//! Mirrors the server protocol: request a challenge, sign it to prove key
//! possession, then submit readings carrying the session token and a
//! strictly increasing counter inside the sealed plaintext.

use chrono::{DateTime, Duration, Utc};
use common::envelope;
use common::signing;
use common::{ProtocolError, Result, SensorReading, SignedSubmission};
use log::{info, warn};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use std::collections::HashMap;

const RENEW_MARGIN_SECONDS: i64 = 60;

#[derive(Debug, Deserialize)]
pub struct ChallengeGrant {
    pub challenge_id: String,
    pub challenge: String,
    pub expires_in_seconds: i64,
}

#[derive(Debug, Deserialize)]
struct SessionGrant {
    session_token: String,
    expires_in_seconds: i64,
}

pub struct DeviceSessionManager {
    device_id: String,
    server_url: String,
    device_key: RsaPrivateKey,
    server_public_key: RsaPublicKey,
    http: reqwest::Client,
    session_token: Option<String>,
    counter: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl DeviceSessionManager {
    pub fn new(
        device_id: &str,
        server_url: &str,
        device_key: RsaPrivateKey,
        server_public_key: RsaPublicKey,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            server_url: server_url.trim_end_matches('/').to_string(),
            device_key,
            server_public_key,
            http: reqwest::Client::new(),
            session_token: None,
            counter: 0,
            expires_at: None,
        }
    }

    pub async fn request_challenge(&self) -> Result<ChallengeGrant> {
        let url = format!("{}/api/device/session/request", self.server_url);
        info!("Requesting challenge for device '{}'", self.device_id);
        let response = self
            .http
            .get(&url)
            .query(&[("device_id", self.device_id.as_str())])
            .send()
            .await
            .map_err(|e| ProtocolError::NetworkError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProtocolError::AuthenticationFailure(format!(
                "challenge request refused: {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ProtocolError::NetworkError(e.to_string()))
    }

    pub async fn establish(&mut self) -> Result<()> {
        let grant = self.request_challenge().await?;
        let signature = signing::sign_base64(&self.device_key, grant.challenge.as_bytes());

        let url = format!("{}/api/device/session/establish", self.server_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "device_id": self.device_id,
                "challenge_id": grant.challenge_id,
                "signature": signature,
            }))
            .send()
            .await
            .map_err(|e| ProtocolError::NetworkError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProtocolError::AuthenticationFailure(format!(
                "session establish refused: {}",
                response.status()
            )));
        }
        let session: SessionGrant = response
            .json()
            .await
            .map_err(|e| ProtocolError::NetworkError(e.to_string()))?;

        self.session_token = Some(session.session_token);
        self.expires_at = Some(Utc::now() + Duration::seconds(session.expires_in_seconds));
        // Counter restarts with every session.
        self.counter = 0;
        info!(
            "Session established for '{}' (expires in {}s)",
            self.device_id, session.expires_in_seconds
        );
        Ok(())
    }

    /// Re-establish when missing or within a minute of expiry.
    pub async fn ensure_session(&mut self) -> Result<()> {
        if let (Some(_), Some(expires_at)) = (&self.session_token, self.expires_at) {
            if Utc::now() < expires_at - Duration::seconds(RENEW_MARGIN_SECONDS) {
                return Ok(());
            }
        }
        self.establish().await
    }

    /// Seal, hash, sign, and submit one reading.
    pub async fn submit_reading(
        &mut self,
        device_type: &str,
        metrics: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        self.ensure_session().await?;
        self.counter += 1;

        let reading = SensorReading {
            device_id: self.device_id.clone(),
            device_type: Some(device_type.to_string()),
            session_token: self.session_token.clone(),
            counter: Some(serde_json::Value::from(self.counter)),
            metrics,
        };

        let canonical = envelope::canonical_bytes(&reading)
            .map_err(|e| ProtocolError::InternalError(e.to_string()))?;
        let sealed = envelope::seal(&reading, &self.server_public_key)
            .map_err(|e| ProtocolError::InternalError(e.to_string()))?;

        let submission = SignedSubmission {
            envelope: sealed,
            sha256: envelope::content_hash(&canonical),
            sensor_id: self.device_id.clone(),
            signature: signing::sign_base64(&self.device_key, &canonical),
        };

        let url = format!("{}/submit-data", self.server_url);
        let response = self
            .http
            .post(&url)
            .json(&submission)
            .send()
            .await
            .map_err(|e| ProtocolError::NetworkError(e.to_string()))?;

        if response.status().is_success() {
            info!("Reading submitted (counter={})", self.counter);
            Ok(())
        } else {
            // A session error invalidates our token; force re-establishment
            // on the next attempt.
            if response.status().as_u16() == 401 {
                warn!("Session rejected; will re-establish");
                self.session_token = None;
                self.expires_at = None;
            }
            Err(ProtocolError::AuthenticationFailure(format!(
                "submission refused: {}",
                response.status()
            )))
        }
    }
}
