//! Server core: shared state, protocol flows, and HTTP wiring.
//!
//! The handlers in [`handlers`] are thin adapters over the flow methods
//! here, so the protocol can be exercised end to end without a socket.

use actix_web::{web, App, HttpServer};
use common::cache::GuardedMap;
use common::envelope;
use common::replay::ReplayGuard;
use common::{
    Config, DeviceChallenge, DeviceSession, IdentityStatus, ProtocolError, Result, SensorIdentity,
    SensorReading, SignedSubmission,
};
use log::{error, info, warn};
use rsa::RsaPrivateKey;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::identity::{IdentityResolver, ResolveError, SensorDirectory};
use crate::provision::ProvisioningPublisher;
use crate::readings::ReadingSink;
use crate::session::{ChallengeAuthority, ChallengeError, SessionError, SessionStore};

pub mod handlers;

const SWEEP_INTERVAL_SECONDS: u64 = 30;

/// Failures of the session establishment flow, each mapped to one HTTP
/// status by the handlers.
#[derive(Error, Debug)]
pub enum EstablishError {
    #[error("device not active or not found")]
    UnknownDevice,
    #[error("invalid challenge")]
    InvalidChallenge,
    #[error("challenge expired")]
    ChallengeExpired,
    #[error("invalid signature or no matching active sensor")]
    InvalidSignature,
    #[error("{0}")]
    Violation(String),
    #[error(transparent)]
    Storage(ProtocolError),
    #[error("{0}")]
    Internal(String),
}

/// Failures of the submission flow.
#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("{0}")]
    Violation(String),
    #[error("{0}")]
    Integrity(String),
    #[error("unregistered or inactive sensor")]
    Unregistered,
    #[error("invalid sensor signature or no matching active sensor")]
    InvalidSignature,
    #[error("device session error: {0}")]
    Session(SessionError),
    #[error(transparent)]
    Storage(ProtocolError),
}

pub struct CollectorServer {
    pub config: Config,
    pub directory: Arc<dyn SensorDirectory>,
    pub resolver: Arc<IdentityResolver>,
    pub challenges: Arc<ChallengeAuthority>,
    pub sessions: SessionStore,
    pub replay: Arc<ReplayGuard>,
    pub publisher: Arc<ProvisioningPublisher>,
    pub readings: Arc<dyn ReadingSink>,
    pub pending_keys: Arc<GuardedMap<String>>,
    server_key: Arc<RsaPrivateKey>,
}

impl CollectorServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        directory: Arc<dyn SensorDirectory>,
        sessions: SessionStore,
        replay: Arc<ReplayGuard>,
        publisher: Arc<ProvisioningPublisher>,
        readings: Arc<dyn ReadingSink>,
        pending_keys: Arc<GuardedMap<String>>,
        server_key: RsaPrivateKey,
    ) -> Self {
        let challenges = Arc::new(ChallengeAuthority::new(config.challenge_ttl_seconds));
        let resolver = Arc::new(IdentityResolver::new(directory.clone()));
        Self {
            config,
            directory,
            resolver,
            challenges,
            sessions,
            replay,
            publisher,
            readings,
            pending_keys,
            server_key: Arc::new(server_key),
        }
    }

    async fn active_rows(&self, device_id: &str) -> Result<Vec<SensorIdentity>> {
        Ok(self
            .directory
            .list_by_device_id(device_id)
            .await?
            .into_iter()
            .filter(|row| row.status == IdentityStatus::Active)
            .collect())
    }

    /// `GET session/request` flow: refuse unknown/inactive devices, then
    /// mint a challenge.
    pub async fn issue_challenge(
        &self,
        device_id: &str,
    ) -> std::result::Result<DeviceChallenge, EstablishError> {
        let rows = self
            .active_rows(device_id)
            .await
            .map_err(EstablishError::Storage)?;
        if rows.is_empty() {
            return Err(EstablishError::UnknownDevice);
        }
        Ok(self.challenges.issue(device_id))
    }

    /// `POST session/establish` flow: consume the challenge exactly once,
    /// resolve which tenant's key signed it, then mint the session.
    pub async fn establish_session(
        &self,
        device_id: &str,
        challenge_id: &str,
        signature_b64: &str,
    ) -> std::result::Result<DeviceSession, EstablishError> {
        let rows = self
            .active_rows(device_id)
            .await
            .map_err(EstablishError::Storage)?;
        if rows.is_empty() {
            return Err(EstablishError::UnknownDevice);
        }

        let secret = match self.challenges.consume(challenge_id, device_id) {
            Ok(secret) => secret,
            Err(ChallengeError::Expired) => return Err(EstablishError::ChallengeExpired),
            Err(ChallengeError::NotFound) | Err(ChallengeError::DeviceMismatch) => {
                return Err(EstablishError::InvalidChallenge)
            }
        };

        let signature = base64::decode(signature_b64)
            .map_err(|_| EstablishError::Violation("signature is not valid base64".to_string()))?;

        match self
            .resolver
            .resolve_by_signature(device_id, secret.as_bytes(), &signature)
            .await
        {
            Ok(identity) => {
                info!(
                    "Session establish: signature verified for {} (tenant {})",
                    device_id, identity.tenant_id
                );
            }
            Err(ResolveError::NoActiveSensor) => return Err(EstablishError::UnknownDevice),
            Err(ResolveError::NoMatch) => return Err(EstablishError::InvalidSignature),
            Err(ResolveError::Storage(e)) => return Err(EstablishError::Storage(e)),
        }

        match self.sessions.establish(device_id).await {
            Ok(session) => Ok(session),
            Err(SessionError::Storage(e)) => Err(EstablishError::Storage(e)),
            Err(e) => Err(EstablishError::Internal(e.to_string())),
        }
    }

    /// `POST /submit-data` flow. Verification order matters: envelope open,
    /// content hash, signature resolution, payload cross-checks, session.
    /// Nothing is written until every check passes.
    pub async fn process_submission(
        &self,
        submission: &SignedSubmission,
    ) -> std::result::Result<SensorIdentity, SubmissionError> {
        if submission.sensor_id.trim().is_empty() || submission.signature.trim().is_empty() {
            return Err(SubmissionError::Violation(
                "sensor_id and signature are required".to_string(),
            ));
        }

        let plaintext = envelope::open_raw(&submission.envelope, &self.server_key)
            .map_err(|e| SubmissionError::Integrity(e.to_string()))?;
        let value: serde_json::Value = serde_json::from_slice(&plaintext)
            .map_err(|e| SubmissionError::Violation(format!("undecodable plaintext: {}", e)))?;

        let canonical = envelope::canonical_bytes(&value)
            .map_err(|e| SubmissionError::Violation(e.to_string()))?;
        if envelope::content_hash(&canonical) != submission.sha256 {
            return Err(SubmissionError::Integrity(
                "SHA-256 hash mismatch, data integrity compromised".to_string(),
            ));
        }

        let signature = base64::decode(&submission.signature)
            .map_err(|_| SubmissionError::Violation("signature is not valid base64".to_string()))?;
        let identity = match self
            .resolver
            .resolve_by_signature(&submission.sensor_id, &canonical, &signature)
            .await
        {
            Ok(identity) => identity,
            Err(ResolveError::NoActiveSensor) => return Err(SubmissionError::Unregistered),
            Err(ResolveError::NoMatch) => return Err(SubmissionError::InvalidSignature),
            Err(ResolveError::Storage(e)) => return Err(SubmissionError::Storage(e)),
        };

        let reading: SensorReading = serde_json::from_value(value)
            .map_err(|e| SubmissionError::Violation(format!("malformed reading: {}", e)))?;
        if !reading.device_id.eq_ignore_ascii_case(&submission.sensor_id) {
            return Err(SubmissionError::Violation(
                "device_id in payload does not match sensor_id".to_string(),
            ));
        }
        if let Some(device_type) = &reading.device_type {
            if !identity.device_type.is_empty()
                && !device_type.eq_ignore_ascii_case(&identity.device_type)
            {
                return Err(SubmissionError::Violation(
                    "device_type mismatch for sensor".to_string(),
                ));
            }
        }

        let counter = match &reading.counter {
            None => None,
            Some(value) => Some(parse_counter(value).map_err(SubmissionError::Session)?),
        };
        let token = reading.session_token.as_deref();
        if self.config.require_device_session {
            self.sessions
                .validate(token, &submission.sensor_id, counter)
                .await
                .map_err(|e| match e {
                    SessionError::Storage(inner) => SubmissionError::Storage(inner),
                    other => SubmissionError::Session(other),
                })?;
        } else if token.is_some() {
            // Sessions optional but offered: keep the counter moving, log
            // failures without rejecting.
            if let Err(e) = self
                .sessions
                .validate(token, &submission.sensor_id, counter)
                .await
            {
                warn!(
                    "Device session warning for {}: {} (continuing)",
                    submission.sensor_id,
                    e.reason()
                );
            }
        }

        self.readings
            .store(&identity, &reading)
            .await
            .map_err(SubmissionError::Storage)?;
        Ok(identity)
    }

    pub async fn check_storage(&self) -> Result<()> {
        self.sessions.backing().ping().await
    }

    /// Bind the HTTP API and run it next to the periodic expiry sweeper.
    pub async fn start(&self) -> Result<()> {
        let server_data = web::Data::new(self.clone());
        info!("Starting HTTP server on {}", self.config.bind_address);

        let http_server = HttpServer::new(move || {
            App::new()
                .app_data(server_data.clone())
                .service(
                    web::scope("/api")
                        .service(
                            web::resource("/device/session/request")
                                .route(web::get().to(handlers::session_request)),
                        )
                        .service(
                            web::resource("/device/session/establish")
                                .route(web::post().to(handlers::session_establish)),
                        )
                        .service(
                            web::resource("/provision/request")
                                .route(web::post().to(handlers::provision_request)),
                        )
                        .service(web::resource("/status").to(handlers::get_status)),
                )
                .service(web::resource("/submit-data").route(web::post().to(handlers::submit_data)))
                .wrap(
                    actix_cors::Cors::default()
                        .allow_any_origin()
                        .allow_any_method()
                        .allow_any_header(),
                )
        })
        .bind(&self.config.bind_address)?;

        let server_handle = http_server.run();

        let sweeper_handle = {
            let server = self.clone();
            tokio::spawn(async move {
                server.run_sweeper().await;
            })
        };

        tokio::select! {
            result = server_handle => {
                info!("HTTP server stopped: {:?}", result);
            }
            _ = sweeper_handle => {
                info!("Expiry sweeper stopped");
            }
        }
        Ok(())
    }

    /// Expired challenges and sessions are rejected lazily on access; this
    /// loop bounds the memory of both tables in between.
    async fn run_sweeper(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECONDS));
        loop {
            interval.tick().await;
            let challenges = self.challenges.sweep();
            let pending = self.pending_keys.sweep();
            match self.sessions.sweep().await {
                Ok(sessions) => {
                    if challenges + sessions + pending > 0 {
                        info!(
                            "Sweeper removed {} challenges, {} sessions, {} pending keys",
                            challenges, sessions, pending
                        );
                    }
                }
                Err(e) => error!("Session sweep failed: {}", e),
            }
        }
    }
}

fn parse_counter(value: &serde_json::Value) -> std::result::Result<u64, SessionError> {
    if let Some(counter) = value.as_u64() {
        return Ok(counter);
    }
    if let Some(text) = value.as_str() {
        if let Ok(counter) = text.parse() {
            return Ok(counter);
        }
    }
    Err(SessionError::CounterInvalid)
}

impl Clone for CollectorServer {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            directory: Arc::clone(&self.directory),
            resolver: Arc::clone(&self.resolver),
            challenges: Arc::clone(&self.challenges),
            sessions: self.sessions.clone(),
            replay: Arc::clone(&self.replay),
            publisher: Arc::clone(&self.publisher),
            readings: Arc::clone(&self.readings),
            pending_keys: Arc::clone(&self.pending_keys),
            server_key: Arc::clone(&self.server_key),
        }
    }
}
