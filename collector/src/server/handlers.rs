//! HTTP request handlers for the collector API.
//!
//! Thin adapters: field validation and status-code mapping live here, the
//! protocol flows live on [`CollectorServer`].

use actix_web::{web, HttpResponse};
use chrono::Utc;
use common::SignedSubmission;
use log::{error, info};
use serde::Deserialize;
use serde_json::json;

use super::{CollectorServer, EstablishError, SubmissionError};
use crate::provision::ProvisionDispatch;

const MAX_DEVICE_ID_LEN: usize = 64;
const MAX_CHALLENGE_ID_LEN: usize = 200;
const MAX_SIGNATURE_LEN: usize = 2000;

fn validate_device_id(device_id: &str) -> Option<&'static str> {
    if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
        return Some("Invalid device_id.");
    }
    if !device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Some("Invalid device_id.");
    }
    None
}

fn error_body(message: &str) -> serde_json::Value {
    json!({ "error": message })
}

#[derive(Debug, Deserialize)]
pub struct SessionRequestQuery {
    #[serde(default)]
    pub device_id: String,
}

pub async fn session_request(
    query: web::Query<SessionRequestQuery>,
    server: web::Data<CollectorServer>,
) -> HttpResponse {
    let device_id = query.device_id.trim();
    if let Some(message) = validate_device_id(device_id) {
        return HttpResponse::BadRequest().json(error_body(message));
    }

    match server.issue_challenge(device_id).await {
        Ok(challenge) => HttpResponse::Ok().json(json!({
            "challenge_id": challenge.challenge_id,
            "challenge": challenge.challenge_secret,
            "expires_in_seconds": server.challenges.ttl_seconds(),
        })),
        Err(EstablishError::UnknownDevice) => {
            HttpResponse::Forbidden().json(error_body("device not active or not found"))
        }
        Err(EstablishError::Storage(e)) => {
            error!("Session request storage error for {}: {}", device_id, e);
            HttpResponse::ServiceUnavailable().json(error_body("storage unavailable"))
        }
        Err(e) => {
            error!("Session request failed for {}: {}", device_id, e);
            HttpResponse::InternalServerError().json(error_body("internal server error"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EstablishRequest {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub challenge_id: String,
    #[serde(default)]
    pub signature: String,
}

pub async fn session_establish(
    body: web::Json<EstablishRequest>,
    server: web::Data<CollectorServer>,
) -> HttpResponse {
    let device_id = body.device_id.trim();
    if let Some(message) = validate_device_id(device_id) {
        return HttpResponse::BadRequest().json(error_body(message));
    }
    let challenge_id = body.challenge_id.trim();
    if challenge_id.is_empty() || challenge_id.len() > MAX_CHALLENGE_ID_LEN {
        return HttpResponse::BadRequest().json(error_body("Invalid challenge_id."));
    }
    let signature = body.signature.trim();
    if signature.is_empty() || signature.len() > MAX_SIGNATURE_LEN {
        return HttpResponse::BadRequest().json(error_body("Invalid signature."));
    }

    match server
        .establish_session(device_id, challenge_id, signature)
        .await
    {
        Ok(session) => HttpResponse::Ok().json(json!({
            "session_token": session.session_token,
            "device_id": session.device_id,
            "expires_in_seconds": server.sessions.ttl_seconds(),
        })),
        Err(EstablishError::UnknownDevice) => {
            HttpResponse::Forbidden().json(error_body("device not active or not found"))
        }
        Err(EstablishError::InvalidChallenge) => {
            HttpResponse::BadRequest().json(error_body("invalid challenge"))
        }
        Err(EstablishError::ChallengeExpired) => {
            HttpResponse::Gone().json(error_body("challenge expired"))
        }
        Err(EstablishError::InvalidSignature) => HttpResponse::BadRequest().json(error_body(
            "invalid signature or no matching active sensor found",
        )),
        Err(EstablishError::Violation(message)) => {
            HttpResponse::BadRequest().json(error_body(&message))
        }
        Err(EstablishError::Storage(e)) => {
            error!("Session establish storage error for {}: {}", device_id, e);
            HttpResponse::ServiceUnavailable().json(error_body("storage unavailable"))
        }
        Err(EstablishError::Internal(message)) => {
            error!("Session establish failed for {}: {}", device_id, message);
            HttpResponse::InternalServerError().json(error_body(&message))
        }
    }
}

pub async fn submit_data(
    body: web::Json<SignedSubmission>,
    server: web::Data<CollectorServer>,
) -> HttpResponse {
    let submission = body.into_inner();
    info!("Received encrypted submission from sensor {}", submission.sensor_id);

    match server.process_submission(&submission).await {
        Ok(identity) => HttpResponse::Ok().json(json!({
            "status": "success",
            "device_id": identity.device_id,
        })),
        Err(SubmissionError::Violation(message)) => HttpResponse::BadRequest().json(json!({
            "status": "error",
            "message": message,
        })),
        Err(SubmissionError::Integrity(message)) => HttpResponse::BadRequest().json(json!({
            "status": "error",
            "message": message,
        })),
        Err(SubmissionError::Unregistered) => HttpResponse::Forbidden().json(json!({
            "status": "error",
            "message": format!("Unregistered sensor_id '{}'.", submission.sensor_id),
        })),
        Err(SubmissionError::InvalidSignature) => HttpResponse::BadRequest().json(json!({
            "status": "error",
            "message": "Invalid sensor signature or no matching active sensor found.",
        })),
        Err(SubmissionError::Session(reason)) => HttpResponse::Unauthorized().json(json!({
            "status": "error",
            "message": format!("Device session error: {}", reason.reason()),
        })),
        Err(SubmissionError::Storage(e)) => {
            error!(
                "Submission storage error for {}: {}",
                submission.sensor_id, e
            );
            HttpResponse::ServiceUnavailable().json(json!({
                "status": "error",
                "message": "storage unavailable",
            }))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub user_id: String,
}

pub async fn provision_request(
    body: web::Json<ProvisionRequest>,
    server: web::Data<CollectorServer>,
) -> HttpResponse {
    let device_id = body.device_id.trim();
    if let Some(message) = validate_device_id(device_id) {
        return HttpResponse::BadRequest().json(error_body(message));
    }
    let tenant_id = body.user_id.trim();
    if tenant_id.is_empty() {
        return HttpResponse::BadRequest().json(error_body("user_id is required"));
    }

    match server.publisher.request_provisioning(device_id, tenant_id).await {
        Ok(ProvisionDispatch::Sent { topic }) => HttpResponse::Ok().json(json!({
            "status": "sent",
            "topic": topic,
            "user_id": tenant_id,
        })),
        Ok(ProvisionDispatch::Skipped) => HttpResponse::Ok().json(json!({
            "status": "skipped",
            "reason": "duplicate_request",
            "device_id": device_id,
        })),
        Err(e) => {
            error!("Provision request failed for {}: {}", device_id, e);
            HttpResponse::InternalServerError()
                .json(error_body(&format!("provision publish failed: {}", e)))
        }
    }
}

pub async fn get_status(server: web::Data<CollectorServer>) -> HttpResponse {
    match server.check_storage().await {
        Ok(()) => HttpResponse::Ok().json(json!({
            "status": "ok",
            "timestamp": Utc::now().timestamp(),
            "services": {
                "storage": "healthy",
                "server": "healthy",
            }
        })),
        Err(_) => HttpResponse::Ok().json(json!({
            "status": "error",
            "timestamp": Utc::now().timestamp(),
            "services": {
                "storage": "unhealthy",
                "server": "healthy",
            }
        })),
    }
}
