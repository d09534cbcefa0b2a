use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Top-level failure taxonomy shared by the collector and the device agent.
///
/// Handlers usually answer with an explicit status code; this mapping is the
/// fallback used when an error bubbles out of a handler unannotated.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),
    #[error("Replay rejected: {0}")]
    ReplayRejected(String),
    #[error("Integrity failure: {0}")]
    IntegrityFailure(String),
    #[error("Storage error: {0}")]
    StorageTransient(String),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Bus error: {0}")]
    BusError(String),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::InternalError(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::ProtocolViolation(err.to_string())
    }
}

impl ResponseError for ProtocolError {
    fn error_response(&self) -> HttpResponse {
        match self {
            Self::AuthenticationFailure(_) => HttpResponse::Forbidden().json(self.to_string()),
            Self::IntegrityFailure(_) | Self::ProtocolViolation(_) | Self::ReplayRejected(_) => {
                HttpResponse::BadRequest().json(self.to_string())
            }
            // Transient storage trouble is retryable at the edge; everything
            // else is a server-side defect.
            Self::StorageTransient(_) => HttpResponse::ServiceUnavailable().json(self.to_string()),
            Self::NetworkError(_) | Self::BusError(_) | Self::InternalError(_) => {
                HttpResponse::InternalServerError().json(self.to_string())
            }
        }
    }
}
