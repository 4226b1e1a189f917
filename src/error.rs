use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request not OK: {status}: body: {body}")]
    Remote {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Query job not found: {0}")]
    JobNotFound(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    /// Errors that end the process even when per-job failures are isolated:
    /// the service is unreachable or refuses the credential.
    pub fn is_service_fatal(&self) -> bool {
        match self {
            ExporterError::Transport(_) => true,
            ExporterError::Remote { status, .. } => {
                *status == reqwest::StatusCode::UNAUTHORIZED
                    || *status == reqwest::StatusCode::FORBIDDEN
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ExporterError {
    fn from(err: reqwest::Error) -> Self {
        ExporterError::Transport(err.to_string())
    }
}

impl From<prometheus::Error> for ExporterError {
    fn from(err: prometheus::Error) -> Self {
        ExporterError::Metrics(err.to_string())
    }
}

impl From<serde_yaml::Error> for ExporterError {
    fn from(err: serde_yaml::Error) -> Self {
        ExporterError::Configuration(err.to_string())
    }
}

impl IntoResponse for ExporterError {
    fn into_response(self) -> Response {
        let status = match self {
            ExporterError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ExporterError::Transport(_) | ExporterError::Remote { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ExporterError>;
