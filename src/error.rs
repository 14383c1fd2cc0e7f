//! Error types for the OIDC pipeline

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Format error: {0}")]
    Format(#[from] serde_json::Error),

    /// Redemption of a correlation key that is absent, expired or already used
    #[error("OIDC capture not found")]
    CaptureNotFound,

    #[error("OIDC discovery failed: {0}")]
    Discovery(String),

    #[error("Token error: {0}")]
    Token(String),

    #[error("OIDC callback error: {0}")]
    Callback(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP middleware error: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// HTTP status reported to API callers for this failure
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::CaptureNotFound => StatusCode::NOT_FOUND,
            PipelineError::Callback(_) | PipelineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PipelineError::Auth(_) => StatusCode::UNAUTHORIZED,
            PipelineError::Discovery(_)
            | PipelineError::Token(_)
            | PipelineError::Http(_)
            | PipelineError::Middleware(_) => StatusCode::BAD_GATEWAY,
            PipelineError::Config(_)
            | PipelineError::Server(_)
            | PipelineError::Format(_)
            | PipelineError::Io(_)
            | PipelineError::UrlParse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::warn!("Request rejected: {}", self);
        }
        // Internal details stay in the log
        let body = match status {
            StatusCode::INTERNAL_SERVER_ERROR => "Internal server error".to_string(),
            _ => self.to_string(),
        };
        (status, body).into_response()
    }
}
