use axum::http::StatusCode;
use thiserror::Error;

use krelay_core::classify::ErrorKind;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("All credentials are rate limited or unavailable")]
    NoCredentials,

    #[error("{0}")]
    BadRequest(String),

    #[error("{message}")]
    Upstream {
        status: u16,
        kind: ErrorKind,
        message: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status carried to the inbound client; the body shape is
    /// dialect-specific and built by each handler.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::NoCredentials => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Dialect-A error type string.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::NoCredentials => "overloaded_error",
            Self::BadRequest(_) => "invalid_request_error",
            Self::Upstream { kind, .. } => match kind {
                ErrorKind::RateLimited => "rate_limit_error",
                ErrorKind::AuthFailed => "authentication_error",
                ErrorKind::AccountSuspended => "permission_error",
                ErrorKind::ContentTooLong => "invalid_request_error",
                _ => "api_error",
            },
            Self::Internal(_) => "api_error",
        }
    }
}

impl From<krelay_translate::error::TranslateError> for GatewayError {
    fn from(e: krelay_translate::error::TranslateError) -> Self {
        GatewayError::BadRequest(e.to_string())
    }
}
