//! API error handling with structured responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::orchestrator::ProcessError;
use crate::pool::PoolError;

/// API error type mapped onto the worker's externally visible failure
/// taxonomy.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    /// Pool warming or failure ceiling exceeded.
    #[error("{0}")]
    ServiceUnavailable(String),

    /// Orchestration failed downstream of request validation.
    #[error("process error: {0}")]
    BadGateway(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::BadGateway(_) => "BAD_GATEWAY",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) | ApiError::BadGateway(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            ApiError::ServiceUnavailable(msg) => {
                warn!(error_code = code, message = %msg, "Service unavailable");
            }
            ApiError::BadRequest(msg) => {
                debug!(error_code = code, message = %msg, "Client error");
            }
        }

        let body = ErrorResponse {
            error: message,
            code,
        };
        (status, Json(body)).into_response()
    }
}

/// An unhealthy or exhausted pool is a capacity signal; everything else the
/// orchestrator raises is a gateway failure.
impl From<ProcessError> for ApiError {
    fn from(err: ProcessError) -> Self {
        match &err {
            ProcessError::Pool(PoolError::Unhealthy(_)) => {
                ApiError::ServiceUnavailable(err.to_string())
            }
            _ => ApiError::BadGateway(err.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
