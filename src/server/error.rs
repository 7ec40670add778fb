use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::error;

use crate::errors::{LedgerError, StorageError, TransformError};

/// Maps ledger errors onto HTTP responses
#[derive(Debug)]
pub struct ApiError(pub LedgerError);

impl<E> From<E> for ApiError
where
    E: Into<LedgerError>,
{
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            err if err.is_not_found() => StatusCode::NOT_FOUND,
            LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
            LedgerError::InvalidState(_) => StatusCode::CONFLICT,
            LedgerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            LedgerError::Storage(StorageError::SignatureRejected(_)) => StatusCode::FORBIDDEN,
            LedgerError::Storage(StorageError::InvalidKey(_)) => StatusCode::BAD_REQUEST,
            LedgerError::Storage(StorageError::AlreadyExists(_)) => StatusCode::CONFLICT,
            LedgerError::Storage(StorageError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::Transform(TransformError::NotConfigured(_)) => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::Transform(err) if err.is_input_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = Json(json!({
            "error": self.0.error_code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
