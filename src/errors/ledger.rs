use std::time::Duration;

use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;

use super::{StorageError, TransformError};
use crate::derivation::FailureKind;

/// Errors raised by the ledger services
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Asset {0} not found")]
    AssetNotFound(Uuid),

    #[error("Derivation {0} not found")]
    DerivationNotFound(Uuid),

    #[error("Person {0} not found")]
    PersonNotFound(i32),

    #[error("Training run {0} not found")]
    TrainingRunNotFound(Uuid),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timeout: transform exceeded {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

impl LedgerError {
    pub fn is_not_found(&self) -> bool {
        match self {
            LedgerError::AssetNotFound(_)
            | LedgerError::DerivationNotFound(_)
            | LedgerError::PersonNotFound(_)
            | LedgerError::TrainingRunNotFound(_) => true,
            LedgerError::Storage(err) => err.is_not_found(),
            _ => false,
        }
    }

    /// Check if this error should be reported to the caller as a bad request
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            LedgerError::Validation(_) | LedgerError::InvalidState(_)
        ) || matches!(
            self,
            LedgerError::Storage(StorageError::InvalidKey(_) | StorageError::SignatureRejected(_))
        )
    }

    /// Failure kind recorded on a derivation that stopped with this error,
    /// None when the error is not attributable to the derivation itself
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            LedgerError::Storage(_) => Some(FailureKind::Storage),
            LedgerError::Transform(_) => Some(FailureKind::Transform),
            LedgerError::Timeout(_) => Some(FailureKind::Timeout),
            _ => None,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::AssetNotFound(_)
            | LedgerError::DerivationNotFound(_)
            | LedgerError::PersonNotFound(_)
            | LedgerError::TrainingRunNotFound(_) => "NOT_FOUND",
            LedgerError::Validation(_) => "VALIDATION_FAILED",
            LedgerError::InvalidState(_) => "CONFLICT",
            LedgerError::Timeout(_) => "TIMEOUT",
            LedgerError::Storage(err) => err.error_code(),
            LedgerError::Transform(err) => err.error_code(),
            LedgerError::Database(_) => "DATABASE_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_not_found() {
        let id = Uuid::nil();
        let err = LedgerError::AssetNotFound(id);
        assert_eq!(err.to_string(), format!("Asset {} not found", id));
        assert!(err.is_not_found());
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[test]
    fn test_timeout_message() {
        let err = LedgerError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "Timeout: transform exceeded 30s");
        assert_eq!(err.failure_kind(), Some(FailureKind::Timeout));
    }

    #[test]
    fn test_failure_kinds() {
        let storage = LedgerError::from(StorageError::Unavailable("bucket".to_string()));
        assert_eq!(storage.failure_kind(), Some(FailureKind::Storage));

        let transform = LedgerError::from(TransformError::InvalidInput("crop".to_string()));
        assert_eq!(transform.failure_kind(), Some(FailureKind::Transform));

        assert_eq!(LedgerError::Validation("x".to_string()).failure_kind(), None);
    }

    #[test]
    fn test_client_errors() {
        assert!(LedgerError::InvalidState("complete".to_string()).is_client_error());
        assert!(!LedgerError::Database(DbErr::Custom("boom".to_string())).is_client_error());
    }
}
