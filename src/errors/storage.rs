use thiserror::Error;

/// Errors raised by object storage backends
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object '{0}' not found")]
    NotFound(String),

    #[error("Object '{0}' already exists")]
    AlreadyExists(String),

    #[error("Invalid object key '{0}'")]
    InvalidKey(String),

    #[error("Signed URL rejected: {0}")]
    SignatureRejected(String),

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("Storage I/O error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(err.to_string()),
            std::io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(err.to_string()),
            _ => StorageError::Io(err),
        }
    }
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Io(_))
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            StorageError::NotFound(_) => "NOT_FOUND",
            StorageError::AlreadyExists(_) => "CONFLICT",
            StorageError::InvalidKey(_) => "VALIDATION_FAILED",
            StorageError::SignatureRejected(_) => "FORBIDDEN",
            StorageError::Unavailable(_) | StorageError::Io(_) => "STORAGE_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err: StorageError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_not_found());
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[test]
    fn test_io_other_is_transient() {
        let err: StorageError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(err.is_transient());
        assert_eq!(err.error_code(), "STORAGE_ERROR");
    }

    #[test]
    fn test_already_exists() {
        let err = StorageError::AlreadyExists("1/abc.png".to_string());
        assert_eq!(err.to_string(), "Object '1/abc.png' already exists");
        assert_eq!(err.error_code(), "CONFLICT");
    }
}
