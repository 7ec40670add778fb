use thiserror::Error;

/// Errors raised while running an external or local transform
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Invalid transform input: {0}")]
    InvalidInput(String),

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Missing metadata: {0}")]
    MissingMetadata(String),

    #[error("{service} returned an error: {message}")]
    Service { service: String, message: String },

    #[error("Malformed response from {service}: {message}")]
    MalformedResponse { service: String, message: String },

    #[error("{service} job {job_id} failed: {reason}")]
    JobFailed {
        service: String,
        job_id: String,
        reason: String,
    },

    #[error("{service} job {job_id} did not finish: {reason}")]
    PollExhausted {
        service: String,
        job_id: String,
        reason: String,
    },

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TransformError {
    pub fn service(service: &str, message: impl Into<String>) -> Self {
        TransformError::Service {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn malformed(service: &str, message: impl Into<String>) -> Self {
        TransformError::MalformedResponse {
            service: service.to_string(),
            message: message.into(),
        }
    }

    /// Check if the error was caused by the caller's input rather than the provider
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            TransformError::InvalidInput(_)
                | TransformError::UnsupportedFormat(_)
                | TransformError::MissingMetadata(_)
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            TransformError::InvalidInput(_)
            | TransformError::UnsupportedFormat(_)
            | TransformError::MissingMetadata(_) => "VALIDATION_FAILED",
            TransformError::NotConfigured(_) => "NOT_CONFIGURED",
            _ => "TRANSFORM_FAILED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_metadata() {
        let err = TransformError::MissingMetadata("person 7 has no age".to_string());
        assert_eq!(err.to_string(), "Missing metadata: person 7 has no age");
        assert!(err.is_input_error());
        assert_eq!(err.error_code(), "VALIDATION_FAILED");
    }

    #[test]
    fn test_job_failed() {
        let err = TransformError::JobFailed {
            service: "replicate".to_string(),
            job_id: "abc".to_string(),
            reason: "out of memory".to_string(),
        };
        assert_eq!(err.to_string(), "replicate job abc failed: out of memory");
        assert!(!err.is_input_error());
        assert_eq!(err.error_code(), "TRANSFORM_FAILED");
    }
}
