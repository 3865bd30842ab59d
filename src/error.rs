//! Capture error taxonomy
//!
//! Validation errors are returned synchronously by the call that would start a
//! session. Every other variant is discovered asynchronously and reaches the
//! caller through the session status and the per-stream stopped notification.

use thiserror::Error;

pub const ERROR_DOMAIN: &str = "screenstream";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Invalid configuration: {reason}")]
    Validation { reason: String },

    #[error("Display {display_id} not found")]
    ResourceNotFound { display_id: u32 },

    #[error("Capture source rejected start: {reason}")]
    SourceStartFailure { reason: String },

    #[error("Capture stream terminated unexpectedly: {reason}")]
    SourceRuntimeFault { reason: String },

    #[error("Unknown capture error: {reason}")]
    Unknown { reason: String },
}

impl CaptureError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn start_failure(reason: impl Into<String>) -> Self {
        Self::SourceStartFailure {
            reason: reason.into(),
        }
    }

    pub fn runtime_fault(reason: impl Into<String>) -> Self {
        Self::SourceRuntimeFault {
            reason: reason.into(),
        }
    }

    pub fn unknown(reason: impl Into<String>) -> Self {
        Self::Unknown {
            reason: reason.into(),
        }
    }

    /// Stable numeric code used at the foreign-function boundary.
    pub fn code(&self) -> i32 {
        match self {
            CaptureError::Validation { .. } => 1,
            CaptureError::ResourceNotFound { .. } => 2,
            CaptureError::SourceStartFailure { .. } => 3,
            CaptureError::SourceRuntimeFault { .. } => 4,
            CaptureError::Unknown { .. } => 5,
        }
    }

    /// Owned `{code, domain, description}` record for the boundary layer.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code(),
            domain: ERROR_DOMAIN.to_string(),
            description: self.to_string(),
        }
    }
}

/// Error record handed across the boundary to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub code: i32,
    pub domain: String,
    pub description: String,
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.domain, self.code, self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_error_report() {
        let err = CaptureError::ResourceNotFound { display_id: 7 };
        let report = err.report();

        assert_eq!(report.code, 2);
        assert_eq!(report.domain, ERROR_DOMAIN);
        assert_eq!(report.description, "Display 7 not found");
        assert_eq!(report.to_string(), "[screenstream:2] Display 7 not found");
    }

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            CaptureError::validation("x"),
            CaptureError::ResourceNotFound { display_id: 0 },
            CaptureError::start_failure("x"),
            CaptureError::runtime_fault("x"),
            CaptureError::unknown("x"),
        ];
        let codes: HashSet<i32> = errors.iter().map(|e| e.code()).collect();
        assert_eq!(codes.len(), errors.len());
    }
}
