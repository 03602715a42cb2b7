//! Error types for vizbroker

use thiserror::Error;
use uuid::Uuid;

/// Main error type for vizbroker
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Structural or type error in a request
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// A request names a resource the broker does not manage
    #[error("Unknown resource: {0}")]
    ResourceUnknown(String),

    /// The resource lives on a host that cannot be used right now
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The resource is in use, or in an incompatible sharing mode
    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    /// Not enough free resources to satisfy the request
    #[error("Unsatisfiable request: {0}")]
    Unsatisfiable(String),

    /// Matcher defect: a condition ruled out by validation happened anyway
    #[error("Internal error: {0}")]
    Internal(String),

    /// Execution backend failed to provide a launcher
    #[error("Backend error: {0}")]
    Backend(String),

    /// Allocation not found
    #[error("Allocation not found: {0}")]
    AllocationNotFound(Uuid),

    /// User does not own the resource
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BrokerError {
    /// True for failures that indicate a bug in the allocator rather than a bad request
    pub fn is_internal(&self) -> bool {
        matches!(self, BrokerError::Internal(_))
    }
}

/// Result type for vizbroker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BrokerError {
    fn from(err: toml::de::Error) -> Self {
        BrokerError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BrokerError::ResourceBusy("GPU-0 at host node1".to_string());
        assert_eq!(err.to_string(), "Resource busy: GPU-0 at host node1");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BrokerError = io_err.into();
        assert!(matches!(err, BrokerError::Io(_)));
    }

    #[test]
    fn test_internal_is_distinguishable() {
        assert!(BrokerError::Internal("class list exhausted".to_string()).is_internal());
        assert!(!BrokerError::Unsatisfiable("no GPU".to_string()).is_internal());
    }
}
