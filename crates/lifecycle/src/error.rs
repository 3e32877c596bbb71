//! Error types for certificate lifecycle operations

use std::time::Duration;

use certwarden_common::{CertificateId, CertificateStatus, DomainNameError, ProviderKind};
use thiserror::Error;

/// Errors surfaced by lifecycle operations
///
/// Every variant that originates in an adapter or the challenge server
/// carries the domain it concerns.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Pre-flight or challenge probe got no HTTP response
    #[error("Domain {domain} is unreachable over HTTP: {reason}")]
    DomainUnreachable { domain: String, reason: String },

    /// Challenge probe got a response whose body differs from the token
    #[error("Ownership validation failed for {domain}: served content did not match the challenge token")]
    ValidationMismatch { domain: String },

    /// The authority rejected the request, or the provider cannot issue
    #[error("Issuance failed for {domain}: {reason}")]
    Issuance { domain: String, reason: String },

    /// Uploaded or returned material did not parse or does not fit the domain
    #[error("Malformed certificate material: {0}")]
    MalformedMaterial(String),

    #[error("Another operation is in progress for {domain}")]
    OperationInProgress { domain: String },

    /// Upstream revocation failed; local state was still revoked
    #[error("Upstream revocation failed for {domain}: {reason}")]
    Revocation { domain: String, reason: String },

    #[error("Operation for {domain} timed out after {after:?}")]
    OperationTimedOut { domain: String, after: Duration },

    #[error("Provider {0} is not configured")]
    ProviderUnavailable(ProviderKind),

    #[error("Certificate {0} not found")]
    NotFound(CertificateId),

    #[error("Certificate {id} is {status}; operation requires {required}")]
    InvalidState {
        id: CertificateId,
        status: CertificateStatus,
        required: CertificateStatus,
    },

    #[error("Invalid domain: {0}")]
    InvalidDomain(#[from] DomainNameError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LifecycleError {
    /// Whether retrying the same request later may succeed without
    /// anyone changing anything
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LifecycleError::DomainUnreachable { .. }
                | LifecycleError::OperationInProgress { .. }
                | LifecycleError::OperationTimedOut { .. }
        )
    }

    pub fn issuance(domain: impl ToString, reason: impl ToString) -> Self {
        LifecycleError::Issuance {
            domain: domain.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        LifecycleError::MalformedMaterial(reason.into())
    }
}

/// Certificate record store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record {0} not found")]
    NotFound(CertificateId),

    #[error("Record {0} already exists")]
    Duplicate(CertificateId),

    /// Compare-and-swap found a different status than expected
    #[error("Record {id} changed concurrently: expected status {expected}, found {actual}")]
    Conflict {
        id: CertificateId,
        expected: CertificateStatus,
        actual: CertificateStatus,
    },

    #[error("Record store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Installed material and account storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let unreachable = LifecycleError::DomainUnreachable {
            domain: "example.com".into(),
            reason: "connection refused".into(),
        };
        assert!(unreachable.is_retryable());

        let busy = LifecycleError::OperationInProgress {
            domain: "example.com".into(),
        };
        assert!(busy.is_retryable());

        let mismatch = LifecycleError::ValidationMismatch {
            domain: "example.com".into(),
        };
        assert!(!mismatch.is_retryable());

        assert!(!LifecycleError::issuance("example.com", "rate limited").is_retryable());
        assert!(!LifecycleError::malformed("bad pem").is_retryable());
    }

    #[test]
    fn test_messages_carry_domain() {
        let err = LifecycleError::issuance("example.com", "badCSR");
        assert_eq!(err.to_string(), "Issuance failed for example.com: badCSR");

        let err = LifecycleError::Revocation {
            domain: "example.com".into(),
            reason: "unauthorized".into(),
        };
        assert!(err.to_string().contains("example.com"));
    }

    #[test]
    fn test_store_error_wraps_transparently() {
        let id = CertificateId::new();
        let err: LifecycleError = StoreError::NotFound(id).into();
        assert_eq!(err.to_string(), format!("Record {} not found", id));
    }
}
