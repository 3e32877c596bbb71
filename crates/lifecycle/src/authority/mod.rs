//! Remote certificate authorities
//!
//! The CA-backed provider reaches its signer through the narrow
//! [`CertificateAuthority`] trait. [`AcmeAuthority`] speaks ACME via
//! `instant-acme`; tests substitute scripted authorities.

mod acme;

use std::time::Duration;

use async_trait::async_trait;
use certwarden_common::DomainName;
use thiserror::Error;

use crate::challenge::{ChallengeError, TokenPublisher};

pub use acme::AcmeAuthority;

/// Certificate authority protocol errors
#[derive(Error, Debug)]
pub enum AuthorityError {
    #[error("Account setup failed: {0}")]
    Account(String),

    #[error("Order creation failed: {0}")]
    Order(String),

    #[error("Challenge rejected by authority: {0}")]
    ChallengeRejected(String),

    #[error("Challenge publishing failed: {0}")]
    Publish(#[from] ChallengeError),

    #[error("Order finalization failed: {0}")]
    Finalize(String),

    #[error("Order did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Revocation rejected: {0}")]
    Revoke(String),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::error::StorageError),
}

/// A signer that turns a CSR into a certificate chain
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Directory or endpoint this authority talks to
    fn endpoint(&self) -> &str;

    /// Order a certificate for `domain`
    ///
    /// Challenge content is published through `publisher` and must be
    /// removed before this returns. Returns the PEM chain, leaf first.
    async fn order(
        &self,
        domain: &DomainName,
        csr_der: &[u8],
        publisher: &dyn TokenPublisher,
    ) -> Result<String, AuthorityError>;

    /// Revoke a previously issued certificate
    async fn revoke(&self, certificate_der: &[u8]) -> Result<(), AuthorityError>;
}
