//! Common identifiers and types shared across certwarden crates.

pub mod ids;
pub mod types;

pub use ids::{CertificateId, OwnerId};
pub use types::{CertificateStatus, DomainName, DomainNameError, ParseEnumError, ProviderKind};
