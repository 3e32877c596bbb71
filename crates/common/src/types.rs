//! Shared enums and value types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum length of a DNS name in presentation format
const MAX_DOMAIN_LEN: usize = 253;

/// Maximum length of a single DNS label
const MAX_LABEL_LEN: usize = 63;

// ============================================================================
// Provider
// ============================================================================

/// Issuance strategy of a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Production ACME certificate authority
    CaProduction,
    /// Staging ACME certificate authority (untrusted, relaxed rate limits)
    CaStaging,
    /// Locally generated self-signed certificate
    SelfSigned,
    /// Caller-supplied certificate material
    Custom,
}

impl ProviderKind {
    /// All provider kinds, in display order
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::CaProduction,
        ProviderKind::CaStaging,
        ProviderKind::SelfSigned,
        ProviderKind::Custom,
    ];

    /// Whether certificates come from a remote authority
    pub fn is_ca_backed(self) -> bool {
        matches!(self, ProviderKind::CaProduction | ProviderKind::CaStaging)
    }

    /// Default auto-renew policy for new certificates of this kind
    pub fn default_auto_renew(self) -> bool {
        self.is_ca_backed()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::CaProduction => "ca_production",
            ProviderKind::CaStaging => "ca_staging",
            ProviderKind::SelfSigned => "self_signed",
            ProviderKind::Custom => "custom",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ParseEnumError;

    /// Accepts both the stored form (`ca_production`) and the CLI form
    /// (`ca`, `ca-staging`, `self-signed`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "ca_production" | "ca" | "production" => Ok(ProviderKind::CaProduction),
            "ca_staging" | "staging" => Ok(ProviderKind::CaStaging),
            "self_signed" => Ok(ProviderKind::SelfSigned),
            "custom" => Ok(ProviderKind::Custom),
            _ => Err(ParseEnumError {
                kind: "provider",
                value: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Status
// ============================================================================

/// Stored lifecycle status of a certificate record.
///
/// `expired` and `expiring_soon` are deliberately absent: they are derived
/// from `expires_at` at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Pending,
    Active,
    Error,
    Revoked,
}

impl CertificateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CertificateStatus::Pending => "pending",
            CertificateStatus::Active => "active",
            CertificateStatus::Error => "error",
            CertificateStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertificateStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(CertificateStatus::Pending),
            "active" => Ok(CertificateStatus::Active),
            "error" => Ok(CertificateStatus::Error),
            "revoked" => Ok(CertificateStatus::Revoked),
            _ => Err(ParseEnumError {
                kind: "status",
                value: s.to_string(),
            }),
        }
    }
}

/// Failure to parse one of the string-backed enums
#[derive(Debug, Clone, Error)]
#[error("invalid {kind}: {value:?}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

// ============================================================================
// Domain names
// ============================================================================

/// A validated, lower-cased DNS hostname.
///
/// Domain names end up in filesystem paths (webroots, material storage),
/// so anything that could escape a directory is rejected here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DomainName(String);

/// Rejected domain name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainNameError {
    #[error("domain name is empty")]
    Empty,

    #[error("domain name exceeds {MAX_DOMAIN_LEN} characters")]
    TooLong,

    #[error("invalid label {0:?} in domain name")]
    InvalidLabel(String),
}

impl DomainName {
    pub fn parse(name: &str) -> Result<Self, DomainNameError> {
        let name = name.trim().trim_end_matches('.').to_ascii_lowercase();

        if name.is_empty() {
            return Err(DomainNameError::Empty);
        }
        if name.len() > MAX_DOMAIN_LEN {
            return Err(DomainNameError::TooLong);
        }

        for label in name.split('.') {
            let valid = !label.is_empty()
                && label.len() <= MAX_LABEL_LEN
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-');
            if !valid {
                return Err(DomainNameError::InvalidLabel(label.to_string()));
            }
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DomainName {
    type Err = DomainNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DomainName {
    type Error = DomainNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DomainName> for String {
    fn from(value: DomainName) -> Self {
        value.0
    }
}

impl AsRef<str> for DomainName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
