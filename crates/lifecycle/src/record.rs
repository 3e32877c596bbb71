//! Certificate records and the material they carry

use std::fmt;

use certwarden_common::{
    CertificateId, CertificateStatus, DomainName, DomainNameError, OwnerId, ProviderKind,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::LifecycleError;
use crate::introspect::CertificateInfo;

/// Days before expiry at which an active certificate counts as expiring soon
pub const EXPIRING_SOON_DAYS: i64 = 30;

/// A managed domain as supplied by the domain-management side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub name: DomainName,
    pub owner: OwnerId,
}

impl Domain {
    pub fn new(name: DomainName, owner: OwnerId) -> Self {
        Self { name, owner }
    }

    pub fn parse(name: &str, owner: impl Into<String>) -> Result<Self, DomainNameError> {
        Ok(Self {
            name: DomainName::parse(name)?,
            owner: OwnerId::new(owner),
        })
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.name, f)
    }
}

/// PEM certificate, private key and optional chain
///
/// The key and the certificate are always present together. Contents are
/// wiped on drop and never printed.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Material {
    certificate_pem: String,
    private_key_pem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chain_pem: Option<String>,
}

impl Material {
    pub fn new(
        certificate_pem: impl Into<String>,
        private_key_pem: impl Into<String>,
        chain_pem: Option<String>,
    ) -> Result<Self, LifecycleError> {
        let certificate_pem = certificate_pem.into();
        let private_key_pem = private_key_pem.into();

        if certificate_pem.trim().is_empty() {
            return Err(LifecycleError::malformed("certificate is empty"));
        }
        if private_key_pem.trim().is_empty() {
            return Err(LifecycleError::malformed("private key is empty"));
        }

        Ok(Self {
            certificate_pem,
            private_key_pem,
            chain_pem: chain_pem.filter(|chain| !chain.trim().is_empty()),
        })
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    pub fn chain_pem(&self) -> Option<&str> {
        self.chain_pem.as_deref()
    }

    /// Leaf followed by the chain, as web servers expect it
    pub fn fullchain_pem(&self) -> String {
        match &self.chain_pem {
            Some(chain) => {
                let mut full = self.certificate_pem.trim_end().to_string();
                full.push('\n');
                full.push_str(chain);
                full
            }
            None => self.certificate_pem.clone(),
        }
    }
}

impl fmt::Debug for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Material")
            .field("certificate_pem", &format_args!("<{} bytes>", self.certificate_pem.len()))
            .field("private_key_pem", &"<redacted>")
            .field("has_chain", &self.chain_pem.is_some())
            .finish()
    }
}

/// The persisted unit of trust material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: CertificateId,
    pub domain: DomainName,
    pub owner: OwnerId,
    pub provider: ProviderKind,
    pub status: CertificateStatus,
    pub auto_renew: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material: Option<Material>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub renewed_at: Option<DateTime<Utc>>,
    /// Why the last issuance attempt failed
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Record that replaced this one as the active certificate
    #[serde(default)]
    pub superseded_by: Option<CertificateId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CertificateRecord {
    /// New `pending` record with the provider's default renewal policy
    pub fn pending(domain: &Domain, provider: ProviderKind) -> Self {
        let now = Utc::now();
        Self {
            id: CertificateId::new(),
            domain: domain.name.clone(),
            owner: domain.owner.clone(),
            provider,
            status: CertificateStatus::Pending,
            auto_renew: provider.default_auto_renew(),
            material: None,
            issued_at: None,
            expires_at: None,
            renewed_at: None,
            failure_reason: None,
            superseded_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach material and take the validity window from it
    pub fn install_material(&mut self, material: Material, info: &CertificateInfo) {
        self.material = Some(material);
        self.issued_at = Some(info.not_before);
        self.expires_at = Some(info.not_after);
        self.failure_reason = None;
        self.touch();
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = CertificateStatus::Error;
        self.failure_reason = Some(reason.into());
        self.material = None;
        self.touch();
    }

    pub fn mark_revoked(&mut self) {
        self.status = CertificateStatus::Revoked;
        self.material = None;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires < now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expiring_soon_at(&self, now: DateTime<Utc>) -> bool {
        self.status == CertificateStatus::Active
            && self
                .expires_at
                .is_some_and(|expires| expires - now <= Duration::days(EXPIRING_SOON_DAYS))
    }

    pub fn is_expiring_soon(&self) -> bool {
        self.is_expiring_soon_at(Utc::now())
    }

    /// Whole days until expiry, negative once expired
    pub fn days_until_expiry_at(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at.map(|expires| (expires - now).num_days())
    }

    pub fn summary(&self) -> CertificateSummary {
        CertificateSummary {
            id: self.id,
            domain: self.domain.clone(),
            owner: self.owner.clone(),
            provider: self.provider,
            status: self.status,
            auto_renew: self.auto_renew,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            renewed_at: self.renewed_at,
            failure_reason: self.failure_reason.clone(),
        }
    }
}

/// What issue and renew return to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSummary {
    pub id: CertificateId,
    pub domain: DomainName,
    pub owner: OwnerId,
    pub provider: ProviderKind,
    pub status: CertificateStatus,
    pub auto_renew: bool,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub renewed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

/// Read-time view of a record, with fields derived from its material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateDetail {
    pub id: CertificateId,
    pub domain: DomainName,
    pub provider: ProviderKind,
    pub status: CertificateStatus,
    pub auto_renew: bool,
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub sans: Vec<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub renewed_at: Option<DateTime<Utc>>,
    pub days_until_expiry: Option<i64>,
    pub is_expiring_soon: bool,
    pub is_expired: bool,
    pub fingerprint_sha256: Option<String>,
    pub serial: Option<String>,
    pub is_self_signed: Option<bool>,
    pub public_key_algorithm: Option<String>,
    pub signature_algorithm: Option<String>,
    pub failure_reason: Option<String>,
    pub superseded_by: Option<CertificateId>,
}

impl CertificateDetail {
    /// Build the detail view at `now`; `info` is absent when the record
    /// holds no material
    pub fn build(record: &CertificateRecord, info: Option<&CertificateInfo>, now: DateTime<Utc>) -> Self {
        Self {
            id: record.id,
            domain: record.domain.clone(),
            provider: record.provider,
            status: record.status,
            auto_renew: record.auto_renew,
            subject: info.and_then(|i| i.common_name.clone()),
            issuer: info.map(|i| i.issuer.clone()),
            sans: info.map(|i| i.sans.clone()).unwrap_or_default(),
            not_before: info.map(|i| i.not_before).or(record.issued_at),
            not_after: info.map(|i| i.not_after).or(record.expires_at),
            renewed_at: record.renewed_at,
            days_until_expiry: record.days_until_expiry_at(now),
            is_expiring_soon: record.is_expiring_soon_at(now),
            is_expired: record.is_expired_at(now),
            fingerprint_sha256: info.map(|i| i.fingerprint_sha256.clone()),
            serial: info.map(|i| i.serial.clone()),
            is_self_signed: info.map(|i| i.is_self_signed),
            public_key_algorithm: info.map(|i| i.public_key_algorithm.clone()),
            signature_algorithm: info.map(|i| i.signature_algorithm.clone()),
            failure_reason: record.failure_reason.clone(),
            superseded_by: record.superseded_by,
        }
    }
}
