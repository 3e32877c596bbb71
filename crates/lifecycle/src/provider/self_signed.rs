//! Locally generated self-signed certificates

use async_trait::async_trait;
use certwarden_common::{DomainName, ProviderKind};
use chrono::{Datelike, Duration, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tracing::info;

use super::{CertificateProvider, IssueRequest};
use crate::error::LifecycleError;
use crate::record::{CertificateRecord, Material};

#[derive(Debug, Clone)]
pub struct SelfSignedProvider {
    validity_days: u32,
}

impl SelfSignedProvider {
    pub fn new(validity_days: u32) -> Self {
        Self { validity_days }
    }

    /// Fresh key pair and a leaf valid from today for `validity_days`
    pub fn generate(&self, domain: &DomainName) -> Result<Material, LifecycleError> {
        let key_pair = KeyPair::generate()
            .map_err(|e| LifecycleError::issuance(domain, format!("key generation failed: {}", e)))?;

        let mut params = CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| LifecycleError::issuance(domain, format!("invalid certificate parameters: {}", e)))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain.as_str());
        params.distinguished_name = dn;

        let start = Utc::now();
        let end = start + Duration::days(i64::from(self.validity_days));
        params.not_before = rcgen::date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
        params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);

        let certificate = params
            .self_signed(&key_pair)
            .map_err(|e| LifecycleError::issuance(domain, format!("signing failed: {}", e)))?;

        Material::new(certificate.pem(), key_pair.serialize_pem(), None)
    }
}

impl Default for SelfSignedProvider {
    fn default() -> Self {
        Self::new(365)
    }
}

#[async_trait]
impl CertificateProvider for SelfSignedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SelfSigned
    }

    async fn issue(&self, request: IssueRequest<'_>) -> Result<Material, LifecycleError> {
        let material = self.generate(&request.domain.name)?;
        info!(
            domain = %request.domain,
            validity_days = self.validity_days,
            "Generated self-signed certificate"
        );
        Ok(material)
    }

    async fn renew(&self, existing: &CertificateRecord) -> Result<Material, LifecycleError> {
        let material = self.generate(&existing.domain)?;
        info!(domain = %existing.domain, "Regenerated self-signed certificate");
        Ok(material)
    }
}
