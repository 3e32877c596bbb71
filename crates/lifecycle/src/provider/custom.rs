//! Caller-supplied certificate material

use async_trait::async_trait;
use certwarden_common::ProviderKind;
use chrono::Utc;
use tracing::{debug, info};

use super::{CertificateProvider, IssueRequest};
use crate::error::LifecycleError;
use crate::introspect;
use crate::record::{CertificateRecord, Material};

/// Accepts uploaded material after checking it fits the domain
#[derive(Debug, Clone, Copy, Default)]
pub struct CustomProvider;

impl CustomProvider {
    pub fn new() -> Self {
        Self
    }

    /// Validate an upload and normalize it into leaf plus chain
    ///
    /// A bundle in the certificate field is split; its first certificate
    /// must cover the domain and match the key.
    pub fn accept(&self, domain: &str, upload: &Material) -> Result<Material, LifecycleError> {
        let (leaf, bundled_chain) = introspect::split_bundle(upload.certificate_pem())?;
        let info = introspect::parse(leaf.as_bytes())?;

        if !info.covers(domain) {
            return Err(LifecycleError::malformed(format!(
                "certificate does not cover {} (subject {:?}, SANs {:?})",
                domain, info.common_name, info.sans
            )));
        }

        if !introspect::key_matches(&info, upload.private_key_pem())? {
            return Err(LifecycleError::malformed(
                "private key does not belong to the certificate",
            ));
        }

        if info.is_expired_at(Utc::now()) {
            return Err(LifecycleError::malformed(format!(
                "certificate expired at {}",
                info.not_after
            )));
        }

        let chain = match (upload.chain_pem(), bundled_chain) {
            (Some(chain), _) => Some(chain.to_string()),
            (None, bundled) => bundled,
        };
        if let Some(chain) = &chain {
            let count = introspect::validate_chain(chain)?;
            debug!(domain = %domain, intermediates = count, "Validated uploaded chain");
        }

        Material::new(leaf, upload.private_key_pem(), chain)
    }
}

#[async_trait]
impl CertificateProvider for CustomProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Custom
    }

    async fn issue(&self, request: IssueRequest<'_>) -> Result<Material, LifecycleError> {
        let upload = request.upload.ok_or_else(|| {
            LifecycleError::malformed("custom certificates require uploaded material")
        })?;

        let material = self.accept(request.domain.name.as_str(), upload)?;
        info!(domain = %request.domain, "Accepted uploaded certificate");
        Ok(material)
    }

    async fn renew(&self, existing: &CertificateRecord) -> Result<Material, LifecycleError> {
        Err(LifecycleError::issuance(
            &existing.domain,
            "custom certificates are renewed by uploading new material",
        ))
    }
}
