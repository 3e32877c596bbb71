//! CA-backed issuance

use std::sync::Arc;

use async_trait::async_trait;
use certwarden_common::{DomainName, ProviderKind};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tracing::{debug, info, warn};

use super::{CertificateProvider, IssueRequest};
use crate::authority::{AuthorityError, CertificateAuthority};
use crate::challenge::ChallengeServer;
use crate::error::LifecycleError;
use crate::introspect;
use crate::record::{CertificateRecord, Material};

/// Issues through a remote authority after proving ownership locally
pub struct CaProvider {
    kind: ProviderKind,
    authority: Arc<dyn CertificateAuthority>,
    challenge: Arc<ChallengeServer>,
}

impl CaProvider {
    pub fn new(
        kind: ProviderKind,
        authority: Arc<dyn CertificateAuthority>,
        challenge: Arc<ChallengeServer>,
    ) -> Self {
        debug_assert!(kind.is_ca_backed());
        Self {
            kind,
            authority,
            challenge,
        }
    }

    /// Prove ownership, then order a certificate for a fresh key
    async fn obtain(&self, domain: &DomainName) -> Result<Material, LifecycleError> {
        self.challenge
            .prove_ownership(domain)
            .await
            .map_err(|e| e.for_domain(domain))?;

        let key_pair = KeyPair::generate()
            .map_err(|e| LifecycleError::issuance(domain, format!("key generation failed: {}", e)))?;

        let mut params = CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| LifecycleError::issuance(domain, format!("invalid CSR parameters: {}", e)))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain.as_str());
        params.distinguished_name = dn;

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| LifecycleError::issuance(domain, format!("CSR generation failed: {}", e)))?;

        debug!(
            domain = %domain,
            authority = %self.authority.endpoint(),
            "Requesting certificate from authority"
        );

        let chain = self
            .authority
            .order(domain, csr.der(), self.challenge.as_ref())
            .await
            .map_err(|e| authority_error(domain, e))?;

        let (leaf, intermediates) = introspect::split_bundle(&chain)?;
        Material::new(leaf, key_pair.serialize_pem(), intermediates)
    }
}

fn authority_error(domain: &DomainName, error: AuthorityError) -> LifecycleError {
    match error {
        AuthorityError::Publish(e) => e.for_domain(domain),
        other => LifecycleError::issuance(domain, other),
    }
}

#[async_trait]
impl CertificateProvider for CaProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn issue(&self, request: IssueRequest<'_>) -> Result<Material, LifecycleError> {
        if request.upload.is_some() {
            warn!(domain = %request.domain, "Ignoring uploaded material for CA-backed issuance");
        }
        let material = self.obtain(&request.domain.name).await?;
        info!(domain = %request.domain, provider = %self.kind, "Obtained certificate");
        Ok(material)
    }

    async fn renew(&self, existing: &CertificateRecord) -> Result<Material, LifecycleError> {
        let material = self.obtain(&existing.domain).await?;
        info!(
            domain = %existing.domain,
            certificate_id = %existing.id,
            "Obtained renewed certificate"
        );
        Ok(material)
    }

    async fn revoke(&self, existing: &CertificateRecord) -> Result<(), LifecycleError> {
        let Some(material) = &existing.material else {
            debug!(domain = %existing.domain, "No material to revoke upstream");
            return Ok(());
        };

        let der = introspect::leaf_der(material.certificate_pem().as_bytes())?;
        self.authority
            .revoke(&der)
            .await
            .map_err(|e| LifecycleError::Revocation {
                domain: existing.domain.to_string(),
                reason: e.to_string(),
            })?;

        info!(domain = %existing.domain, certificate_id = %existing.id, "Revoked upstream");
        Ok(())
    }
}
