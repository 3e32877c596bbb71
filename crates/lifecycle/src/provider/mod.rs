//! Issuance strategies
//!
//! One trait, three implementations selected by [`ProviderKind`]:
//!
//! | Kind | Issue | Renew | Revoke |
//! |------|-------|-------|--------|
//! | `ca_production` / `ca_staging` | challenge + authority order | new order | authority revoke |
//! | `self_signed` | local key and certificate | regenerate | no-op |
//! | `custom` | validate uploaded material | rejected | no-op |

mod ca;
mod custom;
mod self_signed;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use certwarden_common::ProviderKind;
use certwarden_config::Config;
use tracing::{debug, info};

use crate::authority::AcmeAuthority;
use crate::challenge::ChallengeServer;
use crate::error::LifecycleError;
use crate::record::{CertificateRecord, Domain, Material};
use crate::storage::MaterialStorage;

pub use ca::CaProvider;
pub use custom::CustomProvider;
pub use self_signed::SelfSignedProvider;

/// Input to [`CertificateProvider::issue`]
#[derive(Debug, Clone, Copy)]
pub struct IssueRequest<'a> {
    pub domain: &'a Domain,
    /// Caller-supplied material, only meaningful for `custom`
    pub upload: Option<&'a Material>,
}

/// Produces certificate material for a domain
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn issue(&self, request: IssueRequest<'_>) -> Result<Material, LifecycleError>;

    async fn renew(&self, existing: &CertificateRecord) -> Result<Material, LifecycleError>;

    /// Revoke upstream; providers without a remote authority do nothing
    async fn revoke(&self, existing: &CertificateRecord) -> Result<(), LifecycleError> {
        debug!(
            domain = %existing.domain,
            provider = %self.kind(),
            "Provider has no remote revocation"
        );
        Ok(())
    }

    /// Whether the orchestrator should check HTTP reachability first
    fn requires_preflight(&self) -> bool {
        self.kind().is_ca_backed()
    }
}

/// Providers by kind
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn CertificateProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any of the same kind
    pub fn register(&mut self, provider: Arc<dyn CertificateProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn CertificateProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn CertificateProvider>, LifecycleError> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or(LifecycleError::ProviderUnavailable(kind))
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|kind| self.providers.contains_key(kind))
            .collect()
    }

    /// Self-signed and custom always; CA-backed kinds when `acme` is set
    pub fn from_config(
        config: &Config,
        storage: Arc<MaterialStorage>,
        challenge: Arc<ChallengeServer>,
    ) -> Self {
        let mut registry = Self::new()
            .with(Arc::new(SelfSignedProvider::new(config.self_signed.validity_days)))
            .with(Arc::new(CustomProvider::new()));

        if let Some(acme) = &config.acme {
            for (kind, directory) in [
                (ProviderKind::CaProduction, &acme.production_directory),
                (ProviderKind::CaStaging, &acme.staging_directory),
            ] {
                let authority = AcmeAuthority::new(
                    directory.clone(),
                    acme.email.clone(),
                    acme.order_timeout(),
                    Arc::clone(&storage),
                );
                registry.register(Arc::new(CaProvider::new(
                    kind,
                    Arc::new(authority),
                    Arc::clone(&challenge),
                )));
            }
        }

        info!(providers = ?registry.kinds(), "Configured certificate providers");
        registry
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::TemplateWebRoot;
    use certwarden_config::AcmeConfig;
    use tempfile::TempDir;

    fn registry_for(config: &Config, dir: &TempDir) -> ProviderRegistry {
        let storage = Arc::new(MaterialStorage::new(dir.path()).unwrap());
        let challenge = Arc::new(
            ChallengeServer::new(
                &config.challenge,
                Arc::new(TemplateWebRoot::new(config.webroot.clone())),
            )
            .unwrap(),
        );
        ProviderRegistry::from_config(config, storage, challenge)
    }

    #[test]
    fn test_without_acme_only_local_providers() {
        let dir = TempDir::new().unwrap();
        let registry = registry_for(&Config::default(), &dir);

        assert_eq!(
            registry.kinds(),
            vec![ProviderKind::SelfSigned, ProviderKind::Custom]
        );
        assert!(matches!(
            registry.get(ProviderKind::CaProduction),
            Err(LifecycleError::ProviderUnavailable(ProviderKind::CaProduction))
        ));
    }

    #[test]
    fn test_with_acme_all_providers() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            acme: Some(AcmeConfig::new("admin@example.com")),
            ..Default::default()
        };
        let registry = registry_for(&config, &dir);

        assert_eq!(registry.kinds(), ProviderKind::ALL.to_vec());
        assert!(registry.get(ProviderKind::CaStaging).unwrap().requires_preflight());
        assert!(!registry.get(ProviderKind::SelfSigned).unwrap().requires_preflight());
    }
}
