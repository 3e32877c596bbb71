//! Service facade
//!
//! [`CertificateService`] owns the collaborators and applies the per-domain
//! lock around every mutating operation. Interactive calls fail fast with
//! [`LifecycleError::OperationInProgress`] when the domain is busy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use certwarden_common::{CertificateId, DomainName, ProviderKind};
use certwarden_config::{Config, RenewalConfig};
use chrono::Utc;
use tracing::{info, warn};

use crate::challenge::{ChallengeServer, TemplateWebRoot};
use crate::error::LifecycleError;
use crate::hook::HookDispatcher;
use crate::introspect;
use crate::locks::DomainLocks;
use crate::orchestrator::IssuanceOrchestrator;
use crate::provider::ProviderRegistry;
use crate::record::{CertificateDetail, CertificateRecord, CertificateSummary, Domain, Material};
use crate::revocation::RevocationWorkflow;
use crate::scheduler::RenewalScheduler;
use crate::storage::MaterialStorage;
use crate::store::{CertificateRecordStore, RecordQuery};
use crate::sweep::{RenewalSweep, SweepReport};

pub struct CertificateService {
    store: Arc<dyn CertificateRecordStore>,
    storage: Arc<MaterialStorage>,
    locks: Arc<DomainLocks>,
    orchestrator: Arc<IssuanceOrchestrator>,
    revocation: RevocationWorkflow,
    sweep: Arc<RenewalSweep>,
    hook: HookDispatcher,
    renewal: RenewalConfig,
}

impl CertificateService {
    /// Wire everything up from configuration
    pub fn from_config(
        config: &Config,
        store: Arc<dyn CertificateRecordStore>,
    ) -> anyhow::Result<Self> {
        let storage = Arc::new(
            MaterialStorage::new(&config.storage)
                .with_context(|| format!("Failed to open storage {}", config.storage.display()))?,
        );
        let challenge = Arc::new(
            ChallengeServer::new(
                &config.challenge,
                Arc::new(TemplateWebRoot::new(config.webroot.clone())),
            )
            .context("Failed to create challenge server")?,
        );
        let providers = Arc::new(ProviderRegistry::from_config(
            config,
            Arc::clone(&storage),
            Arc::clone(&challenge),
        ));
        let hook = HookDispatcher::from_config(config.reload_hook.as_ref());

        Ok(Self::new(
            store,
            providers,
            challenge,
            storage,
            hook,
            config.renewal.clone(),
        ))
    }

    pub fn new(
        store: Arc<dyn CertificateRecordStore>,
        providers: Arc<ProviderRegistry>,
        challenge: Arc<ChallengeServer>,
        storage: Arc<MaterialStorage>,
        hook: HookDispatcher,
        renewal: RenewalConfig,
    ) -> Self {
        let locks = Arc::new(DomainLocks::new());
        let orchestrator = Arc::new(
            IssuanceOrchestrator::new(
                Arc::clone(&store),
                Arc::clone(&providers),
                challenge,
                Arc::clone(&storage),
                hook.clone(),
            )
            .with_operation_timeout(renewal.operation_timeout()),
        );
        let revocation =
            RevocationWorkflow::new(Arc::clone(&store), providers, Arc::clone(&storage));
        let sweep = Arc::new(
            RenewalSweep::new(Arc::clone(&store), Arc::clone(&orchestrator), Arc::clone(&locks))
                .with_concurrency(renewal.concurrency)
                .with_lock_wait(renewal.lock_wait()),
        );

        Self {
            store,
            storage,
            locks,
            orchestrator,
            revocation,
            sweep,
            hook,
            renewal,
        }
    }

    pub fn store(&self) -> &Arc<dyn CertificateRecordStore> {
        &self.store
    }

    pub fn storage(&self) -> &MaterialStorage {
        &self.storage
    }

    pub fn locks(&self) -> &DomainLocks {
        &self.locks
    }

    pub fn providers(&self) -> &ProviderRegistry {
        self.orchestrator.providers()
    }

    /// Configured renewal window
    pub fn renewal_window(&self) -> Duration {
        self.renewal.window()
    }

    /// Scheduler over this service's sweep with the configured cadence
    pub fn scheduler(&self) -> RenewalScheduler {
        RenewalScheduler::new(Arc::clone(&self.sweep))
            .with_interval(self.renewal.interval())
            .with_window(self.renewal_window())
    }

    /// Wait for reload notifications still running in the background
    ///
    /// Returns how many failed. A process must call this before exiting or
    /// the web server may never pick up new material.
    pub async fn drain_hooks(&self) -> usize {
        self.hook.drain().await
    }

    pub async fn issue_certificate(
        &self,
        domain: Domain,
        provider: ProviderKind,
        upload: Option<Material>,
    ) -> Result<CertificateSummary, LifecycleError> {
        let _guard = self.locks.try_acquire(&domain.name)?;
        let record = self.orchestrator.issue(&domain, provider, upload).await?;
        Ok(record.summary())
    }

    pub async fn renew_certificate(
        &self,
        id: CertificateId,
    ) -> Result<CertificateSummary, LifecycleError> {
        let (_guard, record) = self.lock_record(id).await?;
        let renewed = self.orchestrator.renew(&record).await?;
        Ok(renewed.summary())
    }

    /// Revoke a certificate; repeated calls succeed
    pub async fn revoke_certificate(&self, id: CertificateId) -> Result<(), LifecycleError> {
        let (_guard, record) = self.lock_record(id).await?;
        self.revocation.revoke(&record).await?;
        Ok(())
    }

    /// Destroy a record and its installed material without contacting a CA
    pub async fn delete_certificate(&self, id: CertificateId) -> Result<(), LifecycleError> {
        let (_guard, record) = self.lock_record(id).await?;

        self.storage.remove(&record.domain, record.id).await?;
        if !self.store.delete(id).await? {
            return Err(LifecycleError::NotFound(id));
        }

        info!(domain = %record.domain, certificate_id = %id, "Deleted certificate");
        Ok(())
    }

    pub async fn get_certificate_details(
        &self,
        id: CertificateId,
    ) -> Result<CertificateDetail, LifecycleError> {
        let record = self.load(id).await?;

        let info = match &record.material {
            Some(material) => match introspect::parse(material.certificate_pem().as_bytes()) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(certificate_id = %id, error = %e, "Stored certificate does not parse");
                    None
                }
            },
            None => None,
        };

        Ok(CertificateDetail::build(&record, info.as_ref(), Utc::now()))
    }

    pub async fn list_certificates(
        &self,
        domain: Option<DomainName>,
    ) -> Result<Vec<CertificateSummary>, LifecycleError> {
        let query = match domain {
            Some(domain) => RecordQuery::for_domain(domain),
            None => RecordQuery::all(),
        };

        let records = self.store.query(&query).await?;
        Ok(records.iter().map(CertificateRecord::summary).collect())
    }

    pub async fn run_renewal_sweep(&self, window: Duration) -> Result<SweepReport, LifecycleError> {
        self.sweep.run(window).await
    }

    async fn load(&self, id: CertificateId) -> Result<CertificateRecord, LifecycleError> {
        self.store
            .get(id)
            .await?
            .ok_or(LifecycleError::NotFound(id))
    }

    /// Lock the record's domain, then read the record again under the lock
    async fn lock_record(
        &self,
        id: CertificateId,
    ) -> Result<(crate::locks::DomainGuard, CertificateRecord), LifecycleError> {
        let domain = self.load(id).await?.domain;
        let guard = self.locks.try_acquire(&domain)?;
        let record = self.load(id).await?;
        Ok((guard, record))
    }
}

impl std::fmt::Debug for CertificateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateService")
            .field("orchestrator", &self.orchestrator)
            .field("sweep", &self.sweep)
            .finish()
    }
}
