//! Issuance orchestration for a single domain
//!
//! Callers hold the domain lock (see [`crate::locks`]) for the whole call.
//!
//! Issue:
//!
//! 1. pre-flight HTTP reachability for CA-backed providers (no record yet)
//! 2. create a `pending` record (custom material is validated first and
//!    never produces a failed record)
//! 3. run the provider under the operation timeout
//! 4. introspect, stage files, persist material, promote to `active`, then
//!    swap the staged files in
//! 5. on failure, persist `error` with the reason and return the error
//! 6. notify the reload hook in the background
//!
//! Renew updates the active record in place through compare-and-swap and
//! leaves it untouched on failure. In both paths the served files change
//! only after the store has accepted the transition.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use certwarden_common::{CertificateStatus, DomainName, ProviderKind};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::challenge::ChallengeServer;
use crate::error::LifecycleError;
use crate::hook::HookDispatcher;
use crate::introspect;
use crate::provider::{CertificateProvider, IssueRequest, ProviderRegistry};
use crate::record::{CertificateRecord, Domain, Material};
use crate::storage::MaterialStorage;
use crate::store::CertificateRecordStore;

/// Default ceiling for one domain operation
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(300);

pub struct IssuanceOrchestrator {
    store: Arc<dyn CertificateRecordStore>,
    providers: Arc<ProviderRegistry>,
    challenge: Arc<ChallengeServer>,
    storage: Arc<MaterialStorage>,
    hook: HookDispatcher,
    operation_timeout: Duration,
}

impl IssuanceOrchestrator {
    pub fn new(
        store: Arc<dyn CertificateRecordStore>,
        providers: Arc<ProviderRegistry>,
        challenge: Arc<ChallengeServer>,
        storage: Arc<MaterialStorage>,
        hook: HookDispatcher,
    ) -> Self {
        Self {
            store,
            providers,
            challenge,
            storage,
            hook,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Issue a certificate for `domain`, superseding any active one on success
    pub async fn issue(
        &self,
        domain: &Domain,
        kind: ProviderKind,
        upload: Option<Material>,
    ) -> Result<CertificateRecord, LifecycleError> {
        let provider = self.providers.get(kind)?;
        info!(domain = %domain, provider = %kind, "Issuing certificate");

        self.preflight(provider.as_ref(), &domain.name).await?;

        if kind == ProviderKind::Custom {
            return self.issue_custom(provider.as_ref(), domain, upload).await;
        }

        let mut record = CertificateRecord::pending(domain, kind);
        self.store.insert(&record).await?;
        debug!(domain = %domain, certificate_id = %record.id, "Created pending record");

        let request = IssueRequest {
            domain,
            upload: upload.as_ref(),
        };
        let outcome = self
            .with_deadline(&domain.name, provider.issue(request))
            .await
            .and_then(|material| accept_material(&domain.name, material));

        let (material, info) = match outcome {
            Ok(accepted) => accepted,
            Err(e) => return Err(self.fail(record, e).await),
        };

        record.install_material(material, &info);
        match self.activate(&mut record).await {
            Ok(()) => Ok(record),
            // Promoted; only the file swap failed
            Err(e) if record.status == CertificateStatus::Active => Err(e),
            Err(e) => Err(self.fail(record, e).await),
        }
    }

    /// Custom uploads are validated before any record exists
    async fn issue_custom(
        &self,
        provider: &dyn CertificateProvider,
        domain: &Domain,
        upload: Option<Material>,
    ) -> Result<CertificateRecord, LifecycleError> {
        let material = provider
            .issue(IssueRequest {
                domain,
                upload: upload.as_ref(),
            })
            .await?;
        let (material, info) = accept_material(&domain.name, material)?;

        let mut record = CertificateRecord::pending(domain, ProviderKind::Custom);
        record.install_material(material, &info);
        self.store.insert(&record).await?;

        match self.activate(&mut record).await {
            Ok(()) => Ok(record),
            Err(e) if record.status == CertificateStatus::Active => Err(e),
            Err(e) => {
                // Nothing was ever active under this id
                match self.store.delete(record.id).await {
                    Ok(_) => debug!(certificate_id = %record.id, "Discarded rejected upload"),
                    Err(delete) => warn!(
                        certificate_id = %record.id,
                        error = %delete,
                        "Failed to discard pending record"
                    ),
                }
                Err(e)
            }
        }
    }

    /// Renew an active record in place
    pub async fn renew(&self, record: &CertificateRecord) -> Result<CertificateRecord, LifecycleError> {
        if record.status != CertificateStatus::Active {
            return Err(LifecycleError::InvalidState {
                id: record.id,
                status: record.status,
                required: CertificateStatus::Active,
            });
        }

        let provider = self.providers.get(record.provider)?;
        info!(domain = %record.domain, certificate_id = %record.id, "Renewing certificate");

        let result = async {
            self.preflight(provider.as_ref(), &record.domain).await?;
            let material = self
                .with_deadline(&record.domain, provider.renew(record))
                .await?;
            let (material, info) = accept_material(&record.domain, material)?;

            let mut renewed = record.clone();
            renewed.install_material(material, &info);
            renewed.renewed_at = Some(Utc::now());

            let staged = self.storage.stage(&renewed).await?;
            self.store
                .compare_and_swap(CertificateStatus::Active, &renewed)
                .await?;
            Ok::<_, LifecycleError>((renewed, staged))
        }
        .await;

        let (renewed, staged) = match result {
            Ok(stored) => stored,
            Err(e) => {
                error!(
                    domain = %record.domain,
                    certificate_id = %record.id,
                    error = %e,
                    "Renewal failed; previous certificate stays active"
                );
                return Err(e);
            }
        };

        if let Err(e) = staged.commit().await {
            error!(
                domain = %renewed.domain,
                certificate_id = %renewed.id,
                error = %e,
                "Renewed certificate stored but its files were not installed"
            );
            return Err(e.into());
        }

        info!(
            domain = %renewed.domain,
            certificate_id = %renewed.id,
            expires = ?renewed.expires_at,
            "Certificate renewed"
        );
        self.hook.dispatch(renewed.domain.clone());
        Ok(renewed)
    }

    async fn preflight(
        &self,
        provider: &dyn CertificateProvider,
        domain: &DomainName,
    ) -> Result<(), LifecycleError> {
        if !provider.requires_preflight() {
            return Ok(());
        }

        self.challenge.preflight(domain).await.map_err(|e| {
            warn!(domain = %domain, error = %e, "Pre-flight reachability check failed");
            e.for_domain(domain)
        })
    }

    async fn with_deadline<T>(
        &self,
        domain: &DomainName,
        operation: impl Future<Output = Result<T, LifecycleError>>,
    ) -> Result<T, LifecycleError> {
        match tokio::time::timeout(self.operation_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(LifecycleError::OperationTimedOut {
                domain: domain.to_string(),
                after: self.operation_timeout,
            }),
        }
    }

    /// Stage files, persist material, flip to active, then install
    ///
    /// `record.status` is `Active` once the store has promoted it, even if
    /// the final file swap fails.
    async fn activate(&self, record: &mut CertificateRecord) -> Result<(), LifecycleError> {
        let staged = self.storage.stage(record).await?;
        self.store
            .compare_and_swap(CertificateStatus::Pending, record)
            .await?;

        let superseded = self.store.promote(record.id).await?;
        record.status = CertificateStatus::Active;

        if let Some(previous) = superseded {
            info!(
                domain = %record.domain,
                certificate_id = %previous.id,
                superseded_by = %record.id,
                "Superseded previous certificate"
            );
        }

        info!(
            domain = %record.domain,
            certificate_id = %record.id,
            provider = %record.provider,
            expires = ?record.expires_at,
            "Certificate active"
        );

        if let Err(e) = staged.commit().await {
            error!(
                domain = %record.domain,
                certificate_id = %record.id,
                error = %e,
                "Certificate is active but its files were not installed"
            );
            return Err(e.into());
        }

        self.hook.dispatch(record.domain.clone());
        Ok(())
    }

    /// Record the failure on the pending record and hand the error back
    async fn fail(&self, mut record: CertificateRecord, error: LifecycleError) -> LifecycleError {
        error!(
            domain = %record.domain,
            certificate_id = %record.id,
            error = %error,
            "Issuance failed"
        );

        record.mark_failed(error.to_string());
        if let Err(e) = self
            .store
            .compare_and_swap(CertificateStatus::Pending, &record)
            .await
        {
            warn!(certificate_id = %record.id, error = %e, "Failed to persist error status");
        }
        error
    }
}

/// Introspect returned material and check it is for `domain`
fn accept_material(
    domain: &DomainName,
    material: Material,
) -> Result<(Material, introspect::CertificateInfo), LifecycleError> {
    let info = introspect::parse(material.certificate_pem().as_bytes())?;
    if !info.covers(domain.as_str()) {
        return Err(LifecycleError::malformed(format!(
            "issued certificate does not cover {}",
            domain
        )));
    }
    Ok((material, info))
}

impl std::fmt::Debug for IssuanceOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuanceOrchestrator")
            .field("providers", &self.providers)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::TemplateWebRoot;
    use crate::error::StoreError;
    use crate::provider::{CustomProvider, SelfSignedProvider};
    use crate::store::{MemoryRecordStore, RecordQuery};
    use async_trait::async_trait;
    use certwarden_common::CertificateId;
    use certwarden_config::ChallengeConfig;
    use tempfile::TempDir;

    /// Never finishes
    struct Stuck;

    #[async_trait]
    impl CertificateProvider for Stuck {
        fn kind(&self) -> ProviderKind {
            ProviderKind::SelfSigned
        }

        async fn issue(&self, _request: IssueRequest<'_>) -> Result<Material, LifecycleError> {
            std::future::pending().await
        }

        async fn renew(&self, _existing: &CertificateRecord) -> Result<Material, LifecycleError> {
            std::future::pending().await
        }
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<MemoryRecordStore>,
        storage: Arc<MaterialStorage>,
        orchestrator: IssuanceOrchestrator,
    }

    fn harness(registry: ProviderRegistry) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryRecordStore::new());
        let storage = Arc::new(MaterialStorage::new(&dir.path().join("storage")).unwrap());
        let template = format!("{}/www/{{domain}}", dir.path().display());
        let challenge = Arc::new(
            ChallengeServer::new(
                &ChallengeConfig::default(),
                Arc::new(TemplateWebRoot::new(template)),
            )
            .unwrap(),
        );

        let orchestrator = IssuanceOrchestrator::new(
            store.clone(),
            Arc::new(registry),
            challenge,
            storage.clone(),
            HookDispatcher::noop(),
        );

        Harness {
            _dir: dir,
            store,
            storage,
            orchestrator,
        }
    }

    fn domain() -> Domain {
        Domain::parse("example.com", "owner").unwrap()
    }

    #[tokio::test]
    async fn test_issue_self_signed_activates_and_installs() {
        let h = harness(ProviderRegistry::new().with(Arc::new(SelfSignedProvider::default())));

        let record = h
            .orchestrator
            .issue(&domain(), ProviderKind::SelfSigned, None)
            .await
            .unwrap();

        assert_eq!(record.status, CertificateStatus::Active);
        assert!(!record.auto_renew);
        assert!(record.issued_at.is_some());

        let stored = h.store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CertificateStatus::Active);
        assert!(stored.material.is_some());

        let installed = h.storage.installed(&record.domain).await.unwrap().unwrap();
        assert_eq!(installed.certificate_id, record.id);
    }

    #[tokio::test]
    async fn test_reissue_supersedes_previous() {
        let h = harness(ProviderRegistry::new().with(Arc::new(SelfSignedProvider::default())));

        let first = h
            .orchestrator
            .issue(&domain(), ProviderKind::SelfSigned, None)
            .await
            .unwrap();
        let second = h
            .orchestrator
            .issue(&domain(), ProviderKind::SelfSigned, None)
            .await
            .unwrap();

        let first = h.store.get(first.id).await.unwrap().unwrap();
        assert_eq!(first.status, CertificateStatus::Revoked);
        assert_eq!(first.superseded_by, Some(second.id));

        let active = h.store.find_active(&second.domain).await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
    }

    #[tokio::test]
    async fn test_unconfigured_provider() {
        let h = harness(ProviderRegistry::new());

        let err = h
            .orchestrator
            .issue(&domain(), ProviderKind::CaProduction, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::ProviderUnavailable(_)));
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_marks_record_error() {
        let h = harness(ProviderRegistry::new().with(Arc::new(Stuck)));
        let orchestrator = h
            .orchestrator
            .with_operation_timeout(Duration::from_millis(20));

        let err = orchestrator
            .issue(&domain(), ProviderKind::SelfSigned, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::OperationTimedOut { .. }));

        let records = h.store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, CertificateStatus::Error);
        assert!(records[0].failure_reason.as_deref().unwrap().contains("timed out"));
        assert!(records[0].material.is_none());
    }

    #[tokio::test]
    async fn test_renew_requires_active() {
        let h = harness(ProviderRegistry::new().with(Arc::new(SelfSignedProvider::default())));
        let record = CertificateRecord::pending(&domain(), ProviderKind::SelfSigned);

        let err = h.orchestrator.renew(&record).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_renew_updates_in_place() {
        let h = harness(ProviderRegistry::new().with(Arc::new(SelfSignedProvider::default())));
        let issued = h
            .orchestrator
            .issue(&domain(), ProviderKind::SelfSigned, None)
            .await
            .unwrap();
        let old_fingerprint = introspect::parse(
            issued.material.as_ref().unwrap().certificate_pem().as_bytes(),
        )
        .unwrap()
        .fingerprint_sha256;

        let renewed = h.orchestrator.renew(&issued).await.unwrap();
        assert_eq!(renewed.id, issued.id);
        assert!(renewed.renewed_at.is_some());

        let stored = h.store.get(issued.id).await.unwrap().unwrap();
        let new_fingerprint = introspect::parse(
            stored.material.as_ref().unwrap().certificate_pem().as_bytes(),
        )
        .unwrap()
        .fingerprint_sha256;
        assert_ne!(old_fingerprint, new_fingerprint);
    }

    /// Memory store that can be told to refuse the activating transitions
    #[derive(Default)]
    struct Refusing {
        inner: MemoryRecordStore,
        promote: std::sync::atomic::AtomicBool,
        active_swap: std::sync::atomic::AtomicBool,
    }

    impl Refusing {
        fn refuse_promote(&self) {
            self.promote.store(true, std::sync::atomic::Ordering::SeqCst);
        }

        fn refuse_active_swap(&self) {
            self.active_swap
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CertificateRecordStore for Refusing {
        async fn insert(&self, record: &CertificateRecord) -> Result<(), StoreError> {
            self.inner.insert(record).await
        }

        async fn get(&self, id: CertificateId) -> Result<Option<CertificateRecord>, StoreError> {
            self.inner.get(id).await
        }

        async fn update(&self, record: &CertificateRecord) -> Result<(), StoreError> {
            self.inner.update(record).await
        }

        async fn compare_and_swap(
            &self,
            expected: CertificateStatus,
            record: &CertificateRecord,
        ) -> Result<(), StoreError> {
            if expected == CertificateStatus::Active
                && self.active_swap.load(std::sync::atomic::Ordering::SeqCst)
            {
                return Err(StoreError::Conflict {
                    id: record.id,
                    expected,
                    actual: CertificateStatus::Revoked,
                });
            }
            self.inner.compare_and_swap(expected, record).await
        }

        async fn promote(
            &self,
            id: CertificateId,
        ) -> Result<Option<CertificateRecord>, StoreError> {
            if self.promote.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StoreError::NotFound(id));
            }
            self.inner.promote(id).await
        }

        async fn delete(&self, id: CertificateId) -> Result<bool, StoreError> {
            self.inner.delete(id).await
        }

        async fn query(&self, query: &RecordQuery) -> Result<Vec<CertificateRecord>, StoreError> {
            self.inner.query(query).await
        }
    }

    fn refusing_harness() -> (TempDir, Arc<Refusing>, Arc<MaterialStorage>, IssuanceOrchestrator) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Refusing::default());
        let storage = Arc::new(MaterialStorage::new(&dir.path().join("storage")).unwrap());
        let template = format!("{}/www/{{domain}}", dir.path().display());
        let challenge = Arc::new(
            ChallengeServer::new(
                &ChallengeConfig::default(),
                Arc::new(TemplateWebRoot::new(template)),
            )
            .unwrap(),
        );
        let registry = ProviderRegistry::new()
            .with(Arc::new(SelfSignedProvider::default()))
            .with(Arc::new(CustomProvider::new()));

        let orchestrator = IssuanceOrchestrator::new(
            store.clone(),
            Arc::new(registry),
            challenge,
            storage.clone(),
            HookDispatcher::noop(),
        );
        (dir, store, storage, orchestrator)
    }

    fn domain_entries(storage: &MaterialStorage) -> Vec<String> {
        std::fs::read_dir(storage.base_path().join("domains"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    fn installed_pem(storage: &MaterialStorage, domain: &DomainName) -> String {
        std::fs::read_to_string(
            storage
                .base_path()
                .join("domains")
                .join(domain.as_str())
                .join("cert.pem"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_failed_promotion_keeps_previous_installed() {
        let (_dir, store, storage, orchestrator) = refusing_harness();
        let first = orchestrator
            .issue(&domain(), ProviderKind::SelfSigned, None)
            .await
            .unwrap();

        store.refuse_promote();
        let err = orchestrator
            .issue(&domain(), ProviderKind::SelfSigned, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Store(StoreError::NotFound(_))));

        let active = store.find_active(&first.domain).await.unwrap().unwrap();
        assert_eq!(active.id, first.id);
        let installed = storage.installed(&first.domain).await.unwrap().unwrap();
        assert_eq!(installed.certificate_id, first.id);
        assert_eq!(
            installed_pem(&storage, &first.domain),
            first.material.as_ref().unwrap().certificate_pem()
        );

        let failed: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.id != first.id)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, CertificateStatus::Error);
        assert!(failed[0].material.is_none());

        // No staged leftovers next to the live directory
        assert_eq!(domain_entries(&storage), vec!["example.com"]);
    }

    #[tokio::test]
    async fn test_refused_custom_upload_leaves_nothing_behind() {
        let (_dir, store, storage, orchestrator) = refusing_harness();
        let domain = domain();
        let upload = SelfSignedProvider::default().generate(&domain.name).unwrap();

        store.refuse_promote();
        let err = orchestrator
            .issue(&domain, ProviderKind::Custom, Some(upload))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Store(_)));

        assert!(store.list().await.unwrap().is_empty());
        assert!(storage.installed(&domain.name).await.unwrap().is_none());
        assert!(domain_entries(&storage).is_empty());
    }

    #[tokio::test]
    async fn test_refused_renewal_keeps_installed_files() {
        let (_dir, store, storage, orchestrator) = refusing_harness();
        let issued = orchestrator
            .issue(&domain(), ProviderKind::SelfSigned, None)
            .await
            .unwrap();
        let served = installed_pem(&storage, &issued.domain);

        store.refuse_active_swap();
        let err = orchestrator.renew(&issued).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Store(StoreError::Conflict { .. })));

        assert_eq!(installed_pem(&storage, &issued.domain), served);
        let stored = store.get(issued.id).await.unwrap().unwrap();
        assert_eq!(
            stored.material.as_ref().unwrap().certificate_pem(),
            served
        );
        assert!(stored.renewed_at.is_none());
        assert_eq!(domain_entries(&storage), vec!["example.com"]);
    }
}
