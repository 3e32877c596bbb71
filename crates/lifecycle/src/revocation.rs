//! Revocation
//!
//! Upstream revoke for CA-backed certificates, then local cleanup for all
//! providers. Local cleanup happens even when the authority refuses, so a
//! revoked record never keeps material on disk.

use std::sync::Arc;

use certwarden_common::CertificateStatus;
use tracing::{info, warn};

use crate::error::LifecycleError;
use crate::provider::ProviderRegistry;
use crate::record::CertificateRecord;
use crate::storage::MaterialStorage;
use crate::store::CertificateRecordStore;

pub struct RevocationWorkflow {
    store: Arc<dyn CertificateRecordStore>,
    providers: Arc<ProviderRegistry>,
    storage: Arc<MaterialStorage>,
}

impl RevocationWorkflow {
    pub fn new(
        store: Arc<dyn CertificateRecordStore>,
        providers: Arc<ProviderRegistry>,
        storage: Arc<MaterialStorage>,
    ) -> Self {
        Self {
            store,
            providers,
            storage,
        }
    }

    /// Revoke `record`; pending and already revoked records are left as is
    pub async fn revoke(&self, record: &CertificateRecord) -> Result<CertificateRecord, LifecycleError> {
        match record.status {
            CertificateStatus::Pending | CertificateStatus::Revoked => {
                info!(
                    certificate_id = %record.id,
                    status = %record.status,
                    "Nothing to revoke"
                );
                return Ok(record.clone());
            }
            CertificateStatus::Active | CertificateStatus::Error => {}
        }

        let upstream = if record.provider.is_ca_backed() && record.material.is_some() {
            match self.providers.get(record.provider) {
                Ok(provider) => provider.revoke(record).await.err(),
                Err(e) => Some(e),
            }
        } else {
            None
        };

        if self.storage.remove(&record.domain, record.id).await? {
            info!(domain = %record.domain, certificate_id = %record.id, "Removed installed material");
        }

        let mut revoked = record.clone();
        revoked.mark_revoked();
        self.store.compare_and_swap(record.status, &revoked).await?;

        match upstream {
            None => {
                info!(domain = %revoked.domain, certificate_id = %revoked.id, "Certificate revoked");
                Ok(revoked)
            }
            Some(e) => {
                warn!(
                    domain = %revoked.domain,
                    certificate_id = %revoked.id,
                    error = %e,
                    "Upstream revocation failed; local material removed, manual follow-up required"
                );
                Err(match e {
                    e @ LifecycleError::Revocation { .. } => e,
                    other => LifecycleError::Revocation {
                        domain: revoked.domain.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CertificateProvider, IssueRequest};
    use crate::record::{Domain, Material};
    use crate::store::MemoryRecordStore;
    use async_trait::async_trait;
    use certwarden_common::ProviderKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// CA stand-in whose upstream revoke always fails
    #[derive(Default)]
    struct RefusingCa {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CertificateProvider for RefusingCa {
        fn kind(&self) -> ProviderKind {
            ProviderKind::CaProduction
        }

        async fn issue(&self, request: IssueRequest<'_>) -> Result<Material, LifecycleError> {
            Err(LifecycleError::issuance(request.domain, "unused"))
        }

        async fn renew(&self, existing: &CertificateRecord) -> Result<Material, LifecycleError> {
            Err(LifecycleError::issuance(&existing.domain, "unused"))
        }

        async fn revoke(&self, existing: &CertificateRecord) -> Result<(), LifecycleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(LifecycleError::Revocation {
                domain: existing.domain.to_string(),
                reason: "unauthorized".into(),
            })
        }
    }

    fn active_record(kind: ProviderKind) -> CertificateRecord {
        let domain = Domain::parse("example.com", "owner").unwrap();
        let material = crate::provider::SelfSignedProvider::default()
            .generate(&domain.name)
            .unwrap();
        let info = crate::introspect::parse(material.certificate_pem().as_bytes()).unwrap();

        let mut record = CertificateRecord::pending(&domain, kind);
        record.install_material(material, &info);
        record.status = CertificateStatus::Active;
        record
    }

    async fn setup(
        registry: ProviderRegistry,
        record: &CertificateRecord,
    ) -> (TempDir, Arc<MemoryRecordStore>, Arc<MaterialStorage>, RevocationWorkflow) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryRecordStore::new());
        let storage = Arc::new(MaterialStorage::new(dir.path()).unwrap());
        store.insert(record).await.unwrap();
        if record.material.is_some() {
            storage.stage(record).await.unwrap().commit().await.unwrap();
        }

        let workflow = RevocationWorkflow::new(store.clone(), Arc::new(registry), storage.clone());
        (dir, store, storage, workflow)
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let record = active_record(ProviderKind::SelfSigned);
        let (_dir, store, storage, workflow) = setup(ProviderRegistry::new(), &record).await;

        let first = workflow.revoke(&record).await.unwrap();
        assert_eq!(first.status, CertificateStatus::Revoked);
        assert!(first.material.is_none());
        assert!(storage.installed(&record.domain).await.unwrap().is_none());

        let stored = store.get(record.id).await.unwrap().unwrap();
        let second = workflow.revoke(&stored).await.unwrap();
        assert_eq!(second.status, CertificateStatus::Revoked);
    }

    #[tokio::test]
    async fn test_upstream_failure_still_cleans_up() {
        let record = active_record(ProviderKind::CaProduction);
        let ca = Arc::new(RefusingCa::default());
        let (_dir, store, storage, workflow) =
            setup(ProviderRegistry::new().with(ca.clone()), &record).await;

        let err = workflow.revoke(&record).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Revocation { .. }));
        assert_eq!(ca.calls.load(Ordering::SeqCst), 1);

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CertificateStatus::Revoked);
        assert!(stored.material.is_none());
        assert!(storage.installed(&record.domain).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_error_record_becomes_revoked_without_upstream_call() {
        let mut record = active_record(ProviderKind::CaProduction);
        record.mark_failed("order rejected");
        let ca = Arc::new(RefusingCa::default());
        let (_dir, store, _storage, workflow) =
            setup(ProviderRegistry::new().with(ca.clone()), &record).await;

        let revoked = workflow.revoke(&record).await.unwrap();
        assert_eq!(revoked.status, CertificateStatus::Revoked);
        assert_eq!(ca.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.get(record.id).await.unwrap().unwrap().status,
            CertificateStatus::Revoked
        );
    }

    #[tokio::test]
    async fn test_pending_is_noop() {
        let domain = Domain::parse("example.com", "owner").unwrap();
        let record = CertificateRecord::pending(&domain, ProviderKind::SelfSigned);
        let (_dir, store, _storage, workflow) = setup(ProviderRegistry::new(), &record).await;

        let result = workflow.revoke(&record).await.unwrap();
        assert_eq!(result.status, CertificateStatus::Pending);
        assert_eq!(
            store.get(record.id).await.unwrap().unwrap().status,
            CertificateStatus::Pending
        );
    }
}
