//! Certificate record stores
//!
//! The lifecycle core only talks to [`CertificateRecordStore`]. Status
//! transitions go through [`compare_and_swap`] and [`promote`] so that two
//! writers can never both activate a certificate for the same domain.
//!
//! [`compare_and_swap`]: CertificateRecordStore::compare_and_swap
//! [`promote`]: CertificateRecordStore::promote

mod file;
mod memory;

use async_trait::async_trait;
use certwarden_common::{CertificateId, CertificateStatus, DomainName};
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::record::CertificateRecord;

pub use file::FileRecordStore;
pub use memory::MemoryRecordStore;

/// Filter for [`CertificateRecordStore::query`]; `None` fields match anything
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub domain: Option<DomainName>,
    pub status: Option<CertificateStatus>,
    pub auto_renew: Option<bool>,
    /// Matches records whose `expires_at` is at or before this instant
    pub expires_before: Option<DateTime<Utc>>,
}

impl RecordQuery {
    pub fn all() -> Self {
        Self::default()
    }

    /// Active, auto-renewing records expiring at or before `deadline`
    pub fn renewable(deadline: DateTime<Utc>) -> Self {
        Self {
            domain: None,
            status: Some(CertificateStatus::Active),
            auto_renew: Some(true),
            expires_before: Some(deadline),
        }
    }

    pub fn for_domain(domain: DomainName) -> Self {
        Self {
            domain: Some(domain),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &CertificateRecord) -> bool {
        if let Some(domain) = &self.domain {
            if &record.domain != domain {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(auto_renew) = self.auto_renew {
            if record.auto_renew != auto_renew {
                return false;
            }
        }
        if let Some(deadline) = self.expires_before {
            match record.expires_at {
                Some(expires) if expires <= deadline => {}
                _ => return false,
            }
        }
        true
    }
}

/// Persistence for certificate records
#[async_trait]
pub trait CertificateRecordStore: Send + Sync {
    /// Insert a new record; fails if the id exists
    async fn insert(&self, record: &CertificateRecord) -> Result<(), StoreError>;

    async fn get(&self, id: CertificateId) -> Result<Option<CertificateRecord>, StoreError>;

    /// Replace an existing record unconditionally
    async fn update(&self, record: &CertificateRecord) -> Result<(), StoreError>;

    /// Replace a record only if its stored status is still `expected`
    async fn compare_and_swap(
        &self,
        expected: CertificateStatus,
        record: &CertificateRecord,
    ) -> Result<(), StoreError>;

    /// Atomically activate pending record `id` and revoke any other active
    /// record for its domain, returning the superseded record
    async fn promote(&self, id: CertificateId) -> Result<Option<CertificateRecord>, StoreError>;

    /// Delete a record; returns whether it existed
    async fn delete(&self, id: CertificateId) -> Result<bool, StoreError>;

    /// Records matching `query`, oldest first
    async fn query(&self, query: &RecordQuery) -> Result<Vec<CertificateRecord>, StoreError>;

    async fn list(&self) -> Result<Vec<CertificateRecord>, StoreError> {
        self.query(&RecordQuery::all()).await
    }

    /// The active record for a domain, if any
    async fn find_active(
        &self,
        domain: &DomainName,
    ) -> Result<Option<CertificateRecord>, StoreError> {
        let query = RecordQuery {
            status: Some(CertificateStatus::Active),
            ..RecordQuery::for_domain(domain.clone())
        };
        Ok(self.query(&query).await?.into_iter().next())
    }
}

/// Apply a promotion to in-memory copies of the records
///
/// `target` must be pending. Returns the superseded record, already
/// modified, for the caller to persist.
pub(crate) fn apply_promotion(
    target: &mut CertificateRecord,
    current_active: Option<&mut CertificateRecord>,
) -> Result<Option<CertificateRecord>, StoreError> {
    if target.status != CertificateStatus::Pending {
        return Err(StoreError::Conflict {
            id: target.id,
            expected: CertificateStatus::Pending,
            actual: target.status,
        });
    }

    target.status = CertificateStatus::Active;
    target.touch();

    Ok(current_active.map(|previous| {
        previous.mark_revoked();
        previous.superseded_by = Some(target.id);
        previous.clone()
    }))
}

/// Sort by creation time so listings are stable across stores
pub(crate) fn sort_records(records: &mut [CertificateRecord]) {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}
