//! In-memory record store

use std::collections::HashMap;

use async_trait::async_trait;
use certwarden_common::{CertificateId, CertificateStatus};
use parking_lot::Mutex;
use tracing::trace;

use super::{apply_promotion, sort_records, CertificateRecordStore, RecordQuery};
use crate::error::StoreError;
use crate::record::CertificateRecord;

/// Mutex-guarded map of records
///
/// Every operation runs under one lock, which makes compare-and-swap and
/// promotion atomic.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<CertificateId, CertificateRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl CertificateRecordStore for MemoryRecordStore {
    async fn insert(&self, record: &CertificateRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        if records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        records.insert(record.id, record.clone());
        trace!(certificate_id = %record.id, "Inserted record");
        Ok(())
    }

    async fn get(&self, id: CertificateId) -> Result<Option<CertificateRecord>, StoreError> {
        Ok(self.records.lock().get(&id).cloned())
    }

    async fn update(&self, record: &CertificateRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(record.id)),
        }
    }

    async fn compare_and_swap(
        &self,
        expected: CertificateStatus,
        record: &CertificateRecord,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let existing = records
            .get_mut(&record.id)
            .ok_or(StoreError::NotFound(record.id))?;

        if existing.status != expected {
            return Err(StoreError::Conflict {
                id: record.id,
                expected,
                actual: existing.status,
            });
        }

        *existing = record.clone();
        Ok(())
    }

    async fn promote(&self, id: CertificateId) -> Result<Option<CertificateRecord>, StoreError> {
        let mut records = self.records.lock();

        let mut target = records.get(&id).cloned().ok_or(StoreError::NotFound(id))?;
        let mut previous = records
            .values()
            .find(|r| {
                r.id != id && r.domain == target.domain && r.status == CertificateStatus::Active
            })
            .cloned();

        let superseded = apply_promotion(&mut target, previous.as_mut())?;

        records.insert(target.id, target);
        if let Some(previous) = &superseded {
            records.insert(previous.id, previous.clone());
        }

        Ok(superseded)
    }

    async fn delete(&self, id: CertificateId) -> Result<bool, StoreError> {
        Ok(self.records.lock().remove(&id).is_some())
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<CertificateRecord>, StoreError> {
        let mut matched: Vec<CertificateRecord> = self
            .records
            .lock()
            .values()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        sort_records(&mut matched);
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    #[tokio::test]
    async fn test_insert_get_delete() {
        conformance::insert_get_delete(&MemoryRecordStore::new()).await;
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        conformance::compare_and_swap(&MemoryRecordStore::new()).await;
    }

    #[tokio::test]
    async fn test_promote_supersedes() {
        conformance::promote_supersedes(&MemoryRecordStore::new()).await;
    }

    #[tokio::test]
    async fn test_query_filters() {
        let store = MemoryRecordStore::new();
        conformance::query_filters(&store).await;
        assert_eq!(store.len(), 3);
    }
}
