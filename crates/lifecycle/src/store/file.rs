//! JSON-file record store
//!
//! One document per record under `<storage>/records/<id>.json`. Writes go
//! to a temporary file that is renamed into place, and all mutations are
//! serialized through a single lock, so one process sees atomic
//! compare-and-swap and promotion.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use certwarden_common::{CertificateId, CertificateStatus};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{apply_promotion, sort_records, CertificateRecordStore, RecordQuery};
use crate::error::StoreError;
use crate::storage::write_private;
use crate::record::CertificateRecord;

const RECORD_EXTENSION: &str = "json";

#[derive(Debug)]
pub struct FileRecordStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRecordStore {
    /// Open the store under `<storage>/records`, creating it if needed
    pub async fn open(storage: &Path) -> Result<Self, StoreError> {
        let dir = storage.join("records");
        tokio::fs::create_dir_all(&dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).await?;
        }

        info!(path = %dir.display(), "Opened record store");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, id: CertificateId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    async fn read(&self, id: CertificateId) -> Result<Option<CertificateRecord>, StoreError> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, record: &CertificateRecord) -> Result<(), StoreError> {
        let path = self.path_for(record.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)?;

        // Records carry private keys
        write_private(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(certificate_id = %record.id, status = %record.status, "Wrote record");
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<CertificateRecord>, StoreError> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }

            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<CertificateRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Skipping unreadable record"
                ),
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl CertificateRecordStore for FileRecordStore {
    async fn insert(&self, record: &CertificateRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if self.read(record.id).await?.is_some() {
            return Err(StoreError::Duplicate(record.id));
        }
        self.write(record).await
    }

    async fn get(&self, id: CertificateId) -> Result<Option<CertificateRecord>, StoreError> {
        self.read(id).await
    }

    async fn update(&self, record: &CertificateRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if self.read(record.id).await?.is_none() {
            return Err(StoreError::NotFound(record.id));
        }
        self.write(record).await
    }

    async fn compare_and_swap(
        &self,
        expected: CertificateStatus,
        record: &CertificateRecord,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let existing = self
            .read(record.id)
            .await?
            .ok_or(StoreError::NotFound(record.id))?;

        if existing.status != expected {
            return Err(StoreError::Conflict {
                id: record.id,
                expected,
                actual: existing.status,
            });
        }

        self.write(record).await
    }

    async fn promote(&self, id: CertificateId) -> Result<Option<CertificateRecord>, StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut target = self.read(id).await?.ok_or(StoreError::NotFound(id))?;
        let mut previous = self.read_all().await?.into_iter().find(|r| {
            r.id != id && r.domain == target.domain && r.status == CertificateStatus::Active
        });

        let superseded = apply_promotion(&mut target, previous.as_mut())?;

        // Retire the old record first so a crash never leaves two active
        if let Some(previous) = &superseded {
            self.write(previous).await?;
        }
        self.write(&target).await?;

        Ok(superseded)
    }

    async fn delete(&self, id: CertificateId) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<CertificateRecord>, StoreError> {
        let mut matched: Vec<CertificateRecord> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|record| query.matches(record))
            .collect();
        sort_records(&mut matched);
        Ok(matched)
    }
}
