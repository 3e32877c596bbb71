//! Installed certificate material and ACME account storage
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── accounts/
//! │   └── <directory-hash>.json   # ACME account credentials per directory URL
//! ├── domains/
//! │   ├── example.com/
//! │   │   ├── cert.pem            # Leaf certificate
//! │   │   ├── key.pem             # Private key (0600)
//! │   │   ├── chain.pem           # Intermediates, when present
//! │   │   ├── fullchain.pem       # Leaf followed by intermediates
//! │   │   └── meta.json           # Which record is installed
//! │   └── .staging-<id>/          # Written, not yet committed
//! └── records/                    # See FileRecordStore
//! ```
//!
//! Material is first written to a staging directory with [`MaterialStorage::stage`]
//! and only replaces the live directory on [`StagedInstall::commit`]. Dropping
//! an uncommitted stage removes it, so the live files always belong to the
//! record the store last activated.

use std::path::{Path, PathBuf};

use certwarden_common::{CertificateId, DomainName, ProviderKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, trace, warn};

use crate::error::StorageError;
use crate::record::CertificateRecord;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const CHAIN_FILE: &str = "chain.pem";
const FULLCHAIN_FILE: &str = "fullchain.pem";
const META_FILE: &str = "meta.json";

/// Metadata stored alongside installed material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledMeta {
    /// Record whose material is installed
    pub certificate_id: CertificateId,
    pub provider: ProviderKind,
    pub expires_at: Option<DateTime<Utc>>,
    pub installed_at: DateTime<Utc>,
}

/// Paths of installed material for one domain
#[derive(Debug, Clone)]
pub struct InstalledPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub fullchain: PathBuf,
}

impl InstalledPaths {
    fn under(dir: &Path) -> Self {
        Self {
            cert: dir.join(CERT_FILE),
            key: dir.join(KEY_FILE),
            fullchain: dir.join(FULLCHAIN_FILE),
        }
    }
}

/// Filesystem storage for installed material and account credentials
#[derive(Debug)]
pub struct MaterialStorage {
    base_path: PathBuf,
}

impl MaterialStorage {
    /// Open storage at `base_path`, creating the layout with 0700
    /// directories on Unix
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(base_path)?;

        let accounts_path = base_path.join("accounts");
        let domains_path = base_path.join("domains");
        std::fs::create_dir_all(&accounts_path)?;
        std::fs::create_dir_all(&domains_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(base_path, perms.clone())?;
            std::fs::set_permissions(&accounts_path, perms.clone())?;
            std::fs::set_permissions(&domains_path, perms)?;
        }

        info!(storage_path = %base_path.display(), "Initialized certificate storage");

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    // =========================================================================
    // Account Operations
    // =========================================================================

    fn account_path(&self, directory_url: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(directory_url.as_bytes()));
        self.base_path
            .join("accounts")
            .join(format!("{}.json", &digest[..16]))
    }

    /// Load raw credentials JSON for an ACME directory
    pub async fn load_account_credentials(
        &self,
        directory_url: &str,
    ) -> Result<Option<String>, StorageError> {
        let path = self.account_path(directory_url);

        match fs::read_to_string(&path).await {
            Ok(content) => {
                debug!(directory = %directory_url, "Loaded ACME credentials");
                Ok(Some(content))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(directory = %directory_url, "No stored ACME credentials found");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Save raw credentials JSON for an ACME directory
    pub async fn save_account_credentials(
        &self,
        directory_url: &str,
        json: &str,
    ) -> Result<(), StorageError> {
        let path = self.account_path(directory_url);
        write_private(&path, json.as_bytes()).await?;

        info!(directory = %directory_url, "Saved ACME credentials");
        Ok(())
    }

    // =========================================================================
    // Installed material
    // =========================================================================

    fn domain_path(&self, domain: &DomainName) -> PathBuf {
        self.base_path.join("domains").join(domain.as_str())
    }

    /// Write a record's material beside the live directory
    ///
    /// Nothing the web server reads changes until the returned stage is
    /// committed.
    pub async fn stage(&self, record: &CertificateRecord) -> Result<StagedInstall, StorageError> {
        let material = record.material.as_ref().ok_or_else(|| {
            StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("record {} has no material to install", record.id),
            ))
        })?;

        let domains = self.base_path.join("domains");
        let staged = StagedInstall {
            domain: record.domain.clone(),
            certificate_id: record.id,
            staging: domains.join(format!(".staging-{}", record.id)),
            retired: domains.join(format!(".retired-{}", record.id)),
            live: self.domain_path(&record.domain),
            committed: false,
        };

        // Leftover from an interrupted run
        remove_dir_if_exists(&staged.staging).await?;
        fs::create_dir_all(&staged.staging).await?;

        let paths = InstalledPaths::under(&staged.staging);
        write_private(&paths.key, material.private_key_pem().as_bytes()).await?;
        fs::write(&paths.cert, material.certificate_pem()).await?;
        if let Some(chain) = material.chain_pem() {
            fs::write(staged.staging.join(CHAIN_FILE), chain).await?;
        }
        fs::write(&paths.fullchain, material.fullchain_pem()).await?;

        let meta = InstalledMeta {
            certificate_id: record.id,
            provider: record.provider,
            expires_at: record.expires_at,
            installed_at: Utc::now(),
        };
        fs::write(
            staged.staging.join(META_FILE),
            serde_json::to_string_pretty(&meta)?,
        )
        .await?;

        debug!(domain = %record.domain, certificate_id = %record.id, "Staged certificate material");
        Ok(staged)
    }

    /// Metadata of what is installed for a domain
    pub async fn installed(
        &self,
        domain: &DomainName,
    ) -> Result<Option<InstalledMeta>, StorageError> {
        let meta_path = self.domain_path(domain).join(META_FILE);

        match fs::read_to_string(&meta_path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(domain = %domain, "Nothing installed");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Paths of installed material, when both certificate and key exist
    pub async fn installed_paths(
        &self,
        domain: &DomainName,
    ) -> Result<Option<InstalledPaths>, StorageError> {
        let paths = InstalledPaths::under(&self.domain_path(domain));

        if fs::try_exists(&paths.cert).await? && fs::try_exists(&paths.key).await? {
            Ok(Some(paths))
        } else {
            Ok(None)
        }
    }

    /// Remove installed material if it belongs to certificate `id`
    ///
    /// Returns whether anything was removed.
    pub async fn remove(&self, domain: &DomainName, id: CertificateId) -> Result<bool, StorageError> {
        match self.installed(domain).await? {
            Some(meta) if meta.certificate_id == id => {
                fs::remove_dir_all(self.domain_path(domain)).await?;
                info!(domain = %domain, certificate_id = %id, "Removed installed material");
                Ok(true)
            }
            Some(meta) => {
                debug!(
                    domain = %domain,
                    certificate_id = %id,
                    installed = %meta.certificate_id,
                    "Installed material belongs to another certificate, leaving it"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

/// Material written to disk but not yet served
#[must_use = "dropping an uncommitted stage discards it"]
pub struct StagedInstall {
    domain: DomainName,
    certificate_id: CertificateId,
    staging: PathBuf,
    retired: PathBuf,
    live: PathBuf,
    committed: bool,
}

impl StagedInstall {
    /// Swap the staged directory in for the live one
    ///
    /// On failure the previous live directory is put back.
    pub async fn commit(mut self) -> Result<InstalledPaths, StorageError> {
        remove_dir_if_exists(&self.retired).await?;

        let had_previous = fs::try_exists(&self.live).await?;
        if had_previous {
            fs::rename(&self.live, &self.retired).await?;
        }

        if let Err(e) = fs::rename(&self.staging, &self.live).await {
            if had_previous {
                if let Err(restore) = fs::rename(&self.retired, &self.live).await {
                    warn!(
                        domain = %self.domain,
                        error = %restore,
                        "Failed to restore previous certificate material"
                    );
                }
            }
            return Err(e.into());
        }
        self.committed = true;

        if had_previous {
            if let Err(e) = fs::remove_dir_all(&self.retired).await {
                warn!(
                    path = %self.retired.display(),
                    error = %e,
                    "Failed to remove replaced certificate material"
                );
            }
        }

        info!(
            domain = %self.domain,
            certificate_id = %self.certificate_id,
            "Installed certificate material"
        );
        Ok(InstalledPaths::under(&self.live))
    }
}

impl Drop for StagedInstall {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_dir_all(&self.staging) {
            Ok(()) => debug!(certificate_id = %self.certificate_id, "Discarded staged material"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.staging.display(),
                error = %e,
                "Failed to discard staged material"
            ),
        }
    }
}

impl std::fmt::Debug for StagedInstall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedInstall")
            .field("domain", &self.domain)
            .field("certificate_id", &self.certificate_id)
            .field("committed", &self.committed)
            .finish()
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), StorageError> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Write a file readable only by the owner
///
/// The file is created 0600 and narrowed again before any content is
/// written, so an existing wider file never holds the new content.
pub(crate) async fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await?;
    }

    file.write_all(content).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Domain, Material};
    use certwarden_common::CertificateStatus;
    use tempfile::TempDir;

    fn setup_storage() -> (TempDir, MaterialStorage) {
        let temp_dir = TempDir::new().unwrap();
        let storage = MaterialStorage::new(temp_dir.path()).unwrap();
        (temp_dir, storage)
    }

    fn record_with_material(name: &str, chain: Option<&str>) -> CertificateRecord {
        let domain = Domain::parse(name, "owner").unwrap();
        let mut record = CertificateRecord::pending(&domain, ProviderKind::SelfSigned);
        record.status = CertificateStatus::Active;
        record.expires_at = Some(Utc::now() + chrono::Duration::days(90));
        record.material = Some(
            Material::new("CERT\n", "KEY\n", chain.map(str::to_string)).unwrap(),
        );
        record
    }

    async fn install(storage: &MaterialStorage, record: &CertificateRecord) -> InstalledPaths {
        storage.stage(record).await.unwrap().commit().await.unwrap()
    }

    fn domains_entries(storage: &MaterialStorage) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(storage.base_path().join("domains"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_storage_creation() {
        let (_temp_dir, storage) = setup_storage();
        assert!(storage.base_path().join("domains").exists());
        assert!(storage.base_path().join("accounts").exists());
    }

    #[tokio::test]
    async fn test_account_credentials_per_directory() {
        let (_temp_dir, storage) = setup_storage();

        storage
            .save_account_credentials("https://acme.test/prod", r#"{"id": "prod"}"#)
            .await
            .unwrap();

        assert_eq!(
            storage
                .load_account_credentials("https://acme.test/prod")
                .await
                .unwrap()
                .as_deref(),
            Some(r#"{"id": "prod"}"#)
        );
        assert!(storage
            .load_account_credentials("https://acme.test/staging")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_install_writes_all_files() {
        let (_temp_dir, storage) = setup_storage();
        let record = record_with_material("example.com", Some("CHAIN\n"));

        let paths = install(&storage, &record).await;
        assert_eq!(std::fs::read_to_string(&paths.cert).unwrap(), "CERT\n");
        assert_eq!(std::fs::read_to_string(&paths.key).unwrap(), "KEY\n");
        assert_eq!(std::fs::read_to_string(&paths.fullchain).unwrap(), "CERT\nCHAIN\n");

        let meta = storage.installed(&record.domain).await.unwrap().unwrap();
        assert_eq!(meta.certificate_id, record.id);
        assert_eq!(domains_entries(&storage), vec!["example.com"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_private_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let (_temp_dir, storage) = setup_storage();
        let record = record_with_material("example.com", None);

        let paths = install(&storage, &record).await;
        let mode = std::fs::metadata(&paths.key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // A pre-existing world-readable file is narrowed, not reused as is
        let loose = storage.base_path().join("loose.json");
        std::fs::write(&loose, "old").unwrap();
        std::fs::set_permissions(&loose, std::fs::Permissions::from_mode(0o644)).unwrap();
        write_private(&loose, b"secret").await.unwrap();
        let mode = std::fs::metadata(&loose).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&loose).unwrap(), "secret");
    }

    #[tokio::test]
    async fn test_reinstall_without_chain_removes_stale_chain() {
        let (_temp_dir, storage) = setup_storage();
        let record = record_with_material("example.com", Some("CHAIN\n"));
        install(&storage, &record).await;

        let replacement = record_with_material("example.com", None);
        install(&storage, &replacement).await;

        let chain = storage.base_path().join("domains/example.com").join(CHAIN_FILE);
        assert!(!chain.exists());
        assert_eq!(
            storage
                .installed(&record.domain)
                .await
                .unwrap()
                .unwrap()
                .certificate_id,
            replacement.id
        );
        assert_eq!(domains_entries(&storage), vec!["example.com"]);
    }

    #[tokio::test]
    async fn test_dropped_stage_leaves_live_material() {
        let (_temp_dir, storage) = setup_storage();
        let current = record_with_material("example.com", None);
        install(&storage, &current).await;

        let next = record_with_material("example.com", Some("CHAIN\n"));
        let staged = storage.stage(&next).await.unwrap();
        drop(staged);

        let meta = storage.installed(&current.domain).await.unwrap().unwrap();
        assert_eq!(meta.certificate_id, current.id);
        assert_eq!(domains_entries(&storage), vec!["example.com"]);
    }

    #[tokio::test]
    async fn test_install_without_material_fails() {
        let (_temp_dir, storage) = setup_storage();
        let mut record = record_with_material("example.com", None);
        record.material = None;

        assert!(storage.stage(&record).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_only_matching_certificate() {
        let (_temp_dir, storage) = setup_storage();
        let record = record_with_material("example.com", None);
        install(&storage, &record).await;

        assert!(!storage
            .remove(&record.domain, CertificateId::new())
            .await
            .unwrap());
        assert!(storage.installed_paths(&record.domain).await.unwrap().is_some());

        assert!(storage.remove(&record.domain, record.id).await.unwrap());
        assert!(storage.installed_paths(&record.domain).await.unwrap().is_none());
        assert!(!storage.remove(&record.domain, record.id).await.unwrap());
    }
}
