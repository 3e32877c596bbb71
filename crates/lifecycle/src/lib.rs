//! Certwarden: TLS certificate lifecycle management
//!
//! Issues, validates, installs, renews and revokes certificates for a set of
//! managed domains.
//!
//! # Architecture
//!
//! - [`introspect`] parses certificate material into [`CertificateInfo`]
//! - [`challenge::ChallengeServer`] proves that a domain is served from our webroot
//! - [`provider`] holds the three issuance strategies behind [`CertificateProvider`]
//! - [`orchestrator::IssuanceOrchestrator`] drives issue and renew for one domain
//! - [`sweep::RenewalSweep`] renews expiring certificates with bounded concurrency
//! - [`revocation::RevocationWorkflow`] revokes upstream and removes local material
//! - [`service::CertificateService`] is the facade the CLI and embedders call
//!
//! Records live behind the [`CertificateRecordStore`] trait; installed files
//! are managed by [`MaterialStorage`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use certwarden::{CertificateService, Domain, MemoryRecordStore};
//! use certwarden_common::ProviderKind;
//! use certwarden_config::Config;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = Config::default();
//! let service = CertificateService::from_config(&config, Arc::new(MemoryRecordStore::new()))?;
//!
//! let domain = Domain::parse("example.com", "owner-1")?;
//! let summary = service
//!     .issue_certificate(domain, ProviderKind::SelfSigned, None)
//!     .await?;
//! println!("{} expires at {:?}", summary.domain, summary.expires_at);
//! # Ok(())
//! # }
//! ```

pub mod authority;
pub mod challenge;
pub mod error;
pub mod hook;
pub mod introspect;
pub mod locks;
pub mod orchestrator;
pub mod provider;
pub mod record;
pub mod revocation;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod store;
pub mod sweep;

pub use authority::{AuthorityError, CertificateAuthority};
pub use challenge::{ChallengeError, ChallengeServer, TemplateWebRoot, TokenPublisher, WebRootResolver};
pub use error::{LifecycleError, StorageError, StoreError};
pub use hook::{CommandReloadHook, HookDispatcher, NoopReloadHook, ReloadHook};
pub use introspect::CertificateInfo;
pub use locks::DomainLocks;
pub use provider::{CertificateProvider, IssueRequest, ProviderRegistry};
pub use record::{CertificateDetail, CertificateRecord, CertificateSummary, Domain, Material};
pub use scheduler::RenewalScheduler;
pub use service::CertificateService;
pub use storage::MaterialStorage;
pub use store::{CertificateRecordStore, FileRecordStore, MemoryRecordStore, RecordQuery};
pub use sweep::{RenewalSweep, SweepReport};
