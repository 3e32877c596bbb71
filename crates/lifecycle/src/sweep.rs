//! Renewal sweep
//!
//! Finds active, auto-renewing certificates that expire within a window and
//! renews them over a bounded worker pool. Domains are independent: a
//! failure is recorded in the report and the rest carry on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use certwarden_common::{CertificateId, CertificateStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::error::LifecycleError;
use crate::locks::DomainLocks;
use crate::orchestrator::IssuanceOrchestrator;
use crate::store::{CertificateRecordStore, RecordQuery};

/// Default worker pool size
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default wait for a busy domain before skipping it
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);

/// Windows beyond this are treated as "everything"
const MAX_WINDOW_DAYS: i64 = 36_500;

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Certificates selected for renewal
    pub attempted: usize,
    /// Domains renewed
    pub succeeded: Vec<String>,
    /// Domain to failure reason
    pub failed: BTreeMap<String, String>,
    /// Domains busy with another operation
    pub skipped: Vec<String>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

enum Outcome {
    Renewed,
    Failed(String),
    Skipped,
}

pub struct RenewalSweep {
    store: Arc<dyn CertificateRecordStore>,
    orchestrator: Arc<IssuanceOrchestrator>,
    locks: Arc<DomainLocks>,
    concurrency: usize,
    lock_wait: Duration,
}

impl RenewalSweep {
    pub fn new(
        store: Arc<dyn CertificateRecordStore>,
        orchestrator: Arc<IssuanceOrchestrator>,
        locks: Arc<DomainLocks>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            locks,
            concurrency: DEFAULT_CONCURRENCY,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    /// Renew everything expiring within `window` from now
    pub async fn run(&self, window: Duration) -> Result<SweepReport, LifecycleError> {
        let window = chrono::Duration::from_std(window)
            .unwrap_or_else(|_| chrono::Duration::days(MAX_WINDOW_DAYS));
        let deadline = Utc::now() + window;
        let due = self.store.query(&RecordQuery::renewable(deadline)).await?;

        let mut report = SweepReport {
            attempted: due.len(),
            ..Default::default()
        };

        if due.is_empty() {
            debug!("No certificates due for renewal");
            return Ok(report);
        }

        info!(
            count = due.len(),
            concurrency = self.concurrency,
            "Renewing expiring certificates"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(due.len());

        for record in due {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };

            let domain = record.domain.clone();
            let store = Arc::clone(&self.store);
            let orchestrator = Arc::clone(&self.orchestrator);
            let locks = Arc::clone(&self.locks);
            let lock_wait = self.lock_wait;

            let handle = tokio::spawn(async move {
                let outcome =
                    renew_one(store.as_ref(), &orchestrator, &locks, lock_wait, record.id).await;
                drop(permit);
                outcome
            });
            handles.push((domain, handle));
        }

        for (domain, handle) in handles {
            match handle.await {
                Ok(Outcome::Renewed) => report.succeeded.push(domain.to_string()),
                Ok(Outcome::Failed(reason)) => {
                    report.failed.insert(domain.to_string(), reason);
                }
                Ok(Outcome::Skipped) => report.skipped.push(domain.to_string()),
                Err(e) => {
                    error!(domain = %domain, error = %e, "Renewal task panicked");
                    report.failed.insert(domain.to_string(), format!("renewal task failed: {}", e));
                }
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Renewal sweep finished"
        );

        Ok(report)
    }
}

async fn renew_one(
    store: &dyn CertificateRecordStore,
    orchestrator: &IssuanceOrchestrator,
    locks: &DomainLocks,
    lock_wait: Duration,
    id: CertificateId,
) -> Outcome {
    let record = match store.get(id).await {
        Ok(Some(record)) => record,
        Ok(None) => return Outcome::Failed(format!("certificate {} disappeared", id)),
        Err(e) => return Outcome::Failed(e.to_string()),
    };

    let Some(_guard) = locks.acquire_within(&record.domain, lock_wait).await else {
        warn!(domain = %record.domain, "Domain busy, skipping renewal");
        return Outcome::Skipped;
    };

    // Another operation may have finished while we waited
    let record = match store.get(id).await {
        Ok(Some(record))
            if record.status == CertificateStatus::Active && record.auto_renew =>
        {
            record
        }
        Ok(_) => {
            debug!(certificate_id = %id, "Certificate changed while waiting, skipping");
            return Outcome::Skipped;
        }
        Err(e) => return Outcome::Failed(e.to_string()),
    };

    match orchestrator.renew(&record).await {
        Ok(_) => Outcome::Renewed,
        Err(e) => Outcome::Failed(e.to_string()),
    }
}

impl std::fmt::Debug for RenewalSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalSweep")
            .field("concurrency", &self.concurrency)
            .field("lock_wait", &self.lock_wait)
            .finish()
    }
}
