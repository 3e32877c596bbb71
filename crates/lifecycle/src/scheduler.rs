//! Background renewal scheduler
//!
//! Runs a [`RenewalSweep`] shortly after start-up and then on a fixed
//! interval until shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::sweep::{RenewalSweep, SweepReport};

/// Default sweep interval (12 hours)
const DEFAULT_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Minimum sweep interval (1 hour)
const MIN_INTERVAL: Duration = Duration::from_secs(3600);

/// Delay before the first sweep
const DEFAULT_STARTUP_DELAY: Duration = Duration::from_secs(10);

/// Default renewal window (30 days)
const DEFAULT_WINDOW: Duration = Duration::from_secs(30 * 86400);

/// Periodically renews expiring certificates
///
/// Holds no state of its own between runs; everything it needs comes from
/// the record store on each sweep.
pub struct RenewalScheduler {
    sweep: Arc<RenewalSweep>,
    interval: Duration,
    window: Duration,
    startup_delay: Duration,
}

impl RenewalScheduler {
    pub fn new(sweep: Arc<RenewalSweep>) -> Self {
        Self {
            sweep,
            interval: DEFAULT_INTERVAL,
            window: DEFAULT_WINDOW,
            startup_delay: DEFAULT_STARTUP_DELAY,
        }
    }

    /// Set the sweep interval
    ///
    /// The interval is clamped to a minimum of 1 hour.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!(
            interval_hours = self.interval.as_secs() / 3600,
            window_days = self.window.as_secs() / 86400,
            "Starting renewal scheduler"
        );

        tokio::select! {
            _ = tokio::time::sleep(self.startup_delay) => {}
            _ = &mut shutdown => {
                info!("Renewal scheduler stopped before first sweep");
                return;
            }
        }

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Running scheduled renewal sweep");
                    self.sweep_once().await;
                }
                _ = &mut shutdown => {
                    info!("Renewal scheduler stopped");
                    return;
                }
            }
        }
    }

    /// One sweep with the configured window; errors are logged
    pub async fn sweep_once(&self) -> Option<SweepReport> {
        match self.sweep.run(self.window).await {
            Ok(report) => {
                for (domain, reason) in &report.failed {
                    warn!(domain = %domain, reason = %reason, "Scheduled renewal failed");
                }
                Some(report)
            }
            Err(e) => {
                error!(error = %e, "Renewal sweep failed");
                None
            }
        }
    }
}
