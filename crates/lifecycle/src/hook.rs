//! Web-server reload notification
//!
//! Hooks run after material is installed. [`HookDispatcher::dispatch`]
//! retries in a spawned task and a failure never touches the certificate
//! record. Dispatched tasks are tracked; a process about to exit awaits
//! [`HookDispatcher::drain`] so no notification is cut short.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certwarden_common::DomainName;
use certwarden_config::ReloadHookConfig;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Environment variable carrying the domain to the hook command
pub const DOMAIN_ENV: &str = "CERTWARDEN_DOMAIN";

#[derive(Error, Debug)]
pub enum HookError {
    #[error("failed to start reload command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("reload command exited with {0}")]
    Failed(std::process::ExitStatus),

    #[error("{0}")]
    Other(String),
}

/// Tells the web server that material for a domain changed
#[async_trait]
pub trait ReloadHook: Send + Sync {
    async fn notify(&self, domain: &DomainName) -> Result<(), HookError>;
}

/// Hook that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReloadHook;

#[async_trait]
impl ReloadHook for NoopReloadHook {
    async fn notify(&self, domain: &DomainName) -> Result<(), HookError> {
        debug!(domain = %domain, "No reload hook configured");
        Ok(())
    }
}

/// Runs a command; non-zero exit is a failure
#[derive(Debug, Clone)]
pub struct CommandReloadHook {
    program: String,
    args: Vec<String>,
}

impl CommandReloadHook {
    /// `command` is the program followed by its arguments
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl ReloadHook for CommandReloadHook {
    async fn notify(&self, domain: &DomainName) -> Result<(), HookError> {
        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env(DOMAIN_ENV, domain.as_str())
            .kill_on_drop(true)
            .status()
            .await?;

        if status.success() {
            Ok(())
        } else {
            Err(HookError::Failed(status))
        }
    }
}

/// Runs a hook out of band with bounded retries
///
/// Clones share the set of in-flight notifications.
#[derive(Clone)]
pub struct HookDispatcher {
    hook: Arc<dyn ReloadHook>,
    retries: u32,
    retry_delay: Duration,
    in_flight: Arc<Mutex<JoinSet<bool>>>,
}

impl HookDispatcher {
    pub fn new(hook: Arc<dyn ReloadHook>, retries: u32, retry_delay: Duration) -> Self {
        Self {
            hook,
            retries,
            retry_delay,
            in_flight: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopReloadHook), 0, Duration::ZERO)
    }

    pub fn from_config(config: Option<&ReloadHookConfig>) -> Self {
        match config.and_then(|c| CommandReloadHook::new(&c.command).map(|hook| (c, hook))) {
            Some((config, hook)) => Self::new(Arc::new(hook), config.retries, config.retry_delay()),
            None => Self::noop(),
        }
    }

    /// Notify in the background
    pub fn dispatch(&self, domain: DomainName) {
        let dispatcher = self.clone();
        let mut in_flight = self.in_flight.lock();

        // Reap finished notifications so a long-running daemon stays bounded
        while in_flight.try_join_next().is_some() {}

        in_flight.spawn(async move { dispatcher.notify_with_retries(&domain).await });
    }

    /// Wait for every dispatched notification to finish
    ///
    /// Returns how many gave up without a successful attempt.
    pub async fn drain(&self) -> usize {
        let mut pending = std::mem::take(&mut *self.in_flight.lock());
        let mut failed = 0;

        while let Some(result) = pending.join_next().await {
            match result {
                Ok(true) => {}
                Ok(false) => failed += 1,
                Err(e) => {
                    error!(error = %e, "Reload hook task did not complete");
                    failed += 1;
                }
            }
        }

        failed
    }

    async fn notify_with_retries(&self, domain: &DomainName) -> bool {
        let attempts = self.retries + 1;

        for attempt in 1..=attempts {
            match self.hook.notify(domain).await {
                Ok(()) => {
                    info!(domain = %domain, attempt, "Reload hook succeeded");
                    return true;
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        domain = %domain,
                        attempt,
                        error = %e,
                        "Reload hook failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    error!(
                        domain = %domain,
                        attempts,
                        error = %e,
                        "Reload hook failed; installed material is not yet served"
                    );
                }
            }
        }

        false
    }
}

impl std::fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookDispatcher")
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}
