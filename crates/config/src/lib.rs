//! Certwarden configuration
//!
//! Configuration is a KDL document. Every field has a default, so an empty
//! document is a valid configuration that issues self-signed certificates
//! only (CA-backed issuance needs an `acme` block with a contact email).
//!
//! ```kdl
//! storage "/var/lib/certwarden"
//! webroot "/srv/www/{domain}/public"
//!
//! acme {
//!     email "admin@example.com"
//! }
//!
//! renewal {
//!     window-days 30
//!     concurrency 4
//! }
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::{Validate, ValidationError as FieldError};

pub mod kdl;
pub mod validate;

pub use validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

/// Placeholder substituted with the domain name in `webroot`
pub const DOMAIN_PLACEHOLDER: &str = "{domain}";

/// Let's Encrypt production directory
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

// ============================================================================
// Top-level configuration
// ============================================================================

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Config {
    /// Directory holding records, installed material and ACME accounts
    pub storage: PathBuf,

    /// Per-domain document root template; `{domain}` is substituted
    #[validate(custom(function = "validate_webroot_template"))]
    pub webroot: String,

    /// ACME settings; CA-backed providers are unavailable without them
    #[validate(nested)]
    pub acme: Option<AcmeConfig>,

    #[validate(nested)]
    pub challenge: ChallengeConfig,

    #[validate(nested)]
    pub renewal: RenewalConfig,

    #[validate(nested)]
    pub self_signed: SelfSignedConfig,

    /// Command run after material is installed
    #[validate(nested)]
    pub reload_hook: Option<ReloadHookConfig>,

    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: PathBuf::from("/var/lib/certwarden"),
            webroot: "/var/www/{domain}".to_string(),
            acme: None,
            challenge: ChallengeConfig::default(),
            renewal: RenewalConfig::default(),
            self_signed: SelfSignedConfig::default(),
            reload_hook: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a KDL file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

        let config = Self::from_kdl(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;

        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration from KDL source
    pub fn from_kdl(content: &str) -> Result<Self> {
        let doc: ::kdl::KdlDocument = content.parse().map_err(|e: ::kdl::KdlError| {
            anyhow::anyhow!("KDL syntax error:\n{:?}", miette::Report::new(e))
        })?;

        let config = kdl::parse_document(&doc)?;
        debug!(
            storage = %config.storage.display(),
            acme = config.acme.is_some(),
            reload_hook = config.reload_hook.is_some(),
            "Parsed configuration document"
        );
        Ok(config)
    }

    /// Check field ranges and cross-field rules
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(|e| anyhow::anyhow!("{}", e))?;

        if self.renewal.operation_timeout_secs < self.challenge.probe_timeout_secs {
            anyhow::bail!(
                "renewal.operation-timeout-secs ({}) must not be shorter than \
                 challenge.probe-timeout-secs ({})",
                self.renewal.operation_timeout_secs,
                self.challenge.probe_timeout_secs
            );
        }

        Ok(())
    }
}

fn validate_webroot_template(template: &str) -> Result<(), FieldError> {
    if template.contains(DOMAIN_PLACEHOLDER) {
        Ok(())
    } else {
        let mut err = FieldError::new("webroot_placeholder");
        err.message = Some("webroot must contain the {domain} placeholder".into());
        Err(err)
    }
}

// ============================================================================
// Sections
// ============================================================================

/// ACME account and directory settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AcmeConfig {
    /// Account contact address
    #[validate(email)]
    pub email: String,

    #[validate(url)]
    pub production_directory: String,

    #[validate(url)]
    pub staging_directory: String,

    /// Upper bound for one order's challenge validation and finalization
    #[validate(range(min = 10, max = 3600))]
    pub order_timeout_secs: u64,
}

impl AcmeConfig {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            production_directory: LETSENCRYPT_PRODUCTION.to_string(),
            staging_directory: LETSENCRYPT_STAGING.to_string(),
            order_timeout_secs: default_order_timeout(),
        }
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }
}

/// Domain validation challenge settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChallengeConfig {
    /// Timeout of a single HTTP probe
    #[validate(range(min = 1, max = 60))]
    pub probe_timeout_secs: u64,

    /// Port probes connect to
    #[validate(range(min = 1))]
    pub http_port: u16,

    /// Addresses to probe instead of resolving the domain through DNS
    pub probe_addresses: BTreeMap<String, SocketAddr>,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout(),
            http_port: 80,
            probe_addresses: BTreeMap::new(),
        }
    }
}

impl ChallengeConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Renewal sweep settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RenewalConfig {
    /// Certificates expiring within this many days are renewed
    #[validate(range(min = 1, max = 365))]
    pub window_days: u32,

    /// Hours between sweeps in daemon mode
    #[validate(range(min = 1, max = 168))]
    pub interval_hours: u64,

    /// Domains renewed in parallel
    #[validate(range(min = 1, max = 64))]
    pub concurrency: usize,

    /// Ceiling for one domain's whole issuance or renewal
    #[validate(range(min = 1, max = 3600))]
    pub operation_timeout_secs: u64,

    /// How long the sweep waits for a busy domain before skipping it
    #[validate(range(max = 600))]
    pub lock_wait_secs: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            window_days: 30,
            interval_hours: 12,
            concurrency: 4,
            operation_timeout_secs: 300,
            lock_wait_secs: 30,
        }
    }
}

impl RenewalConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(u64::from(self.window_days) * 86_400)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 3600)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }
}

/// Self-signed generation settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SelfSignedConfig {
    #[validate(range(min = 1, max = 3650))]
    pub validity_days: u32,
}

impl Default for SelfSignedConfig {
    fn default() -> Self {
        Self { validity_days: 365 }
    }
}

/// Web-server reload notification
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReloadHookConfig {
    /// Program followed by its arguments
    #[validate(length(min = 1))]
    pub command: Vec<String>,

    #[validate(range(max = 10))]
    pub retries: u32,

    pub retry_delay_secs: u64,
}

impl ReloadHookConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

pub(crate) fn default_order_timeout() -> u64 {
    120
}

pub(crate) fn default_probe_timeout() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_webroot_requires_placeholder() {
        let config = Config {
            webroot: "/var/www/static".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_concurrency_range() {
        let mut config = Config::default();
        config.renewal.concurrency = 0;
        assert!(config.validate().is_err());

        config.renewal.concurrency = 65;
        assert!(config.validate().is_err());

        config.renewal.concurrency = 8;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_operation_timeout_must_cover_probe() {
        let mut config = Config::default();
        config.challenge.probe_timeout_secs = 30;
        config.renewal.operation_timeout_secs = 20;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("operation-timeout-secs"));
    }

    #[test]
    fn test_acme_email_validated() {
        let config = Config {
            acme: Some(AcmeConfig::new("not-an-email")),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            acme: Some(AcmeConfig::new("admin@example.com")),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
