//! HTTP-01 style domain ownership proof
//!
//! Tokens are written below `<webroot>/.well-known/acme-challenge/` and
//! fetched back over plain HTTP from the domain itself. The same publishing
//! path serves key authorizations for the ACME authority.
//!
//! Every published token is owned by a [`TokenGuard`]; dropping the guard
//! removes the file, so no exit path leaves a token behind.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certwarden_common::DomainName;
use certwarden_config::{ChallengeConfig, DOMAIN_PLACEHOLDER};
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::error::LifecycleError;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Random bytes in a locally generated token (hex encoded on disk)
pub const TOKEN_BYTES: usize = 32;

/// Challenge server errors
#[derive(Error, Debug)]
pub enum ChallengeError {
    #[error("no HTTP response: {0}")]
    Unreachable(String),

    #[error("served content did not match the challenge token")]
    Mismatch,

    #[error("cannot publish challenge token under {path}: {source}")]
    Publish {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("challenge token '{0}' is not a valid file name")]
    InvalidToken(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl ChallengeError {
    /// Attach the domain and map into the lifecycle taxonomy
    pub fn for_domain(self, domain: &DomainName) -> LifecycleError {
        match self {
            ChallengeError::Unreachable(reason) => LifecycleError::DomainUnreachable {
                domain: domain.to_string(),
                reason,
            },
            ChallengeError::Mismatch => LifecycleError::ValidationMismatch {
                domain: domain.to_string(),
            },
            other => LifecycleError::issuance(domain, other),
        }
    }
}

// ============================================================================
// Web roots
// ============================================================================

/// Resolves the directory a domain's web server serves files from
pub trait WebRootResolver: Send + Sync + fmt::Debug {
    fn web_root(&self, domain: &DomainName) -> PathBuf;
}

/// `{domain}` substitution in a path template
#[derive(Debug, Clone)]
pub struct TemplateWebRoot {
    template: String,
}

impl TemplateWebRoot {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl WebRootResolver for TemplateWebRoot {
    fn web_root(&self, domain: &DomainName) -> PathBuf {
        PathBuf::from(self.template.replace(DOMAIN_PLACEHOLDER, domain.as_str()))
    }
}

// ============================================================================
// Token publishing
// ============================================================================

/// Places challenge content where the domain's web server serves it
#[async_trait]
pub trait TokenPublisher: Send + Sync {
    /// Publish `content` at the challenge path for `token`
    async fn publish(
        &self,
        domain: &DomainName,
        token: &str,
        content: &str,
    ) -> Result<TokenGuard, ChallengeError>;
}

/// A published token; the file is removed when the guard drops
#[must_use = "dropping the guard removes the challenge file"]
pub struct TokenGuard {
    path: PathBuf,
    token: String,
}

impl TokenGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(token = %self.token, "Removed challenge token"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove challenge token"
            ),
        }
    }
}

impl fmt::Debug for TokenGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGuard")
            .field("path", &self.path)
            .finish()
    }
}

// ============================================================================
// Challenge server
// ============================================================================

/// Publishes challenge tokens and probes domains over HTTP
///
/// Safe to use concurrently for different domains: each proof uses its own
/// random token file.
pub struct ChallengeServer {
    client: reqwest::Client,
    resolver: Arc<dyn WebRootResolver>,
    http_port: u16,
    probe_timeout: Duration,
    probe_addresses: BTreeMap<String, SocketAddr>,
}

impl ChallengeServer {
    pub fn new(
        config: &ChallengeConfig,
        resolver: Arc<dyn WebRootResolver>,
    ) -> Result<Self, ChallengeError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .connect_timeout(config.probe_timeout())
            .redirect(reqwest::redirect::Policy::limited(3))
            .no_proxy()
            .user_agent(concat!("certwarden/", env!("CARGO_PKG_VERSION")));

        for (domain, address) in &config.probe_addresses {
            builder = builder.resolve(domain, *address);
        }

        let client = builder
            .build()
            .map_err(|e| ChallengeError::Client(e.to_string()))?;

        Ok(Self {
            client,
            resolver,
            http_port: config.http_port,
            probe_timeout: config.probe_timeout(),
            probe_addresses: config.probe_addresses.clone(),
        })
    }

    /// Prove that `domain` serves our webroot
    ///
    /// Writes a fresh random token, fetches it back and compares the body
    /// exactly. Only a successful status with the exact token proves
    /// ownership. The token file is gone when this returns, whatever the
    /// outcome.
    pub async fn prove_ownership(&self, domain: &DomainName) -> Result<(), ChallengeError> {
        let token = generate_token();
        let guard = self.publish(domain, &token, &token).await?;

        let url = self.url_for(domain, &format!("{}{}", ACME_CHALLENGE_PREFIX, token));
        debug!(domain = %domain, url = %url, "Probing challenge token");

        let outcome = match self.fetch(&url).await {
            Ok(body) if body == token => {
                debug!(domain = %domain, "Ownership proven");
                Ok(())
            }
            Ok(_) => Err(ChallengeError::Mismatch),
            Err(e) => Err(e),
        };

        drop(guard);
        outcome
    }

    /// Check that `domain` answers plain HTTP at all
    ///
    /// Any response, including error statuses, counts as reachable.
    pub async fn preflight(&self, domain: &DomainName) -> Result<(), ChallengeError> {
        let url = self.url_for(domain, "/");
        trace!(domain = %domain, url = %url, "Pre-flight reachability probe");

        let response = self.client.get(&url).send().await.map_err(|e| self.describe(e))?;
        debug!(domain = %domain, status = %response.status(), "Domain is reachable");
        Ok(())
    }

    /// Directory challenge files for `domain` are written to
    pub fn challenge_dir(&self, domain: &DomainName) -> PathBuf {
        self.resolver
            .web_root(domain)
            .join(ACME_CHALLENGE_PREFIX.trim_matches('/'))
    }

    fn url_for(&self, domain: &DomainName, path: &str) -> String {
        let port = self
            .probe_addresses
            .get(domain.as_str())
            .map(SocketAddr::port)
            .unwrap_or(self.http_port);

        if port == 80 {
            format!("http://{}{}", domain, path)
        } else {
            format!("http://{}:{}{}", domain, port, path)
        }
    }

    async fn fetch(&self, url: &str) -> Result<String, ChallengeError> {
        let response = self.client.get(url).send().await.map_err(|e| self.describe(e))?;
        let status = response.status();
        trace!(url = %url, status = %status, "Challenge probe answered");

        if !status.is_success() {
            debug!(url = %url, status = %status, "Challenge probe was not served");
            return Err(ChallengeError::Mismatch);
        }
        response.text().await.map_err(|e| self.describe(e))
    }

    fn describe(&self, error: reqwest::Error) -> ChallengeError {
        if error.is_timeout() {
            ChallengeError::Unreachable(format!(
                "timed out after {}s",
                self.probe_timeout.as_secs()
            ))
        } else {
            ChallengeError::Unreachable(error.to_string())
        }
    }
}

#[async_trait]
impl TokenPublisher for ChallengeServer {
    async fn publish(
        &self,
        domain: &DomainName,
        token: &str,
        content: &str,
    ) -> Result<TokenGuard, ChallengeError> {
        if token.is_empty()
            || !token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ChallengeError::InvalidToken(token.to_string()));
        }

        let dir = self.challenge_dir(domain);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ChallengeError::Publish {
                path: dir.clone(),
                source,
            })?;

        let path = dir.join(token);
        // Guard first, so a failed write still cleans up a partial file
        let guard = TokenGuard {
            path: path.clone(),
            token: token.to_string(),
        };

        tokio::fs::write(&path, content)
            .await
            .map_err(|source| ChallengeError::Publish { path, source })?;

        debug!(domain = %domain, token = %token, "Published challenge token");
        Ok(guard)
    }
}

impl fmt::Debug for ChallengeServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeServer")
            .field("resolver", &self.resolver)
            .field("http_port", &self.http_port)
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
