//! ACME authority backed by `instant-acme`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certwarden_common::DomainName;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus, RevocationRequest,
};
use rustls::pki_types::CertificateDer;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{AuthorityError, CertificateAuthority};
use crate::challenge::{TokenGuard, TokenPublisher};
use crate::storage::MaterialStorage;

/// Delay between order status polls
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// ACME client for one directory
///
/// The account is restored from stored credentials or registered on first
/// use, then cached for the lifetime of the authority.
pub struct AcmeAuthority {
    directory_url: String,
    email: String,
    order_timeout: Duration,
    storage: Arc<MaterialStorage>,
    account: OnceCell<Account>,
}

impl AcmeAuthority {
    pub fn new(
        directory_url: impl Into<String>,
        email: impl Into<String>,
        order_timeout: Duration,
        storage: Arc<MaterialStorage>,
    ) -> Self {
        Self {
            directory_url: directory_url.into(),
            email: email.into(),
            order_timeout,
            storage,
            account: OnceCell::new(),
        }
    }

    async fn account(&self) -> Result<&Account, AuthorityError> {
        self.account
            .get_or_try_init(|| self.restore_or_register())
            .await
    }

    async fn restore_or_register(&self) -> Result<Account, AuthorityError> {
        if let Some(json) = self.storage.load_account_credentials(&self.directory_url).await? {
            let credentials: AccountCredentials = serde_json::from_str(&json)
                .map_err(|e| AuthorityError::Account(format!("stored credentials unreadable: {}", e)))?;

            let account = Account::from_credentials(credentials)
                .await
                .map_err(|e| AuthorityError::Account(e.to_string()))?;

            debug!(directory = %self.directory_url, "Restored ACME account");
            return Ok(account);
        }

        info!(
            email = %self.email,
            directory = %self.directory_url,
            "Registering new ACME account"
        );

        let contact = format!("mailto:{}", self.email);
        let contact_refs = [contact.as_str()];
        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let (account, credentials) = Account::create(&new_account, &self.directory_url, None)
            .await
            .map_err(|e| AuthorityError::Account(e.to_string()))?;

        let json = serde_json::to_string_pretty(&credentials)
            .map_err(|e| AuthorityError::Account(e.to_string()))?;
        self.storage
            .save_account_credentials(&self.directory_url, &json)
            .await?;

        info!(account = %account.id(), "Registered ACME account");
        Ok(account)
    }
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    fn endpoint(&self) -> &str {
        &self.directory_url
    }

    async fn order(
        &self,
        domain: &DomainName,
        csr_der: &[u8],
        publisher: &dyn TokenPublisher,
    ) -> Result<String, AuthorityError> {
        let account = self.account().await?;
        let deadline = Instant::now() + self.order_timeout;

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AuthorityError::Order(e.to_string()))?;

        debug!(domain = %domain, "Created ACME order");

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| AuthorityError::Order(e.to_string()))?;

        // Held until the order leaves the pending state
        let mut guards: Vec<TokenGuard> = Vec::new();

        for authorization in &authorizations {
            if authorization.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authorization
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    AuthorityError::Order(format!(
                        "no HTTP-01 challenge offered for {}",
                        domain
                    ))
                })?;

            let key_authorization = order.key_authorization(challenge);
            guards.push(
                publisher
                    .publish(domain, &challenge.token, key_authorization.as_str())
                    .await?,
            );

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| AuthorityError::Order(e.to_string()))?;

            debug!(domain = %domain, token = %challenge.token, "HTTP-01 challenge ready");
        }

        loop {
            if Instant::now() >= deadline {
                return Err(AuthorityError::Timeout(self.order_timeout));
            }

            order
                .refresh()
                .await
                .map_err(|e| AuthorityError::Order(e.to_string()))?;

            let state = order.state();
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    let reason = state
                        .error
                        .as_ref()
                        .map(|problem| format!("{:?}", problem))
                        .unwrap_or_else(|| "order became invalid".to_string());
                    return Err(AuthorityError::ChallengeRejected(reason));
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }

        drop(guards);

        if order.state().status != OrderStatus::Valid {
            order
                .finalize(csr_der)
                .await
                .map_err(|e| AuthorityError::Finalize(e.to_string()))?;
            debug!(domain = %domain, "Order finalized");
        }

        loop {
            if Instant::now() >= deadline {
                return Err(AuthorityError::Timeout(self.order_timeout));
            }

            match order.certificate().await {
                Ok(Some(chain)) => {
                    info!(domain = %domain, "Certificate issued by ACME authority");
                    return Ok(chain);
                }
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => return Err(AuthorityError::Finalize(e.to_string())),
            }
        }
    }

    async fn revoke(&self, certificate_der: &[u8]) -> Result<(), AuthorityError> {
        let account = self.account().await?;
        let certificate = CertificateDer::from(certificate_der.to_vec());

        account
            .revoke(&RevocationRequest {
                certificate: &certificate,
                reason: None,
            })
            .await
            .map_err(|e| {
                warn!(directory = %self.directory_url, error = %e, "ACME revocation failed");
                AuthorityError::Revoke(e.to_string())
            })
    }
}

impl std::fmt::Debug for AcmeAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeAuthority")
            .field("directory_url", &self.directory_url)
            .field("order_timeout", &self.order_timeout)
            .field("account_loaded", &self.account.initialized())
            .finish()
    }
}
