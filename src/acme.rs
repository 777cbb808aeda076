//! ACME (Let's Encrypt) certificate issuance
//!
//! Uses HTTP-01 challenges. Key authorizations are published in the registry
//! under `<ns>/acme/challenge/<token>` rather than held in memory, so any
//! controller instance the proxy forwards `/.well-known/acme-challenge/` to
//! can answer them. The ACME account is created once and its credentials
//! stored at `<ns>/acme/account` for every instance to share.

use crate::certificate::certificate_expiry;
use crate::error::IssueError;
use crate::issuer::{CertificateIssuer, IssuedCertificate};
use crate::registry::{KeySpace, Registry};
use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_ATTEMPTS: u32 = 30;

pub struct AcmeIssuer {
    registry: Arc<dyn Registry>,
    keys: KeySpace,
    directory_url: String,
    email: String,
    account: OnceCell<Account>,
}

impl AcmeIssuer {
    pub fn new(registry: Arc<dyn Registry>, keys: KeySpace, directory_url: &str, email: &str) -> Self {
        Self {
            registry,
            keys,
            directory_url: directory_url.to_string(),
            email: email.to_string(),
            account: OnceCell::new(),
        }
    }

    async fn account(&self) -> anyhow::Result<&Account> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    /// Load the shared account from the registry or register a new one
    async fn load_or_create_account(&self) -> anyhow::Result<Account> {
        let key = self.keys.acme_account();

        if let Some(pair) = self.registry.kv_get(&key, false).await?.into_iter().next() {
            debug!(key = %key, "Loading existing ACME account");
            let credentials: AccountCredentials = serde_json::from_slice(&pair.value)?;
            let account = Account::from_credentials(credentials).await?;
            return Ok(account);
        }

        info!(directory = %self.directory_url, "Creating new ACME account");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", self.email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        let data = serde_json::to_vec(&credentials)?;
        self.registry.kv_put(&key, &data).await?;
        info!(key = %key, "ACME account credentials saved");

        Ok(account)
    }

    /// Run one order to completion. Tokens of every published challenge are
    /// pushed to `published` so the caller can clean them up on any outcome.
    async fn obtain(
        &self,
        domains: &[String],
        published: &mut Vec<String>,
    ) -> anyhow::Result<IssuedCertificate> {
        let account = self.account().await?;
        let identifiers: Vec<Identifier> = domains.iter().map(|d| Identifier::Dns(d.clone())).collect();

        info!(domains = ?domains, "Requesting new certificate");

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;

        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let identifier = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow::anyhow!("HTTP-01 challenge not offered for {}", identifier))?;

            let key_auth = order.key_authorization(challenge);
            debug!(domain = %identifier, token = %challenge.token, "Publishing HTTP-01 challenge");
            self.registry
                .kv_put(
                    &self.keys.acme_challenge(&challenge.token),
                    key_auth.as_str().as_bytes(),
                )
                .await?;
            published.push(challenge.token.clone());

            order.set_challenge_ready(&challenge.url).await?;
            wait_for_authorization(&mut order, &identifier).await?;
        }

        wait_for_order_ready(&mut order).await?;

        let mut params = CertificateParams::new(domains.to_vec())?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, domains[0].clone());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;

        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let certificate_pem: String = loop {
            order.refresh().await?;
            let status = order.state().status;

            match status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("Order valid but no certificate returned");
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > POLL_ATTEMPTS {
                        anyhow::bail!("Certificate timeout");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                _ => anyhow::bail!("Unexpected order status: {:?}", status),
            }
        };

        let expires_at = certificate_expiry(&certificate_pem)?;
        info!(domains = ?domains, expires_at, "Certificate obtained successfully");

        Ok(IssuedCertificate {
            private_key_pem: private_key.serialize_pem(),
            certificate_pem,
            expires_at,
        })
    }
}

async fn wait_for_authorization(order: &mut Order, identifier: &str) -> anyhow::Result<()> {
    let mut attempts = 0;
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;

        order.refresh().await?;
        let auths = order.authorizations().await?;
        let current = auths
            .iter()
            .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == identifier));

        match current.map(|a| &a.status) {
            Some(AuthorizationStatus::Valid) => {
                info!(domain = %identifier, "Authorization valid");
                return Ok(());
            }
            Some(AuthorizationStatus::Pending) => {
                attempts += 1;
                if attempts > POLL_ATTEMPTS {
                    anyhow::bail!("Authorization timeout for {}", identifier);
                }
                debug!(domain = %identifier, attempt = attempts, "Waiting for authorization");
            }
            Some(AuthorizationStatus::Invalid) => {
                anyhow::bail!("Authorization failed for {}", identifier);
            }
            Some(status) => {
                debug!(domain = %identifier, status = ?status, "Authorization status");
            }
            None => {
                anyhow::bail!("Authorization not found for {}", identifier);
            }
        }
    }
}

async fn wait_for_order_ready(order: &mut Order) -> anyhow::Result<()> {
    let mut attempts = 0;
    loop {
        let status = order.state().status;
        match status {
            OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
            OrderStatus::Invalid => anyhow::bail!("Order invalid"),
            OrderStatus::Pending | OrderStatus::Processing => {
                attempts += 1;
                if attempts > POLL_ATTEMPTS {
                    anyhow::bail!("Order timeout");
                }
                tokio::time::sleep(POLL_INTERVAL).await;
                order.refresh().await?;
            }
        }
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    fn name(&self) -> &'static str {
        "acme"
    }

    async fn issue(&self, domains: &[String]) -> Result<IssuedCertificate, IssueError> {
        if domains.is_empty() {
            return Err(IssueError::NoDomains);
        }

        let mut published = Vec::new();
        let result = self.obtain(domains, &mut published).await;

        for token in published {
            if let Err(e) = self.registry.kv_delete(&self.keys.acme_challenge(&token), false).await {
                warn!(token = %token, error = %e, "Failed to remove ACME challenge");
            }
        }

        result.map_err(|e| IssueError::Authority(format!("{:#}", e)))
    }
}
