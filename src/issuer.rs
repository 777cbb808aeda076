//! Certificate issuance
//!
//! [`CertificateIssuer`] is the capability the certificate manager calls to
//! turn a domain list into key material. Two variants exist: the ACME issuer
//! in [`crate::acme`] and the local [`SelfSignedIssuer`]. Calls go through an
//! [`IssuerPool`] that bounds concurrency and detaches each issuance from
//! its caller.

use crate::certificate::certificate_expiry;
use crate::error::IssueError;
use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, Utc};
use rcgen::{date_time_ymd, CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Key material returned by an issuer
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub private_key_pem: String,
    /// Leaf certificate first, followed by any intermediates
    pub certificate_pem: String,
    /// Unix timestamp of the leaf's notAfter
    pub expires_at: i64,
}

#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    async fn issue(&self, domains: &[String]) -> Result<IssuedCertificate, IssueError>;
}

/// Issues self-signed certificates with rcgen
pub struct SelfSignedIssuer {
    validity_days: i64,
}

impl SelfSignedIssuer {
    pub fn new(validity_days: i64) -> Self {
        Self { validity_days }
    }
}

impl Default for SelfSignedIssuer {
    fn default() -> Self {
        Self::new(3650)
    }
}

#[async_trait]
impl CertificateIssuer for SelfSignedIssuer {
    fn name(&self) -> &'static str {
        "self-signed"
    }

    async fn issue(&self, domains: &[String]) -> Result<IssuedCertificate, IssueError> {
        let domains = domains.to_vec();
        let days = self.validity_days;
        tokio::task::spawn_blocking(move || generate_self_signed(&domains, days))
            .await
            .map_err(|e| IssueError::Aborted(e.to_string()))?
    }
}

fn generate_self_signed(domains: &[String], days: i64) -> Result<IssuedCertificate, IssueError> {
    let first = domains.first().ok_or(IssueError::NoDomains)?;

    let mut params = CertificateParams::new(domains.to_vec())?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, first.clone());

    let now = Utc::now();
    let not_before = now - ChronoDuration::days(1);
    let not_after = now + ChronoDuration::days(days);
    params.not_before = date_time_ymd(
        not_before.year(),
        not_before.month() as u8,
        not_before.day() as u8,
    );
    params.not_after = date_time_ymd(not_after.year(), not_after.month() as u8, not_after.day() as u8);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    let certificate_pem = cert.pem();
    let expires_at = certificate_expiry(&certificate_pem)
        .map_err(|e| IssueError::InvalidCertificate(e.to_string()))?;

    Ok(IssuedCertificate {
        private_key_pem: key_pair.serialize_pem(),
        certificate_pem,
        expires_at,
    })
}

/// Counters for the issuer pool
#[derive(Debug, Default)]
pub struct IssueStats {
    pub requested: AtomicU64,
    pub issued: AtomicU64,
    pub failed: AtomicU64,
}

impl IssueStats {
    pub fn get_requested(&self) -> u64 {
        self.requested.load(Ordering::Relaxed)
    }

    pub fn get_issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn get_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Bounded pool for issuance calls.
///
/// Each issuance runs in its own task, so a caller that is cancelled (its
/// service was destroyed) does not abort a CA exchange half way. The result
/// of such an orphaned issuance is simply dropped.
pub struct IssuerPool {
    issuer: Arc<dyn CertificateIssuer>,
    permits: Arc<Semaphore>,
    workers: usize,
    stats: Arc<IssueStats>,
}

impl IssuerPool {
    pub fn new(issuer: Arc<dyn CertificateIssuer>, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            issuer,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            stats: Arc::new(IssueStats::default()),
        }
    }

    pub fn stats(&self) -> &IssueStats {
        &self.stats
    }

    pub fn issuer_name(&self) -> &'static str {
        self.issuer.name()
    }

    /// Issuances currently holding a worker slot
    pub fn in_flight(&self) -> usize {
        self.workers - self.permits.available_permits()
    }

    pub async fn issue(&self, domains: Vec<String>) -> Result<IssuedCertificate, IssueError> {
        let issuer = Arc::clone(&self.issuer);
        let permits = Arc::clone(&self.permits);
        let stats = Arc::clone(&self.stats);
        stats.requested.fetch_add(1, Ordering::Relaxed);

        let task = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| IssueError::Aborted(e.to_string()))?;
            debug!(issuer = issuer.name(), domains = ?domains, "Issuing certificate");
            let result = issuer.issue(&domains).await;
            match &result {
                Ok(issued) => {
                    stats.issued.fetch_add(1, Ordering::Relaxed);
                    info!(domains = ?domains, expires_at = issued.expires_at, "Certificate issued");
                }
                Err(_) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            result
        });

        task.await.map_err(|e| IssueError::Aborted(e.to_string()))?
    }
}
