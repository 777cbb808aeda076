//! Service registry capability
//!
//! The controller consumes the registry through [`Registry`]: blocking
//! (long-poll) reads of the catalog, of per-service health entries and of KV
//! prefixes, plain KV writes, session-gated lock writes, and lease sessions.
//! [`crate::consul::ConsulRegistry`] speaks to a Consul agent and
//! [`crate::memory::MemoryRegistry`] keeps everything in process.

use crate::error::RegistryError;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Result of a blocking query together with the cursor for the next one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indexed<T> {
    pub index: u64,
    pub value: T,
}

impl<T> Indexed<T> {
    pub fn new(index: u64, value: T) -> Self {
        Self { index, value }
    }
}

/// Registered service names mapped to the union of their tags
pub type Catalog = BTreeMap<String, Vec<String>>;

/// One passing health entry of a service instance
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct HealthEntry {
    pub node: String,
    pub address: String,
    pub port: Option<u16>,
    pub tags: Option<Vec<String>>,
}

impl HealthEntry {
    pub fn new(node: &str, address: &str, port: u16, tags: &[&str]) -> Self {
        Self {
            node: node.to_string(),
            address: address.to_string(),
            port: Some(port),
            tags: Some(tags.iter().map(|t| t.to_string()).collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

impl KvPair {
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// Compute the cursor for the next blocking query. An index that moves
/// backwards means the registry state was reset, so start over.
pub fn next_index(previous: u64, returned: u64) -> u64 {
    if returned < previous {
        0
    } else {
        returned
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Block until the catalog changes past `index` (or the wait elapses)
    async fn watch_catalog(&self, index: u64, wait: Duration)
        -> Result<Indexed<Catalog>, RegistryError>;

    /// Block until the passing health entries of `service` change past `index`
    async fn watch_health(
        &self,
        service: &str,
        index: u64,
        wait: Duration,
    ) -> Result<Indexed<Vec<HealthEntry>>, RegistryError>;

    /// Block until anything under `prefix` changes past `index`
    async fn watch_kv(
        &self,
        prefix: &str,
        index: u64,
        wait: Duration,
    ) -> Result<Indexed<Vec<KvPair>>, RegistryError>;

    /// Read a key, or every key under a prefix when `recurse` is set.
    /// Absent keys yield an empty vector.
    async fn kv_get(&self, key: &str, recurse: bool) -> Result<Vec<KvPair>, RegistryError>;

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<(), RegistryError>;

    /// Conditional write that only succeeds while no other session holds `key`
    async fn kv_acquire(&self, key: &str, session: &str) -> Result<bool, RegistryError>;

    /// Inverse of [`Registry::kv_acquire`]
    async fn kv_release(&self, key: &str, session: &str) -> Result<bool, RegistryError>;

    async fn kv_delete(&self, key: &str, recurse: bool) -> Result<(), RegistryError>;

    /// Create a lease that deletes the keys it holds when it expires
    async fn session_create(&self, name: &str, ttl: Duration) -> Result<String, RegistryError>;

    /// Renew a lease. Fails with [`RegistryError::NotFound`] once it expired.
    async fn session_renew(&self, id: &str) -> Result<(), RegistryError>;

    async fn session_destroy(&self, id: &str) -> Result<(), RegistryError>;
}

/// Builds the keys the controller owns under its namespace
#[derive(Debug, Clone)]
pub struct KeySpace {
    namespace: String,
}

pub const CERT_PRIVATE_KEY: &str = "private_key";
pub const CERT_PUBLIC_KEY: &str = "public_key";
pub const CERT_EXPIRES: &str = "expires";
pub const CERT_KEY_DOMAINS: &str = "key_domains";

impl KeySpace {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.trim_matches('/').to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn ports_prefix(&self) -> String {
        format!("{}/ports/", self.namespace)
    }

    pub fn port(&self, service_id: &str) -> String {
        format!("{}{}", self.ports_prefix(), service_id)
    }

    pub fn certificate_prefix(&self, cert_id: &str) -> String {
        format!("{}/certificates/{}/", self.namespace, cert_id)
    }

    pub fn certificate_field(&self, cert_id: &str, field: &str) -> String {
        format!("{}{}", self.certificate_prefix(cert_id), field)
    }

    pub fn certificate_lock(&self, cert_id: &str) -> String {
        format!("{}/locks/cert/{}", self.namespace, cert_id)
    }

    pub fn acme_account(&self) -> String {
        format!("{}/acme/account", self.namespace)
    }

    pub fn acme_challenge(&self, token: &str) -> String {
        format!("{}/acme/challenge/{}", self.namespace, token)
    }
}
