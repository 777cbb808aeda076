//! Consul HTTP API client
//!
//! Only the slice of the API the controller needs: the service catalog,
//! passing health entries, the KV store with session locks, and sessions.
//! Blocking queries send `index` and `wait` and read the new cursor from the
//! `X-Consul-Index` response header.

use crate::error::RegistryError;
use crate::registry::{next_index, Catalog, HealthEntry, Indexed, KvPair, Registry};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const INDEX_HEADER: &str = "X-Consul-Index";

/// Per-request ceiling for calls that are not blocking queries
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    node: String,
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(default)]
    address: String,
    port: Option<u16>,
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthRecord {
    node: HealthNode,
    service: HealthService,
}

impl From<HealthRecord> for HealthEntry {
    fn from(record: HealthRecord) -> Self {
        let address = if record.service.address.is_empty() {
            record.node.address
        } else {
            record.service.address
        };
        HealthEntry {
            node: record.node.node,
            address,
            // Consul reports unset ports as 0
            port: record.service.port.filter(|p| *p != 0),
            tags: record.service.tags,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvRecord {
    key: String,
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

pub struct ConsulRegistry {
    base_url: String,
    client: reqwest::Client,
}

impl ConsulRegistry {
    pub fn new(address: &str) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            base_url: address.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/v1/{}", self.base_url, path))
    }

    /// Attach blocking-query parameters. Consul adds up to wait/16 of jitter
    /// before answering, so the client deadline leaves room for it.
    fn blocking(builder: RequestBuilder, index: u64, wait: Duration) -> RequestBuilder {
        let timeout = wait + wait / 16 + REQUEST_TIMEOUT;
        let builder = builder.timeout(timeout);
        if index == 0 {
            return builder;
        }
        builder.query(&[
            ("index", index.to_string()),
            ("wait", format!("{}s", wait.as_secs().max(1))),
        ])
    }

    async fn send(builder: RequestBuilder) -> Result<Response, RegistryError> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RegistryError::Timeout
            } else {
                RegistryError::Http(e)
            }
        })
    }

    async fn check(response: Response) -> Result<Response, RegistryError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(body));
        }
        Err(RegistryError::Status {
            status: status.as_u16(),
            body,
        })
    }

    fn response_index(response: &Response) -> Result<u64, RegistryError> {
        response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| RegistryError::Decode(format!("missing {} header", INDEX_HEADER)))
    }

    async fn json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, RegistryError> {
        response
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))
    }

    /// Read KV records; a 404 means "no such key" and still carries an index
    async fn kv_read(
        &self,
        key: &str,
        recurse: bool,
        index: u64,
        wait: Option<Duration>,
    ) -> Result<Indexed<Vec<KvPair>>, RegistryError> {
        let mut builder = self.request(Method::GET, &format!("kv/{}", encode_key(key)));
        if recurse {
            builder = builder.query(&[("recurse", "true")]);
        }
        builder = match wait {
            Some(wait) => Self::blocking(builder, index, wait),
            None => builder.timeout(REQUEST_TIMEOUT),
        };

        let response = Self::send(builder).await?;
        if response.status() == StatusCode::NOT_FOUND {
            let returned = Self::response_index(&response).unwrap_or(index);
            return Ok(Indexed::new(next_index(index, returned), Vec::new()));
        }
        let response = Self::check(response).await?;
        let returned = Self::response_index(&response)?;
        let records: Vec<KvRecord> = Self::json(response).await?;
        let pairs = records
            .into_iter()
            .map(|r| -> Result<KvPair, RegistryError> {
                let value = match r.value {
                    Some(encoded) => BASE64
                        .decode(encoded)
                        .map_err(|e| RegistryError::Decode(format!("{}: {}", r.key, e)))?,
                    None => Vec::new(),
                };
                Ok(KvPair { key: r.key, value })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Indexed::new(next_index(index, returned), pairs))
    }

    async fn kv_write(
        &self,
        key: &str,
        value: &[u8],
        query: &[(&str, &str)],
    ) -> Result<bool, RegistryError> {
        let builder = self
            .request(Method::PUT, &format!("kv/{}", encode_key(key)))
            .query(query)
            .timeout(REQUEST_TIMEOUT)
            .body(value.to_vec());
        let response = Self::check(Self::send(builder).await?).await?;
        Self::json(response).await
    }
}

/// Percent-encode each path segment of a key, keeping the separators
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn watch_catalog(
        &self,
        index: u64,
        wait: Duration,
    ) -> Result<Indexed<Catalog>, RegistryError> {
        let builder = Self::blocking(self.request(Method::GET, "catalog/services"), index, wait);
        let response = Self::check(Self::send(builder).await?).await?;
        let returned = Self::response_index(&response)?;
        let catalog: std::collections::BTreeMap<String, Option<Vec<String>>> =
            Self::json(response).await?;
        let catalog = catalog
            .into_iter()
            .map(|(name, tags)| (name, tags.unwrap_or_default()))
            .collect();
        Ok(Indexed::new(next_index(index, returned), catalog))
    }

    async fn watch_health(
        &self,
        service: &str,
        index: u64,
        wait: Duration,
    ) -> Result<Indexed<Vec<HealthEntry>>, RegistryError> {
        let path = format!("health/service/{}", urlencoding::encode(service));
        let builder = self.request(Method::GET, &path).query(&[("passing", "true")]);
        let builder = Self::blocking(builder, index, wait);
        let response = Self::check(Self::send(builder).await?).await?;
        let returned = Self::response_index(&response)?;
        let records: Vec<HealthRecord> = Self::json(response).await?;
        debug!(service, index = returned, entries = records.len(), "Health entries fetched");
        Ok(Indexed::new(
            next_index(index, returned),
            records.into_iter().map(HealthEntry::from).collect(),
        ))
    }

    async fn watch_kv(
        &self,
        prefix: &str,
        index: u64,
        wait: Duration,
    ) -> Result<Indexed<Vec<KvPair>>, RegistryError> {
        self.kv_read(prefix, true, index, Some(wait)).await
    }

    async fn kv_get(&self, key: &str, recurse: bool) -> Result<Vec<KvPair>, RegistryError> {
        Ok(self.kv_read(key, recurse, 0, None).await?.value)
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<(), RegistryError> {
        if self.kv_write(key, value, &[]).await? {
            Ok(())
        } else {
            Err(RegistryError::Status {
                status: 200,
                body: format!("write to {} was refused", key),
            })
        }
    }

    async fn kv_acquire(&self, key: &str, session: &str) -> Result<bool, RegistryError> {
        match self.kv_write(key, b"", &[("acquire", session)]).await {
            // Consul answers 500 "invalid session" for a dead lease
            Err(RegistryError::Status { status: 500, body }) if body.contains("session") => {
                Err(RegistryError::NotFound(body))
            }
            other => other,
        }
    }

    async fn kv_release(&self, key: &str, session: &str) -> Result<bool, RegistryError> {
        self.kv_write(key, b"", &[("release", session)]).await
    }

    async fn kv_delete(&self, key: &str, recurse: bool) -> Result<(), RegistryError> {
        let mut builder = self
            .request(Method::DELETE, &format!("kv/{}", encode_key(key)))
            .timeout(REQUEST_TIMEOUT);
        if recurse {
            builder = builder.query(&[("recurse", "true")]);
        }
        Self::check(Self::send(builder).await?).await?;
        Ok(())
    }

    async fn session_create(&self, name: &str, ttl: Duration) -> Result<String, RegistryError> {
        let body = serde_json::json!({
            "Name": name,
            "TTL": format!("{}s", ttl.as_secs()),
            "Behavior": "delete",
            "LockDelay": "0s",
        });
        let builder = self
            .request(Method::PUT, "session/create")
            .timeout(REQUEST_TIMEOUT)
            .json(&body);
        let response = Self::check(Self::send(builder).await?).await?;
        let created: SessionCreated = Self::json(response).await?;
        Ok(created.id)
    }

    async fn session_renew(&self, id: &str) -> Result<(), RegistryError> {
        let builder = self
            .request(Method::PUT, &format!("session/renew/{}", id))
            .timeout(REQUEST_TIMEOUT);
        Self::check(Self::send(builder).await?).await?;
        Ok(())
    }

    async fn session_destroy(&self, id: &str) -> Result<(), RegistryError> {
        let builder = self
            .request(Method::PUT, &format!("session/destroy/{}", id))
            .timeout(REQUEST_TIMEOUT);
        Self::check(Self::send(builder).await?).await?;
        Ok(())
    }
}
