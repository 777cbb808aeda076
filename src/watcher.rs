//! Catalog watcher
//!
//! Long-polls the registry catalog and keeps one [`ServiceHandle`] per
//! published service name. A service is published when any of its tags is a
//! bare protocol name. Names that drop out are destroyed, and port mappings
//! of services that no longer exist are garbage collected.

use crate::error::RegistryError;
use crate::registry::{next_index, Catalog, Indexed};
use crate::service::{is_published, ServiceContext, ServiceHandle};
use futures::future::join_all;
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct ServiceWatcher {
    ctx: Arc<ServiceContext>,
    services: BTreeMap<String, ServiceHandle>,
    index: u64,
}

impl ServiceWatcher {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self {
            ctx,
            services: BTreeMap::new(),
            index: 0,
        }
    }

    /// Names of the services currently tracked
    pub fn services(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// One blocking catalog read past `index`
    pub async fn fetch_services(&self, index: u64) -> Result<Indexed<Catalog>, RegistryError> {
        self.ctx.registry.watch_catalog(index, self.ctx.wait).await
    }

    /// Reconcile tracked services with a catalog snapshot
    pub async fn check_services(&mut self, catalog: &Catalog) {
        let published: BTreeMap<&String, &Vec<String>> =
            catalog.iter().filter(|(_, tags)| is_published(tags)).collect();

        for (name, tags) in &published {
            match self.services.get(name.as_str()) {
                Some(handle) => handle.update_tags((*tags).clone()),
                None => {
                    info!(service = %name, "New service in catalog");
                    let handle = ServiceHandle::spawn(Arc::clone(&self.ctx), name, (*tags).clone());
                    self.services.insert((*name).clone(), handle);
                }
            }
        }

        let stale: Vec<String> = self
            .services
            .keys()
            .filter(|name| !published.contains_key(name))
            .cloned()
            .collect();
        let removals = stale.iter().filter_map(|name| {
            info!(service = %name, "Removing stale service");
            self.services.remove(name).map(ServiceHandle::destroy)
        });
        join_all(removals.collect::<Vec<_>>()).await;

        self.collect_garbage().await;
    }

    /// Drop port mappings whose service is gone
    pub async fn collect_garbage(&self) {
        let live: HashSet<String> = self.services.values().map(|h| h.id().to_string()).collect();
        match self.ctx.ports.collect_garbage(&live).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Collected stale port mappings"),
            Err(e) => warn!(error = %e, "Port garbage collection failed"),
        }
    }

    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Catalog watcher started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                res = self.fetch_services(self.index) => match res {
                    Ok(result) => {
                        let previous = self.index;
                        self.index = next_index(previous, result.index);
                        debug!(index = self.index, services = result.value.len(), "Catalog update");
                        self.check_services(&result.value).await;
                    }
                    Err(e) if e.is_timeout() => {}
                    Err(e) => {
                        let delay = retry_delay(self.ctx.error_backoff);
                        error!(error = %e, retry_ms = delay.as_millis() as u64, "Registry error while watching catalog");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown_rx.changed() => {}
                        }
                    }
                },
            }
        }

        self.shutdown().await;
    }

    /// Stop every service task, leaving deployed configuration in place
    pub async fn shutdown(self) {
        let count = self.services.len();
        join_all(self.services.into_values().map(ServiceHandle::stop)).await;
        info!(services = count, "Catalog watcher stopped");
    }
}

const MIN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Up to a second under `backoff`, never below one second. Spreads retries
/// of several instances hitting the same registry outage.
fn retry_delay(backoff: Duration) -> Duration {
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
    backoff.saturating_sub(jitter).max(MIN_RETRY_DELAY)
}
