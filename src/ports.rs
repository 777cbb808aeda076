//! Port allocation for tcp/udp listeners
//!
//! Maps service ids to unique ports in a configured half-open range. The
//! in-memory map is authoritative for this instance and mirrored to the
//! registry under `<ns>/ports/<id>` so a restarted controller gets the same
//! ports back.

use crate::config::PortRange;
use crate::error::PortError;
use crate::registry::{KeySpace, Registry};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub struct PortAllocator {
    registry: Arc<dyn Registry>,
    keys: KeySpace,
    range: PortRange,
    allocated: Mutex<HashMap<String, u16>>,
    freed: Notify,
}

impl PortAllocator {
    pub fn new(registry: Arc<dyn Registry>, keys: KeySpace, range: PortRange) -> Self {
        Self {
            registry,
            keys,
            range,
            allocated: Mutex::new(HashMap::new()),
            freed: Notify::new(),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Current port for a service, if any
    pub fn port(&self, service_id: &str) -> Option<u16> {
        self.allocated.lock().get(service_id).copied()
    }

    /// Snapshot of every mapping held by this instance
    pub fn allocated(&self) -> BTreeMap<String, u16> {
        self.allocated
            .lock()
            .iter()
            .map(|(id, port)| (id.clone(), *port))
            .collect()
    }

    /// Resolves the next time a mapping is dropped
    pub async fn freed(&self) {
        self.freed.notified().await
    }

    /// Return the port for `service_id`, reserving the first free one in the
    /// range if the service has none yet.
    pub async fn allocate(&self, service_id: &str) -> Result<u16, PortError> {
        if let Some(port) = self.port(service_id) {
            return Ok(port);
        }

        // Read-then-decide: pick up mappings other instances (or a previous
        // run) recorded before scanning for a free port.
        let mirrored = match self.mirrored().await {
            Ok(mirrored) => mirrored,
            Err(e) => {
                warn!(service = service_id, error = %e, "Could not refresh port mappings, using local view");
                HashMap::new()
            }
        };

        let port = {
            let mut allocated = self.allocated.lock();
            merge_mirrored(&mut allocated, mirrored, self.range);

            if let Some(port) = allocated.get(service_id) {
                return Ok(*port);
            }

            let used: HashSet<u16> = allocated.values().copied().collect();
            let port = (self.range.min..self.range.max)
                .find(|p| !used.contains(p))
                .ok_or(PortError::Exhausted {
                    min: self.range.min,
                    max: self.range.max,
                })?;
            allocated.insert(service_id.to_string(), port);
            port
        };

        let key = self.keys.port(service_id);
        if let Err(e) = self.registry.kv_put(&key, port.to_string().as_bytes()).await {
            let mut allocated = self.allocated.lock();
            if allocated.get(service_id) == Some(&port) {
                allocated.remove(service_id);
            }
            return Err(e.into());
        }

        info!(service = service_id, port, "Port allocated");
        Ok(port)
    }

    /// Drop the mapping and its registry mirror. Absence is not an error.
    pub async fn release(&self, service_id: &str) -> Result<(), PortError> {
        let released = self.allocated.lock().remove(service_id);
        self.registry
            .kv_delete(&self.keys.port(service_id), false)
            .await?;
        if let Some(port) = released {
            info!(service = service_id, port, "Port released");
            self.freed.notify_waiters();
        }
        Ok(())
    }

    /// Reconcile memory and mirror against the set of live services.
    ///
    /// Drops in-memory mappings for services that are gone, then deletes
    /// every mirrored entry without an in-memory counterpart. Returns the
    /// number of mirror entries deleted.
    pub async fn collect_garbage(&self, live: &HashSet<String>) -> Result<usize, PortError> {
        let dropped = {
            let mut allocated = self.allocated.lock();
            let before = allocated.len();
            allocated.retain(|id, port| {
                let keep = live.contains(id);
                if !keep {
                    debug!(service = %id, port = *port, "Dropping port of vanished service");
                }
                keep
            });
            before - allocated.len()
        };
        if dropped > 0 {
            self.freed.notify_waiters();
        }

        let prefix = self.keys.ports_prefix();
        let mirrored = self.registry.kv_get(&prefix, true).await?;
        let mut deleted = 0;
        for pair in mirrored {
            let Some(service_id) = pair.key.strip_prefix(&prefix) else {
                continue;
            };
            if self.allocated.lock().contains_key(service_id) {
                continue;
            }
            self.registry.kv_delete(&pair.key, false).await?;
            debug!(service = service_id, "Removed stale port mapping");
            deleted += 1;
        }

        if deleted > 0 {
            info!(deleted, "Port garbage collection finished");
        }
        Ok(deleted)
    }

    async fn mirrored(&self) -> Result<HashMap<String, u16>, PortError> {
        let prefix = self.keys.ports_prefix();
        let pairs = self.registry.kv_get(&prefix, true).await?;
        Ok(pairs
            .into_iter()
            .filter_map(|pair| {
                let port = pair.value_str()?.trim().parse().ok()?;
                let id = pair.key.strip_prefix(&prefix)?.to_string();
                Some((id, port))
            })
            .collect())
    }
}

/// Fold mirrored mappings into memory. Memory wins: entries outside the
/// range, for ids already mapped, or for ports already taken are ignored.
fn merge_mirrored(
    allocated: &mut HashMap<String, u16>,
    mirrored: HashMap<String, u16>,
    range: PortRange,
) {
    let mut mirrored: Vec<(String, u16)> = mirrored.into_iter().collect();
    mirrored.sort_by_key(|(_, port)| *port);

    let mut used: HashSet<u16> = allocated.values().copied().collect();
    for (id, port) in mirrored {
        if !range.contains(port) || allocated.contains_key(&id) || used.contains(&port) {
            continue;
        }
        used.insert(port);
        allocated.insert(id, port);
    }
}
