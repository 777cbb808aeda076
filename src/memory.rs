//! In-process registry
//!
//! Implements the same blocking-query contract as Consul: every mutation
//! bumps a global raft-style index, reads return the highest index of the
//! data they cover, and a read with a stale cursor returns immediately while a
//! read with a current cursor parks until something relevant changes or the
//! wait elapses. Used by the test suite and by `--dev` runs.

use crate::error::RegistryError;
use crate::registry::{Catalog, HealthEntry, Indexed, KvPair, Registry};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Deleted keys remembered for prefix indexes before the oldest are folded
/// into `State::kv_pruned`
const MAX_KV_TOMBSTONES: usize = 1024;

#[derive(Debug, Clone)]
struct KvEntry {
    value: Vec<u8>,
    session: Option<String>,
    modify_index: u64,
}

#[derive(Debug, Clone)]
struct ServiceEntry {
    entries: Vec<HealthEntry>,
    modify_index: u64,
}

#[derive(Debug, Default)]
struct State {
    index: u64,
    catalog_index: u64,
    services: BTreeMap<String, ServiceEntry>,
    /// Last index at which a deregistered service disappeared
    service_tombstones: HashMap<String, u64>,
    kv: BTreeMap<String, KvEntry>,
    kv_tombstones: BTreeMap<String, u64>,
    /// Highest index of a pruned tombstone, a floor for every prefix index
    kv_pruned: u64,
    sessions: HashMap<String, String>,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn catalog(&self) -> Catalog {
        self.services
            .iter()
            .map(|(name, svc)| {
                let tags: BTreeSet<String> = svc
                    .entries
                    .iter()
                    .flat_map(|e| e.tags.iter().flatten().cloned())
                    .collect();
                (name.clone(), tags.into_iter().collect())
            })
            .collect()
    }

    fn health(&self, service: &str) -> (u64, Vec<HealthEntry>) {
        match self.services.get(service) {
            Some(svc) => (svc.modify_index, svc.entries.clone()),
            None => (
                self.service_tombstones.get(service).copied().unwrap_or(0),
                Vec::new(),
            ),
        }
    }

    fn kv_prefix(&self, prefix: &str) -> (u64, Vec<KvPair>) {
        let pairs: Vec<(&String, &KvEntry)> = self
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .collect();
        let live = pairs.iter().map(|(_, e)| e.modify_index).max().unwrap_or(0);
        let dead = self
            .kv_tombstones
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, idx)| *idx)
            .max()
            .unwrap_or(0)
            .max(self.kv_pruned);
        let values = pairs
            .into_iter()
            .map(|(k, e)| KvPair {
                key: k.clone(),
                value: e.value.clone(),
            })
            .collect();
        (live.max(dead), values)
    }

    fn remove_key(&mut self, key: &str, index: u64) -> bool {
        if self.kv.remove(key).is_none() {
            return false;
        }
        self.kv_tombstones.insert(key.to_string(), index);
        if self.kv_tombstones.len() > MAX_KV_TOMBSTONES {
            self.prune_tombstone();
        }
        true
    }

    fn prune_tombstone(&mut self) {
        let oldest = self
            .kv_tombstones
            .iter()
            .min_by_key(|(_, idx)| **idx)
            .map(|(key, idx)| (key.clone(), *idx));
        if let Some((key, idx)) = oldest {
            self.kv_tombstones.remove(&key);
            self.kv_pruned = self.kv_pruned.max(idx);
        }
    }
}

pub struct MemoryRegistry {
    state: Mutex<State>,
    changed: watch::Sender<u64>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            // Index 1 is reserved for "nothing here yet"
            state: Mutex::new(State {
                index: 1,
                ..State::default()
            }),
            changed,
        }
    }

    fn notify(&self, index: u64) {
        self.changed.send_replace(index);
    }

    /// Run `view` until it reports an index different from `index`, or the
    /// wait elapses, in which case the current data is returned unchanged.
    async fn block_on<T, F>(&self, index: u64, wait: Duration, view: F) -> Indexed<T>
    where
        F: Fn(&State) -> (u64, T),
    {
        let deadline = Instant::now() + wait;
        loop {
            let mut rx = self.changed.subscribe();
            let (current, value) = view(&self.state.lock());
            // Consul never hands out a zero index
            let current = current.max(1);
            if index == 0 || current != index {
                return Indexed::new(current, value);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Indexed::new(current, value),
            }
        }
    }

    /// Register (or replace) every passing instance of a service
    pub fn register_service(&self, name: &str, entries: Vec<HealthEntry>) {
        let index = {
            let mut state = self.state.lock();
            let index = state.bump();
            let tags_before = state.catalog().get(name).cloned();
            state.services.insert(
                name.to_string(),
                ServiceEntry {
                    entries,
                    modify_index: index,
                },
            );
            if state.catalog().get(name).cloned() != tags_before {
                state.catalog_index = index;
            }
            index
        };
        debug!(service = name, index, "Registered service");
        self.notify(index);
    }

    pub fn deregister_service(&self, name: &str) {
        let index = {
            let mut state = self.state.lock();
            if !state.services.contains_key(name) {
                return;
            }
            let index = state.bump();
            state.services.remove(name);
            state.service_tombstones.insert(name.to_string(), index);
            state.catalog_index = index;
            index
        };
        debug!(service = name, index, "Deregistered service");
        self.notify(index);
    }

    /// Invalidate a session as if its TTL ran out. With delete behaviour
    /// every key it holds goes with it.
    pub fn expire_session(&self, id: &str) {
        let index = {
            let mut state = self.state.lock();
            if state.sessions.remove(id).is_none() {
                return;
            }
            let index = state.bump();
            let held: Vec<String> = state
                .kv
                .iter()
                .filter(|(_, e)| e.session.as_deref() == Some(id))
                .map(|(k, _)| k.clone())
                .collect();
            for key in held {
                state.remove_key(&key, index);
            }
            index
        };
        self.notify(index);
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.state.lock().sessions.keys().cloned().collect()
    }

    /// Session currently holding `key`, if any
    pub fn lock_holder(&self, key: &str) -> Option<String> {
        self.state.lock().kv.get(key).and_then(|e| e.session.clone())
    }

    /// Every key under `prefix`, in order
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.state.lock().kv_prefix(prefix).1.into_iter().map(|p| p.key).collect()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .kv
            .get(key)
            .map(|e| String::from_utf8_lossy(&e.value).into_owned())
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn watch_catalog(
        &self,
        index: u64,
        wait: Duration,
    ) -> Result<Indexed<Catalog>, RegistryError> {
        Ok(self
            .block_on(index, wait, |s| (s.catalog_index, s.catalog()))
            .await)
    }

    async fn watch_health(
        &self,
        service: &str,
        index: u64,
        wait: Duration,
    ) -> Result<Indexed<Vec<HealthEntry>>, RegistryError> {
        Ok(self.block_on(index, wait, |s| s.health(service)).await)
    }

    async fn watch_kv(
        &self,
        prefix: &str,
        index: u64,
        wait: Duration,
    ) -> Result<Indexed<Vec<KvPair>>, RegistryError> {
        Ok(self.block_on(index, wait, |s| s.kv_prefix(prefix)).await)
    }

    async fn kv_get(&self, key: &str, recurse: bool) -> Result<Vec<KvPair>, RegistryError> {
        let state = self.state.lock();
        if recurse {
            return Ok(state.kv_prefix(key).1);
        }
        Ok(state
            .kv
            .get(key)
            .map(|e| KvPair {
                key: key.to_string(),
                value: e.value.clone(),
            })
            .into_iter()
            .collect())
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<(), RegistryError> {
        let index = {
            let mut state = self.state.lock();
            let index = state.bump();
            let session = state.kv.get(key).and_then(|e| e.session.clone());
            state.kv.insert(
                key.to_string(),
                KvEntry {
                    value: value.to_vec(),
                    session,
                    modify_index: index,
                },
            );
            state.kv_tombstones.remove(key);
            index
        };
        self.notify(index);
        Ok(())
    }

    async fn kv_acquire(&self, key: &str, session: &str) -> Result<bool, RegistryError> {
        let index = {
            let mut state = self.state.lock();
            if !state.sessions.contains_key(session) {
                return Err(RegistryError::NotFound(format!("session {}", session)));
            }
            match state.kv.get(key).and_then(|e| e.session.as_deref()) {
                Some(holder) if holder != session => return Ok(false),
                _ => {}
            }
            let index = state.bump();
            let value = state.kv.get(key).map(|e| e.value.clone()).unwrap_or_default();
            state.kv.insert(
                key.to_string(),
                KvEntry {
                    value,
                    session: Some(session.to_string()),
                    modify_index: index,
                },
            );
            state.kv_tombstones.remove(key);
            index
        };
        self.notify(index);
        Ok(true)
    }

    async fn kv_release(&self, key: &str, session: &str) -> Result<bool, RegistryError> {
        let index = {
            let mut state = self.state.lock();
            let index = state.index + 1;
            match state.kv.get_mut(key) {
                Some(entry) if entry.session.as_deref() == Some(session) => {
                    entry.session = None;
                    entry.modify_index = index;
                }
                _ => return Ok(false),
            }
            state.bump()
        };
        self.notify(index);
        Ok(true)
    }

    async fn kv_delete(&self, key: &str, recurse: bool) -> Result<(), RegistryError> {
        let index = {
            let mut state = self.state.lock();
            let keys: Vec<String> = if recurse {
                state.kv_prefix(key).1.into_iter().map(|p| p.key).collect()
            } else {
                vec![key.to_string()]
            };
            let index = state.index + 1;
            let mut removed = false;
            for k in keys {
                removed |= state.remove_key(&k, index);
            }
            if !removed {
                return Ok(());
            }
            state.bump()
        };
        self.notify(index);
        Ok(())
    }

    async fn session_create(&self, name: &str, _ttl: Duration) -> Result<String, RegistryError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.state
            .lock()
            .sessions
            .insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn session_renew(&self, id: &str) -> Result<(), RegistryError> {
        if self.state.lock().sessions.contains_key(id) {
            Ok(())
        } else {
            Err(RegistryError::NotFound(format!("session {}", id)))
        }
    }

    async fn session_destroy(&self, id: &str) -> Result<(), RegistryError> {
        self.expire_session(id);
        Ok(())
    }
}
