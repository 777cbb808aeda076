//! Registry lease used for distributed mutual exclusion
//!
//! One session per controller instance. A background loop creates it, renews
//! it well inside its TTL and recreates it if the registry forgot it. Locks
//! are conditional KV writes gated on the session, so a lease that dies takes
//! its locks with it.

use crate::error::RegistryError;
use crate::registry::Registry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct LockSession {
    registry: Arc<dyn Registry>,
    name: String,
    ttl: Duration,
    renew_interval: Duration,
    session: watch::Sender<Option<String>>,
    /// Keys held by this instance, with the session that acquired them
    held: DashMap<String, String>,
}

impl LockSession {
    pub fn new(
        registry: Arc<dyn Registry>,
        name: &str,
        ttl: Duration,
        renew_interval: Duration,
    ) -> Arc<Self> {
        let (session, _) = watch::channel(None);
        Arc::new(Self {
            registry,
            name: name.to_string(),
            ttl,
            renew_interval,
            session,
            held: DashMap::new(),
        })
    }

    /// Session id if one exists right now
    pub fn current(&self) -> Option<String> {
        self.session.borrow().clone()
    }

    /// Wait until a session exists and return its id
    pub async fn session_id(&self) -> String {
        let mut rx = self.session.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(id) = current {
                return id;
            }
            // The sender lives in self, so this only fails during teardown
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Keep the lease alive until shutdown, then destroy it
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(name = %self.name, ttl_secs = self.ttl.as_secs(), "Lock session loop started");
        loop {
            self.tick().await;

            tokio::select! {
                _ = tokio::time::sleep(self.renew_interval) => {}
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        self.destroy().await;
    }

    /// One step of the lease loop: create when absent, renew otherwise,
    /// recreate when the registry reports the lease gone.
    pub async fn tick(&self) {
        let Some(id) = self.current() else {
            self.create().await;
            return;
        };

        match self.registry.session_renew(&id).await {
            Ok(()) => debug!(session = %id, "Lock session renewed"),
            Err(e) if e.is_not_found() => {
                warn!(session = %id, "Lock session expired, recreating");
                self.forget(&id);
                self.create().await;
            }
            Err(e) => {
                error!(session = %id, error = %e, "Failed to renew lock session");
            }
        }
    }

    async fn create(&self) {
        match self.registry.session_create(&self.name, self.ttl).await {
            Ok(id) => {
                info!(session = %id, "Lock session created");
                self.session.send_replace(Some(id));
            }
            Err(e) => error!(error = %e, "Failed to create lock session"),
        }
    }

    /// Clear `id` if it is still the current session
    fn forget(&self, id: &str) {
        self.session.send_if_modified(|current| {
            if current.as_deref() == Some(id) {
                *current = None;
                true
            } else {
                false
            }
        });
    }

    /// Try to take `key`. `false` means someone else holds it, inside this
    /// instance or in another one.
    pub async fn acquire(&self, key: &str) -> Result<bool, RegistryError> {
        let session = self.session_id().await;

        match self.held.entry(key.to_string()) {
            Entry::Occupied(_) => {
                debug!(key, "Lock already held by this instance");
                return Ok(false);
            }
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
            }
        }

        match self.registry.kv_acquire(key, &session).await {
            Ok(true) => {
                debug!(key, session = %session, "Lock acquired");
                Ok(true)
            }
            Ok(false) => {
                self.held.remove(key);
                debug!(key, "Lock held elsewhere");
                Ok(false)
            }
            Err(e) if e.is_not_found() => {
                self.held.remove(key);
                warn!(key, session = %session, "Lock session vanished during acquire");
                self.forget(&session);
                Ok(false)
            }
            Err(e) => {
                self.held.remove(key);
                Err(e)
            }
        }
    }

    /// Give up `key`. Returns whether the registry still considered it ours.
    pub async fn release(&self, key: &str) -> Result<bool, RegistryError> {
        let Some((_, session)) = self.held.remove(key) else {
            return Ok(false);
        };
        let released = self.registry.kv_release(key, &session).await?;
        debug!(key, released, "Lock released");
        Ok(released)
    }

    /// Scoped acquisition: `Some(guard)` when the lock was taken
    pub async fn try_lock(self: &Arc<Self>, key: &str) -> Result<Option<LockGuard>, RegistryError> {
        if !self.acquire(key).await? {
            return Ok(None);
        }
        Ok(Some(LockGuard {
            session: Arc::clone(self),
            key: key.to_string(),
            released: false,
        }))
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains_key(key)
    }

    async fn destroy(&self) {
        let Some(id) = self.session.send_replace(None) else {
            return;
        };
        self.held.clear();
        match self.registry.session_destroy(&id).await {
            Ok(()) => info!(session = %id, "Lock session destroyed"),
            Err(e) => warn!(session = %id, error = %e, "Failed to destroy lock session"),
        }
    }
}

/// Held lock. Call [`LockGuard::release`]; dropping an unreleased guard
/// releases in the background.
pub struct LockGuard {
    session: Arc<LockSession>,
    key: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> Result<bool, RegistryError> {
        self.released = true;
        self.session.release(&self.key).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let session = Arc::clone(&self.session);
        let key = std::mem::take(&mut self.key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = session.release(&key).await {
                    warn!(key = %key, error = %e, "Failed to release dropped lock");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegistry;

    fn session(registry: &Arc<MemoryRegistry>) -> Arc<LockSession> {
        LockSession::new(
            Arc::clone(registry) as Arc<dyn Registry>,
            "test",
            Duration::from_secs(10),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_tick_creates_then_renews() {
        let registry = Arc::new(MemoryRegistry::new());
        let locks = session(&registry);
        assert!(locks.current().is_none());

        locks.tick().await;
        let id = locks.current().unwrap();
        locks.tick().await;
        assert_eq!(locks.current(), Some(id));
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn test_lost_session_is_recreated() {
        let registry = Arc::new(MemoryRegistry::new());
        let locks = session(&registry);
        locks.tick().await;
        let first = locks.current().unwrap();

        registry.expire_session(&first);
        locks.tick().await;

        let second = locks.current().unwrap();
        assert_ne!(first, second);
        assert!(locks.acquire("k").await.unwrap());
        assert_eq!(registry.lock_holder("k"), Some(second));
    }

    #[tokio::test]
    async fn test_session_id_waits_for_creation() {
        let registry = Arc::new(MemoryRegistry::new());
        let locks = session(&registry);

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.session_id().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        locks.tick().await;
        assert_eq!(waiter.await.unwrap(), locks.current().unwrap());
    }

    #[tokio::test]
    async fn test_exclusive_within_instance() {
        let registry = Arc::new(MemoryRegistry::new());
        let locks = session(&registry);
        locks.tick().await;

        let guard = locks.try_lock("cert").await.unwrap().unwrap();
        assert!(locks.try_lock("cert").await.unwrap().is_none());
        assert!(guard.release().await.unwrap());
        assert!(locks.try_lock("cert").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_exclusive_across_instances() {
        let registry = Arc::new(MemoryRegistry::new());
        let a = session(&registry);
        let b = session(&registry);
        a.tick().await;
        b.tick().await;

        assert!(a.acquire("cert").await.unwrap());
        assert!(!b.acquire("cert").await.unwrap());
        assert!(!b.is_held("cert"));
        a.release("cert").await.unwrap();
        assert!(b.acquire("cert").await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let registry = Arc::new(MemoryRegistry::new());
        let locks = session(&registry);
        locks.tick().await;

        drop(locks.try_lock("cert").await.unwrap().unwrap());
        for _ in 0..50 {
            if registry.lock_holder("cert").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(registry.lock_holder("cert").is_none());
        assert!(!locks.is_held("cert"));
    }

    #[tokio::test]
    async fn test_run_destroys_session_on_shutdown() {
        let registry = Arc::new(MemoryRegistry::new());
        let locks = session(&registry);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&locks).run(rx));
        locks.session_id().await;
        assert_eq!(registry.session_count(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(registry.session_count(), 0);
        assert!(locks.current().is_none());
    }
}
