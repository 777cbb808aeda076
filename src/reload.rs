//! Coalesced proxy reloads
//!
//! Services call [`ReloadCoordinator::queue_reload`] after writing fragments.
//! Requests only set a flag; a single loop waits out the debounce window and
//! reloads once for however many requests arrived, so a burst of N changes
//! costs one reload and no request is lost.

use crate::proxy::ProxyControl;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};

#[derive(Debug, Default)]
pub struct ReloadStats {
    pub requested: AtomicU64,
    pub executed: AtomicU64,
    pub failed: AtomicU64,
}

impl ReloadStats {
    pub fn get_requested(&self) -> u64 {
        self.requested.load(Ordering::Relaxed)
    }

    pub fn get_executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn get_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

pub struct ReloadCoordinator {
    proxy: Arc<dyn ProxyControl>,
    debounce: Duration,
    pending: AtomicBool,
    notify: Notify,
    stats: ReloadStats,
}

impl ReloadCoordinator {
    pub fn new(proxy: Arc<dyn ProxyControl>, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            proxy,
            debounce,
            pending: AtomicBool::new(false),
            notify: Notify::new(),
            stats: ReloadStats::default(),
        })
    }

    /// Ask for a reload. Never blocks and never fails.
    pub fn queue_reload(&self) {
        self.stats.requested.fetch_add(1, Ordering::Relaxed);
        self.pending.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ReloadStats {
        &self.stats
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(debounce_ms = self.debounce.as_millis() as u64, "Reload coordinator started");
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            tokio::time::sleep(self.debounce).await;
            self.flush().await;
        }
        // Changes written just before shutdown still reach the proxy
        self.flush().await;
        debug!("Reload coordinator stopped");
    }

    /// Reload now if anything is pending. Returns whether a reload ran.
    pub async fn flush(&self) -> bool {
        if !self.pending.swap(false, Ordering::SeqCst) {
            return false;
        }

        match self.proxy.reload().await {
            Ok(()) => {
                self.stats.executed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Not retried; the next queued change reloads again
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Proxy reload failed");
            }
        }
        true
    }
}
