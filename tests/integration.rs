//! Integration tests for the catalog proxy controller
//!
//! Everything runs against the in-memory registry and a recording proxy, so
//! no nginx binary or Consul agent is needed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use catalog_proxy::certificate::{fingerprint, CertificateManager};
use catalog_proxy::config::{Config, PortRange};
use catalog_proxy::controller::Controller;
use catalog_proxy::error::{IssueError, ProxyError};
use catalog_proxy::issuer::{CertificateIssuer, IssuedCertificate, SelfSignedIssuer};
use catalog_proxy::memory::MemoryRegistry;
use catalog_proxy::proxy::ProxyControl;
use catalog_proxy::registry::{HealthEntry, KeySpace, Registry};
use catalog_proxy::render::Bucket;
use catalog_proxy::service::{ServiceContext, ServiceHandle, ServiceState};
use catalog_proxy::watcher::ServiceWatcher;
use tempfile::TempDir;
use tokio::sync::watch;

/// Proxy double that accepts or rejects every candidate and counts calls
#[derive(Default)]
struct RecordingProxy {
    checks: AtomicUsize,
    reloads: AtomicUsize,
    reject: AtomicBool,
}

impl RecordingProxy {
    fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyControl for RecordingProxy {
    async fn check_config(&self, main_config: &Path) -> Result<(), ProxyError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(ProxyError::Failed {
                command: format!("nginx -t -c {}", main_config.display()),
                code: Some(1),
                stderr: "emerg: invalid configuration".to_string(),
            });
        }
        Ok(())
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Self-signed issuer that counts requests and takes its time
struct CountingIssuer {
    inner: SelfSignedIssuer,
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingIssuer {
    fn new(delay: Duration) -> Self {
        Self {
            inner: SelfSignedIssuer::new(30),
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateIssuer for CountingIssuer {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn issue(&self, domains: &[String]) -> Result<IssuedCertificate, IssueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.issue(domains).await
    }
}

struct Harness {
    _dir: TempDir,
    registry: Arc<MemoryRegistry>,
    proxy: Arc<RecordingProxy>,
    issuer: Arc<CountingIssuer>,
    controller: Controller,
    ctx: Arc<ServiceContext>,
}

impl Harness {
    fn fragment(&self, id: &str, bucket: Bucket) -> Option<String> {
        std::fs::read_to_string(self.ctx.deployer.fragment_path(id, bucket)).ok()
    }

    fn has_fragment(&self, id: &str, bucket: Bucket) -> bool {
        self.ctx.deployer.fragment_path(id, bucket).exists()
    }
}

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.secret = Some("test-secret".to_string());
    config.registry.namespace = "test".to_string();
    config.registry.wait_secs = 1;
    config.registry.error_backoff_secs = 1;
    config.proxy.config_dir = dir.join("nginx");
    config.proxy.reload_debounce_ms = 20;
    config.data_dir = dir.join("data");
    config.admin.bind = "127.0.0.1".to_string();
    config.admin.port = 0;
    config.ports = PortRange::new(7000, 7003);
    config.session.ttl_secs = 15;
    config.session.renew_secs = 5;
    config
}

async fn harness_with(registry: Arc<MemoryRegistry>, issuer: Arc<CountingIssuer>) -> Harness {
    let dir = TempDir::new().unwrap();
    let proxy = Arc::new(RecordingProxy::default());
    let controller = Controller::new(
        test_config(dir.path()),
        registry.clone(),
        issuer.clone(),
        proxy.clone(),
    );
    let ctx = controller.service_context();
    ctx.deployer.prepare(&ctx.render).await.unwrap();
    controller.locks().tick().await;

    Harness {
        _dir: dir,
        registry,
        proxy,
        issuer,
        controller,
        ctx,
    }
}

async fn harness() -> Harness {
    harness_with(
        Arc::new(MemoryRegistry::new()),
        Arc::new(CountingIssuer::new(Duration::ZERO)),
    )
    .await
}

/// Poll `check` until it holds, panicking after a few seconds
async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn tags(tags: &[&str]) -> Vec<String> {
    tags.iter().map(|t| t.to_string()).collect()
}

fn listen_port(fragment: &str) -> u16 {
    fragment
        .lines()
        .find_map(|line| line.trim().strip_prefix("listen "))
        .and_then(|rest| rest.trim_end_matches(';').split_whitespace().next())
        .and_then(|port| port.parse().ok())
        .unwrap()
}

async fn catalog_round(watcher: &mut ServiceWatcher) {
    let catalog = watcher.fetch_services(0).await.unwrap();
    watcher.check_services(&catalog.value).await;
}

#[tokio::test]
async fn test_http_service_falls_back_then_routes_to_nodes() {
    let h = harness().await;

    // Catalog knows the service, but no node is passing yet
    let handle = ServiceHandle::spawn(h.ctx.clone(), "test", tags(&["http"]));
    eventually("backup upstream", || {
        h.has_fragment("test", Bucket::Http)
            && h.fragment("test", Bucket::Upstream)
                .is_some_and(|c| c.contains("server 127.0.0.1:6666;"))
    })
    .await;
    let http = h.fragment("test", Bucket::Http).unwrap();
    assert!(!http.contains("server_name"));
    assert!(h.fragment("test", Bucket::Http2).is_none());

    h.registry.register_service(
        "test",
        vec![HealthEntry::new(
            "node-1",
            "127.0.0.1",
            10000,
            &["http", "http:example.com"],
        )],
    );
    eventually("node deploy", || {
        h.ctx
            .board
            .get("test")
            .is_some_and(|s| s.nodes == ["127.0.0.1:10000"])
    })
    .await;

    let upstream = h.fragment("test", Bucket::Upstream).unwrap();
    assert!(!upstream.contains("127.0.0.1:6666"));
    let http = h.fragment("test", Bucket::Http).unwrap();
    assert!(http.contains("server_name example.com *.example.com;"));
    assert!(http.contains("/.well-known/acme-challenge/"));
    assert!(h.ctx.reloader.stats().get_requested() >= 2);

    let status = h.ctx.board.get("test").map(|s| s.clone()).unwrap();
    assert_eq!(status.nodes, vec!["127.0.0.1:10000".to_string()]);
    assert!(status.last_error.is_none());

    handle.destroy().await;
    assert!(!h.has_fragment("test", Bucket::Upstream));
    assert!(!h.has_fragment("test", Bucket::Http));
    assert!(h.ctx.board.get("test").is_none());
}

#[tokio::test]
async fn test_http2_deploys_stub_then_tls_once_certificate_is_ready() {
    let h = harness_with(
        Arc::new(MemoryRegistry::new()),
        Arc::new(CountingIssuer::new(Duration::from_millis(300))),
    )
    .await;

    h.registry.register_service(
        "secure",
        vec![HealthEntry::new(
            "node-1",
            "10.0.0.5",
            8443,
            &["http2", "http2:secure.example"],
        )],
    );
    let handle = ServiceHandle::spawn(h.ctx.clone(), "secure", tags(&["http2"]));

    eventually("certificate stub", || {
        h.fragment("secure", Bucket::Http2)
            .is_some_and(|c| c.contains("certificate pending"))
    })
    .await;

    eventually("TLS server block", || {
        h.fragment("secure", Bucket::Http2)
            .is_some_and(|c| c.contains("ssl_certificate"))
    })
    .await;
    // Give a stray extra deploy the chance to show up
    tokio::time::sleep(Duration::from_millis(200)).await;

    let http2 = h.fragment("secure", Bucket::Http2).unwrap();
    assert!(h.has_fragment("secure", Bucket::Upstream));
    assert!(http2.contains("listen 443 ssl http2;"));
    assert!(http2.contains("return 301 https://"));
    assert_eq!(h.issuer.calls(), 1);
    // One reload for the stub, one for the TLS block
    assert_eq!(h.ctx.reloader.stats().get_requested(), 2);

    let certs = h.ctx.certificates.clone();
    assert!(certs.key_path("secure").exists());
    assert!(certs.cert_path("secure").exists());

    let keys = KeySpace::new("test");
    let id = fingerprint(&["secure.example"]);
    assert!(h
        .registry
        .get_str(&keys.certificate_field(&id, "public_key"))
        .is_some());

    handle.destroy().await;
    assert!(!certs.key_path("secure").exists());
    assert!(!h.has_fragment("secure", Bucket::Http2));
}

#[tokio::test]
async fn test_instances_sharing_a_registry_issue_once() {
    let registry = Arc::new(MemoryRegistry::new());
    let issuer = Arc::new(CountingIssuer::new(Duration::from_millis(200)));
    let a = harness_with(registry.clone(), issuer.clone()).await;
    let b = harness_with(registry.clone(), issuer.clone()).await;
    assert_eq!(registry.session_count(), 2);

    let cert_a = CertificateManager::spawn(a.ctx.certificates.clone(), "web", &["shared.example"]);
    let cert_b = CertificateManager::spawn(b.ctx.certificates.clone(), "web", &["shared.example"]);

    let ready = async {
        cert_a.wait_ready().await;
        cert_b.wait_ready().await;
    };
    tokio::time::timeout(Duration::from_secs(10), ready)
        .await
        .expect("both instances ready");

    assert_eq!(issuer.calls(), 1);
    let a_pem = std::fs::read_to_string(cert_a.cert_path()).unwrap();
    let b_pem = std::fs::read_to_string(cert_b.cert_path()).unwrap();
    assert_eq!(a_pem, b_pem);

    let lock = KeySpace::new("test").certificate_lock(cert_a.id());
    eventually("lock released", || registry.lock_holder(&lock).is_none()).await;
}

#[tokio::test]
async fn test_mismatched_stored_domains_are_reissued() {
    let h = harness().await;
    let keys = KeySpace::new("test");
    let id = fingerprint(&["a.example"]);

    // Valid material, recorded for a different domain set
    let stale = SelfSignedIssuer::new(30)
        .issue(&["other.example".to_string()])
        .await
        .unwrap();
    let fields = [
        ("private_key", stale.private_key_pem.clone()),
        ("public_key", stale.certificate_pem.clone()),
        ("expires", stale.expires_at.to_string()),
        ("key_domains", "other.example".to_string()),
    ];
    for (field, value) in fields {
        h.registry
            .kv_put(&keys.certificate_field(&id, field), value.as_bytes())
            .await
            .unwrap();
    }

    let cert = CertificateManager::spawn(h.ctx.certificates.clone(), "a", &["a.example"]);
    tokio::time::timeout(Duration::from_secs(10), cert.wait_ready())
        .await
        .expect("certificate ready");

    assert_eq!(h.issuer.calls(), 1);
    assert_eq!(
        h.registry
            .get_str(&keys.certificate_field(&id, "key_domains"))
            .as_deref(),
        Some("a.example")
    );
    cert.destroy().await;
}

#[tokio::test]
async fn test_watcher_follows_the_catalog() {
    let h = harness().await;
    let mut watcher = ServiceWatcher::new(h.ctx.clone());

    h.registry.register_service(
        "test service",
        vec![HealthEntry::new("node-1", "10.0.0.1", 8080, &["http"])],
    );
    h.registry.register_service(
        "metrics",
        vec![HealthEntry::new("node-1", "10.0.0.1", 9100, &["prometheus"])],
    );
    catalog_round(&mut watcher).await;

    assert!(watcher.contains("test service"));
    assert!(!watcher.contains("metrics"));
    eventually("fragments for the slugged id", || {
        h.has_fragment("test-service", Bucket::Http)
    })
    .await;

    h.registry.deregister_service("test service");
    catalog_round(&mut watcher).await;

    assert!(!watcher.contains("test service"));
    assert!(watcher.services().is_empty());
    assert!(!h.has_fragment("test-service", Bucket::Upstream));
    assert!(!h.has_fragment("test-service", Bucket::Http));
    assert!(h.ctx.board.is_empty());
}

#[tokio::test]
async fn test_stream_services_get_distinct_ports() {
    let h = harness().await;
    let mut watcher = ServiceWatcher::new(h.ctx.clone());

    h.registry.register_service(
        "db",
        vec![HealthEntry::new("node-1", "10.0.0.2", 5432, &["tcp"])],
    );
    h.registry.register_service(
        "cache",
        vec![HealthEntry::new("node-1", "10.0.0.3", 11211, &["udp"])],
    );
    catalog_round(&mut watcher).await;

    eventually("stream fragments", || {
        h.has_fragment("db", Bucket::Tcp) && h.has_fragment("cache", Bucket::Udp)
    })
    .await;

    let db = h.fragment("db", Bucket::Tcp).unwrap();
    let cache = h.fragment("cache", Bucket::Udp).unwrap();
    let db_port = listen_port(&db);
    let cache_port = listen_port(&cache);
    assert_ne!(db_port, cache_port);
    assert!((7000..=7003).contains(&db_port));
    assert!(cache.contains(" udp;"));
    assert!(db.contains("server 10.0.0.2:5432;"));
    assert!(!h.has_fragment("db", Bucket::Http));

    let keys = KeySpace::new("test");
    assert_eq!(
        h.registry.get_str(&keys.port("db")),
        Some(db_port.to_string())
    );

    h.registry.deregister_service("db");
    catalog_round(&mut watcher).await;

    assert!(!h.has_fragment("db", Bucket::Tcp));
    assert!(h.registry.get_str(&keys.port("db")).is_none());
    assert!(h.ctx.ports.port("db").is_none());
    assert_eq!(h.ctx.ports.port("cache"), Some(cache_port));
}

#[tokio::test]
async fn test_dropped_binding_removes_fragment_and_port() {
    let h = harness().await;
    h.registry.register_service(
        "mixed",
        vec![HealthEntry::new("node-1", "10.0.0.4", 6000, &["http", "tcp"])],
    );
    let handle = ServiceHandle::spawn(h.ctx.clone(), "mixed", tags(&["http", "tcp"]));
    eventually("tcp fragment", || h.has_fragment("mixed", Bucket::Tcp)).await;
    assert!(h.ctx.ports.port("mixed").is_some());

    h.registry.register_service(
        "mixed",
        vec![HealthEntry::new("node-1", "10.0.0.4", 6000, &["http"])],
    );
    eventually("tcp fragment removed", || !h.has_fragment("mixed", Bucket::Tcp)).await;

    assert!(h.has_fragment("mixed", Bucket::Http));
    eventually("port released", || h.ctx.ports.port("mixed").is_none()).await;
    handle.stop().await;
}

#[tokio::test]
async fn test_starved_service_takes_a_freed_port() {
    let h = harness().await;
    let mut handles = Vec::new();
    for (i, name) in ["s1", "s2", "s3", "s4"].into_iter().enumerate() {
        h.registry.register_service(
            name,
            vec![HealthEntry::new("node-1", "10.0.0.1", 5000 + i as u16, &["tcp"])],
        );
        handles.push(ServiceHandle::spawn(h.ctx.clone(), name, tags(&["tcp"])));
        eventually("service active", || {
            h.ctx
                .board
                .get(name)
                .is_some_and(|s| s.state == ServiceState::Active)
        })
        .await;
    }

    // Three ports for four services
    assert_eq!(h.ctx.ports.allocated().len(), 3);
    assert!(h.ctx.ports.port("s4").is_none());
    assert!(!h.has_fragment("s4", Bucket::Tcp));

    let s1_port = h.ctx.ports.port("s1").unwrap();
    let mut handles = handles.into_iter();
    handles.next().unwrap().destroy().await;

    eventually("freed port reused", || h.ctx.ports.port("s4") == Some(s1_port)).await;
    eventually("stream fragment", || h.has_fragment("s4", Bucket::Tcp)).await;
    assert_eq!(listen_port(&h.fragment("s4", Bucket::Tcp).unwrap()), s1_port);

    for handle in handles {
        handle.stop().await;
    }
}

#[tokio::test]
async fn test_rejected_candidate_keeps_previous_fragments() {
    let h = harness().await;
    h.registry.register_service(
        "api",
        vec![HealthEntry::new("node-1", "10.0.0.1", 8080, &["http"])],
    );
    let handle = ServiceHandle::spawn(h.ctx.clone(), "api", tags(&["http"]));
    eventually("first deploy", || {
        h.fragment("api", Bucket::Upstream)
            .is_some_and(|c| c.contains("10.0.0.1:8080"))
    })
    .await;

    h.proxy.reject.store(true, Ordering::SeqCst);
    h.registry.register_service(
        "api",
        vec![HealthEntry::new("node-2", "10.0.0.9", 8080, &["http"])],
    );
    eventually("rejection recorded", || {
        h.ctx
            .board
            .get("api")
            .is_some_and(|s| s.last_error.is_some())
    })
    .await;
    let upstream = h.fragment("api", Bucket::Upstream).unwrap();
    assert!(upstream.contains("10.0.0.1:8080"));
    assert!(!upstream.contains("10.0.0.9"));

    h.proxy.reject.store(false, Ordering::SeqCst);
    h.registry.register_service(
        "api",
        vec![HealthEntry::new("node-3", "10.0.0.10", 8080, &["http"])],
    );
    eventually("recovered deploy", || {
        h.fragment("api", Bucket::Upstream)
            .is_some_and(|c| c.contains("10.0.0.10:8080"))
    })
    .await;
    handle.stop().await;
}

#[tokio::test]
async fn test_unchanged_health_is_not_redeployed() {
    let h = harness().await;
    let entries = vec![
        HealthEntry::new("node-1", "10.0.0.1", 8080, &["http"]),
        HealthEntry::new("node-2", "10.0.0.2", 8080, &["http"]),
    ];
    h.registry.register_service("steady", entries.clone());
    let handle = ServiceHandle::spawn(h.ctx.clone(), "steady", tags(&["http"]));
    eventually("first deploy", || h.has_fragment("steady", Bucket::Upstream)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let checks = h.proxy.checks();
    let requested = h.ctx.reloader.stats().get_requested();

    // Same nodes, listed in a different order
    h.registry
        .register_service("steady", entries.into_iter().rev().collect());
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(h.proxy.checks(), checks);
    assert_eq!(h.ctx.reloader.stats().get_requested(), requested);
    handle.stop().await;
}

#[tokio::test]
async fn test_controller_run_and_shutdown() {
    let h = harness().await;
    let registry = h.registry.clone();
    let proxy = h.proxy.clone();
    let config_dir = h.controller.config().proxy.config_dir.clone();
    let Harness {
        _dir, controller, ..
    } = h;

    registry.register_service(
        "web",
        vec![HealthEntry::new("node-1", "10.0.0.1", 8080, &["http", "http:web.example"])],
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(controller.run(shutdown_rx));

    let http: PathBuf = config_dir.join("http").join("web.http.conf");
    eventually("deployed fragment", || http.exists()).await;
    eventually("proxy reloaded", || proxy.reloads() >= 1).await;
    assert!(config_dir.join("http").join("_fallback.conf").exists());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("controller stops")
        .unwrap()
        .unwrap();

    // Shutdown leaves the proxy serving the last configuration
    assert!(http.exists());
    assert_eq!(registry.session_count(), 0);
}
