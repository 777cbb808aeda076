//! Per-service state machine
//!
//! Every published registry service gets a [`ServiceHandle`]: a task that
//! long-polls the service's passing health entries, rebuilds its protocol
//! bindings, and deploys the rendered fragments. TLS services first deploy a
//! stub that keeps ACME challenges reachable and switch to the full
//! configuration once their certificate is ready.

use crate::certificate::{fingerprint, CertificateContext, CertificateManager};
use crate::deploy::{ConfigDeployer, DeployOutcome};
use crate::error::DeployError;
use crate::ports::PortAllocator;
use crate::registry::{next_index, HealthEntry, Registry};
use crate::reload::ReloadCoordinator;
use crate::render::{render, RenderContext, RenderInput, TlsFiles, UpstreamNode};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use unicode_normalization::UnicodeNormalization;

/// Tag that turns on permissive CORS headers for a service
pub const ALLOW_CROSSDOMAIN_TAG: &str = "allow_crossdomain";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Http2,
    Tcp,
    Udp,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [Protocol::Http, Protocol::Http2, Protocol::Tcp, Protocol::Udp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Http2 => "http2",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == tag)
    }
}

/// Whether a tag list marks a service for publication
pub fn is_published<S: AsRef<str>>(tags: &[S]) -> bool {
    tags.iter().any(|t| Protocol::parse(t.as_ref()).is_some())
}

/// Filesystem-safe identifier for a service name: NFKD-normalized, reduced
/// to ASCII word characters and hyphens, lowercased, with runs of spaces
/// and hyphens collapsed to a single hyphen.
pub fn slugify(name: &str) -> String {
    let kept: String = name
        .nfkd()
        .filter(|c| c.is_ascii())
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-' || c.is_ascii_whitespace())
        .collect();
    let lowered = kept.trim().to_lowercase();

    let mut slug = String::with_capacity(lowered.len());
    let mut separator = false;
    for c in lowered.chars() {
        if c == '-' || c.is_ascii_whitespace() {
            separator = true;
            continue;
        }
        if separator {
            slug.push('-');
            separator = false;
        }
        slug.push(c);
    }
    if separator {
        slug.push('-');
    }
    slug
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Loading,
    Active,
    Destroying,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Node {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
}

/// What one round of health data says about a service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub nodes: Vec<Node>,
    pub bindings: BTreeMap<Protocol, BTreeSet<String>>,
    pub allow_crossdomain: bool,
}

impl Snapshot {
    /// Build from passing health entries. Entries without a port or tags are
    /// ignored.
    pub fn from_health(service: &str, entries: &[HealthEntry]) -> Self {
        let mut snapshot = Self::default();
        for entry in entries {
            let Some(port) = entry.port else {
                warn!(service, node = %entry.node, "Node ignored, no service port");
                continue;
            };
            let Some(tags) = &entry.tags else {
                warn!(service, node = %entry.node, "Node ignored, no service tags");
                continue;
            };

            snapshot.allow_crossdomain |= tags.iter().any(|t| t == ALLOW_CROSSDOMAIN_TAG);
            collect_bindings(&mut snapshot.bindings, tags, Some(port));
            snapshot.nodes.push(Node {
                name: entry.node.clone(),
                address: entry.address.clone(),
                port,
                tags: tags.clone(),
            });
        }
        snapshot.nodes.sort();
        snapshot.nodes.dedup();
        snapshot
    }

    /// Build from the catalog's tag union, used while no node is passing so
    /// the service keeps answering through its fallback upstream
    pub fn from_catalog_tags(tags: &[String]) -> Self {
        let mut snapshot = Self {
            allow_crossdomain: tags.iter().any(|t| t == ALLOW_CROSSDOMAIN_TAG),
            ..Default::default()
        };
        collect_bindings(&mut snapshot.bindings, tags, None);
        snapshot
    }
}

/// A bare protocol tag binds the protocol. For http and http2 the
/// `<protocol>:<domain>` tags of the same node add domains; for tcp and udp
/// the node's port is recorded.
fn collect_bindings(bindings: &mut BTreeMap<Protocol, BTreeSet<String>>, tags: &[String], port: Option<u16>) {
    for protocol in Protocol::ALL {
        if !tags.iter().any(|t| t == protocol.as_str()) {
            continue;
        }
        let values = bindings.entry(protocol).or_default();
        match protocol {
            Protocol::Http | Protocol::Http2 => {
                let prefix = format!("{}:", protocol.as_str());
                values.extend(
                    tags.iter()
                        .filter_map(|t| t.strip_prefix(prefix.as_str()))
                        .filter(|d| !d.is_empty())
                        .map(str::to_string),
                );
            }
            Protocol::Tcp | Protocol::Udp => {
                if let Some(port) = port {
                    values.insert(port.to_string());
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CertificateStatus {
    pub id: String,
    pub domains: Vec<String>,
    pub ready: bool,
}

/// Point-in-time view of a service for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub id: String,
    pub state: ServiceState,
    pub nodes: Vec<String>,
    pub bindings: BTreeMap<Protocol, BTreeSet<String>>,
    pub allow_crossdomain: bool,
    pub port: Option<u16>,
    pub certificate: Option<CertificateStatus>,
    pub last_deployed: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Latest status of every live service, keyed by service name
pub type StatusBoard = DashMap<String, ServiceStatus>;

/// Collaborators shared by all services
pub struct ServiceContext {
    pub registry: Arc<dyn Registry>,
    pub ports: Arc<PortAllocator>,
    pub certificates: Arc<CertificateContext>,
    pub deployer: Arc<ConfigDeployer>,
    pub reloader: Arc<ReloadCoordinator>,
    pub render: RenderContext,
    pub board: Arc<StatusBoard>,
    pub wait: Duration,
    pub error_backoff: Duration,
}

pub struct Service {
    ctx: Arc<ServiceContext>,
    name: String,
    id: String,
    state: ServiceState,
    nodes: Vec<Node>,
    bindings: BTreeMap<Protocol, BTreeSet<String>>,
    allow_crossdomain: bool,
    catalog_tags: Vec<String>,
    port: Option<u16>,
    certificate: Option<CertificateManager>,
    /// Certificate id the last render used for TLS
    tls_rendered: Option<String>,
    last_deployed: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl Service {
    pub fn new(ctx: Arc<ServiceContext>, name: &str, catalog_tags: Vec<String>) -> Self {
        let id = slugify(name);
        info!(service = name, id = %id, "New service, loading");
        Self {
            ctx,
            name: name.to_string(),
            id,
            state: ServiceState::Loading,
            nodes: Vec::new(),
            bindings: BTreeMap::new(),
            allow_crossdomain: false,
            catalog_tags,
            port: None,
            certificate: None,
            tls_rendered: None,
            last_deployed: None,
            last_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn bindings(&self) -> &BTreeMap<Protocol, BTreeSet<String>> {
        &self.bindings
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn certificate(&self) -> Option<&CertificateManager> {
        self.certificate.as_ref()
    }

    /// Replace nodes and bindings wholesale from a new round of health data
    pub fn apply_health(&mut self, entries: &[HealthEntry]) {
        let mut snapshot = Snapshot::from_health(&self.name, entries);
        if snapshot.nodes.is_empty() {
            snapshot = Snapshot::from_catalog_tags(&self.catalog_tags);
        }

        debug!(
            service = %self.name,
            nodes = snapshot.nodes.len(),
            bindings = ?snapshot.bindings,
            "Health data applied"
        );
        self.nodes = snapshot.nodes;
        self.bindings = snapshot.bindings;
        self.allow_crossdomain = snapshot.allow_crossdomain;
        if self.state == ServiceState::Loading {
            self.state = ServiceState::Active;
            info!(service = %self.name, "Service active");
        }
    }

    pub fn set_catalog_tags(&mut self, tags: Vec<String>) {
        self.catalog_tags = tags;
    }

    /// Bring port, certificate and deployed fragments in line with the
    /// current bindings. A rejected candidate keeps the previous fragments.
    pub async fn deploy(&mut self) -> Result<DeployOutcome, DeployError> {
        self.sync_port().await;
        self.sync_certificate().await;

        let input = self.render_input();
        self.tls_rendered = match (&input.tls, &self.certificate) {
            (Some(_), Some(cert)) => Some(cert.id().to_string()),
            _ => None,
        };
        let candidate = render(&input, &self.ctx.render);

        let result = self.ctx.deployer.deploy(&self.id, &candidate).await;
        match &result {
            Ok(outcome) => {
                if outcome.changed() {
                    info!(
                        service = %self.name,
                        written = outcome.written.len(),
                        removed = outcome.removed.len(),
                        tls = input.tls.is_some(),
                        "Configuration deployed"
                    );
                    self.last_deployed = Some(Utc::now());
                    self.ctx.reloader.queue_reload();
                }
                self.last_error = None;
            }
            Err(e) => {
                error!(service = %self.name, error = %e, "Configuration rejected, keeping previous");
                self.last_error = Some(e.to_string());
            }
        }
        self.publish_status();
        result
    }

    /// Snapshot the inputs of rendering
    pub fn render_input(&self) -> RenderInput {
        let tls = self
            .certificate
            .as_ref()
            .filter(|cert| cert.is_ready())
            .map(|cert| TlsFiles {
                certificate: cert.cert_path().to_path_buf(),
                key: cert.key_path().to_path_buf(),
            });

        RenderInput {
            id: self.id.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|n| UpstreamNode {
                    address: n.address.clone(),
                    port: n.port,
                })
                .collect(),
            bindings: self.bindings.clone(),
            allow_crossdomain: self.allow_crossdomain,
            allocated_port: self.port,
            tls,
        }
    }

    fn wants_port(&self) -> bool {
        self.bindings.contains_key(&Protocol::Tcp) || self.bindings.contains_key(&Protocol::Udp)
    }

    /// Stream bindings are waiting for a free port
    pub fn port_starved(&self) -> bool {
        self.wants_port() && self.port.is_none()
    }

    async fn sync_port(&mut self) {
        match (self.wants_port(), self.port) {
            (true, None) => match self.ctx.ports.allocate(&self.id).await {
                Ok(port) => self.port = Some(port),
                Err(e) => {
                    error!(service = %self.name, error = %e, "Port allocation failed, stream fragments omitted");
                }
            },
            (false, Some(_)) => {
                if let Err(e) = self.ctx.ports.release(&self.id).await {
                    warn!(service = %self.name, error = %e, "Failed to release port");
                }
                self.port = None;
            }
            _ => {}
        }
    }

    async fn sync_certificate(&mut self) {
        let domains: Vec<String> = self
            .bindings
            .get(&Protocol::Http2)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default();

        if domains.is_empty() {
            if let Some(cert) = self.certificate.take() {
                cert.destroy().await;
            }
            return;
        }

        let wanted = fingerprint(&domains);
        if self.certificate.as_ref().map(|c| c.id()) == Some(wanted.as_str()) {
            return;
        }

        if let Some(previous) = self.certificate.take() {
            info!(service = %self.name, from = %previous.id(), to = %wanted, "TLS domains changed");
            previous.stop().await;
        }
        self.certificate = Some(CertificateManager::spawn(
            Arc::clone(&self.ctx.certificates),
            &self.id,
            &domains,
        ));
    }

    /// Tear down: fragments, certificate, port. Idempotent.
    pub async fn destroy(&mut self) {
        if self.state == ServiceState::Destroyed {
            return;
        }
        self.state = ServiceState::Destroying;
        info!(service = %self.name, "Destroying service");

        match self.ctx.deployer.remove_all(&self.id).await {
            Ok(removed) if !removed.is_empty() => self.ctx.reloader.queue_reload(),
            Ok(_) => {}
            Err(e) => error!(service = %self.name, error = %e, "Failed to remove configuration"),
        }
        if let Some(cert) = self.certificate.take() {
            cert.destroy().await;
        }
        if let Err(e) = self.ctx.ports.release(&self.id).await {
            warn!(service = %self.name, error = %e, "Failed to release port");
        }
        self.port = None;

        self.state = ServiceState::Destroyed;
        self.ctx.board.remove(&self.name);
        info!(service = %self.name, "Service destroyed");
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            name: self.name.clone(),
            id: self.id.clone(),
            state: self.state,
            nodes: self
                .nodes
                .iter()
                .map(|n| format!("{}:{}", n.address, n.port))
                .collect(),
            bindings: self.bindings.clone(),
            allow_crossdomain: self.allow_crossdomain,
            port: self.port,
            certificate: self.certificate.as_ref().map(|c| CertificateStatus {
                id: c.id().to_string(),
                domains: c.domains().to_vec(),
                ready: c.is_ready(),
            }),
            last_deployed: self.last_deployed,
            last_error: self.last_error.clone(),
        }
    }

    fn publish_status(&self) {
        self.ctx.board.insert(self.name.clone(), self.status());
    }

    async fn run(mut self, mut stop_rx: watch::Receiver<bool>, mut tags_rx: watch::Receiver<Vec<String>>) -> Self {
        let registry = Arc::clone(&self.ctx.registry);
        let wait = self.ctx.wait;
        let backoff = self.ctx.error_backoff;
        let name = self.name.clone();
        let mut index = 0;
        let mut last: Option<Vec<HealthEntry>> = None;

        self.publish_status();
        loop {
            if *stop_rx.borrow() {
                break;
            }

            tokio::select! {
                res = stop_rx.changed() => {
                    if res.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                res = tags_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                    let tags = tags_rx.borrow_and_update().clone();
                    self.set_catalog_tags(tags);
                    // Tags only shape the bindings while no node is passing
                    if self.state == ServiceState::Active && self.nodes.is_empty() {
                        let entries = last.clone().unwrap_or_default();
                        self.apply_health(&entries);
                        let _ = self.deploy().await;
                    }
                }
                res = registry.watch_health(&name, index, wait) => match res {
                    Ok(result) => {
                        index = next_index(index, result.index);
                        let mut entries = result.value;
                        entries.sort();
                        if last.as_ref() == Some(&entries) {
                            if self.port_starved() {
                                let _ = self.deploy().await;
                            }
                            continue;
                        }
                        self.apply_health(&entries);
                        last = Some(entries);
                        let _ = self.deploy().await;
                    }
                    Err(e) if e.is_timeout() => {}
                    Err(e) => {
                        error!(service = %name, error = %e, "Registry error while watching health");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = stop_rx.changed() => {}
                        }
                    }
                },
                _ = tls_pending(self.certificate.as_ref(), self.tls_rendered.as_deref()) => {
                    debug!(service = %name, "Certificate ready, deploying TLS configuration");
                    let _ = self.deploy().await;
                }
                _ = port_freed(&self.ctx.ports, self.port_starved()) => {
                    debug!(service = %name, "Port freed, retrying allocation");
                    let _ = self.deploy().await;
                }
            }
        }

        debug!(service = %name, "Service loop stopped");
        self
    }
}

/// Resolves once a certificate is ready that the deployed fragments do not
/// use yet
async fn tls_pending(cert: Option<&CertificateManager>, rendered: Option<&str>) {
    match cert {
        Some(cert) if rendered != Some(cert.id()) => cert.wait_ready().await,
        _ => std::future::pending().await,
    }
}

/// Resolves once another service gives up its port, while this one has none
async fn port_freed(ports: &PortAllocator, starved: bool) {
    if starved {
        ports.freed().await
    } else {
        std::future::pending().await
    }
}

/// Owner of a running service task
pub struct ServiceHandle {
    ctx: Arc<ServiceContext>,
    name: String,
    id: String,
    stop_tx: watch::Sender<bool>,
    tags_tx: watch::Sender<Vec<String>>,
    task: JoinHandle<Service>,
}

impl ServiceHandle {
    pub fn spawn(ctx: Arc<ServiceContext>, name: &str, catalog_tags: Vec<String>) -> Self {
        let service = Service::new(Arc::clone(&ctx), name, catalog_tags.clone());
        let id = service.id().to_string();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (tags_tx, tags_rx) = watch::channel(catalog_tags);
        let task = tokio::spawn(service.run(stop_rx, tags_rx));

        Self {
            ctx,
            name: name.to_string(),
            id,
            stop_tx,
            tags_tx,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Forward the catalog's current tag union for this service
    pub fn update_tags(&self, tags: Vec<String>) {
        self.tags_tx.send_if_modified(|current| {
            if *current == tags {
                return false;
            }
            *current = tags;
            true
        });
    }

    async fn join(self) -> Result<Service, (Arc<ServiceContext>, String, String)> {
        let _ = self.stop_tx.send(true);
        match self.task.await {
            Ok(service) => Ok(service),
            Err(e) => {
                error!(service = %self.name, error = %e, "Service task failed");
                Err((self.ctx, self.name, self.id))
            }
        }
    }

    /// Stop the task and remove everything the service deployed
    pub async fn destroy(self) {
        match self.join().await {
            Ok(mut service) => service.destroy().await,
            Err((ctx, name, id)) => {
                if let Ok(removed) = ctx.deployer.remove_all(&id).await {
                    if !removed.is_empty() {
                        ctx.reloader.queue_reload();
                    }
                }
                let _ = ctx.ports.release(&id).await;
                ctx.board.remove(&name);
            }
        }
    }

    /// Stop the task, leaving deployed configuration in place for the proxy
    pub async fn stop(self) {
        if let Ok(service) = self.join().await {
            if let Some(cert) = service.certificate {
                cert.stop().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(node: &str, port: u16, tags: &[&str]) -> HealthEntry {
        HealthEntry::new(node, "10.0.0.1", port, tags)
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("test service"), "test-service");
        assert_eq!(slugify("  My  Service--Name "), "my-service-name");
        assert_eq!(slugify("Café Ünïcode"), "cafe-unicode");
        assert_eq!(slugify("api_v2!"), "api_v2");
        assert_eq!(slugify("a.b/c"), "abc");
    }

    #[test]
    fn test_slugify_is_idempotent() {
        for name in ["test service", "Ärger -- im Büro", "x_y-z", "trailing-", "-lead"] {
            let once = slugify(name);
            assert_eq!(slugify(&once), once, "{name}");
        }
    }

    #[test]
    fn test_protocol_tags() {
        assert_eq!(Protocol::parse("http2"), Some(Protocol::Http2));
        assert_eq!(Protocol::parse("http:example.com"), None);
        assert!(is_published(&["udp"]));
        assert!(!is_published(&["http:example.com", "allow_crossdomain"]));
    }

    #[test]
    fn test_domains_need_bare_tag_on_same_node() {
        let entries = vec![
            entry("n1", 80, &["http", "http:a.com"]),
            entry("n2", 80, &["http:b.com"]),
            entry("n3", 443, &["http2", "http2:secure.com", "http:c.com"]),
        ];
        let snapshot = Snapshot::from_health("web", &entries);

        assert_eq!(
            snapshot.bindings.get(&Protocol::Http).unwrap(),
            &BTreeSet::from(["a.com".to_string()])
        );
        assert_eq!(
            snapshot.bindings.get(&Protocol::Http2).unwrap(),
            &BTreeSet::from(["secure.com".to_string()])
        );
        assert_eq!(snapshot.nodes.len(), 3);
    }

    #[test]
    fn test_nodes_without_port_or_tags_are_ignored() {
        let mut no_port = entry("n1", 80, &["http"]);
        no_port.port = None;
        let mut no_tags = entry("n2", 80, &[]);
        no_tags.tags = None;
        let snapshot = Snapshot::from_health("web", &[no_port, no_tags, entry("n3", 8080, &["tcp"])]);

        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.nodes[0].port, 8080);
        assert_eq!(
            snapshot.bindings.get(&Protocol::Tcp).unwrap(),
            &BTreeSet::from(["8080".to_string()])
        );
        assert!(!snapshot.bindings.contains_key(&Protocol::Http));
    }

    #[test]
    fn test_crossdomain_tag() {
        let snapshot = Snapshot::from_health("web", &[entry("n1", 80, &["http", "allow_crossdomain"])]);
        assert!(snapshot.allow_crossdomain);
        let snapshot = Snapshot::from_health("web", &[entry("n1", 80, &["http"])]);
        assert!(!snapshot.allow_crossdomain);
    }

    #[test]
    fn test_catalog_tags_bind_without_nodes() {
        let tags: Vec<String> = ["http", "http:a.com", "tcp"].iter().map(|t| t.to_string()).collect();
        let snapshot = Snapshot::from_catalog_tags(&tags);
        assert!(snapshot.nodes.is_empty());
        assert!(snapshot.bindings.get(&Protocol::Http).unwrap().contains("a.com"));
        assert!(snapshot.bindings.get(&Protocol::Tcp).unwrap().is_empty());
    }
}
