use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the controller
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Service registry connection
    #[serde(default)]
    pub registry: RegistryConfig,

    /// External proxy process (nginx) settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Certificate issuance
    #[serde(default)]
    pub acme: AcmeConfig,

    /// Controller HTTP endpoint (challenge responder, status)
    #[serde(default)]
    pub admin: AdminConfig,

    /// Allocatable range for tcp/udp listeners
    #[serde(default)]
    pub ports: PortRange,

    /// Lock session lease timings
    #[serde(default)]
    pub session: SessionConfig,

    /// Certificate issuer worker pool
    #[serde(default)]
    pub issuer: IssuerConfig,

    /// Scratch space for configuration dry runs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Shared secret protecting the status endpoint (required)
    pub secret: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Base URL of the Consul agent
    #[serde(default = "default_registry_address")]
    pub address: String,

    /// Root prefix for every key the controller owns
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Maximum wait for blocking queries in seconds
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,

    /// Sleep after a registry error before the next attempt
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: default_registry_address(),
            namespace: default_namespace(),
            wait_secs: default_wait_secs(),
            error_backoff_secs: default_error_backoff_secs(),
        }
    }
}

impl RegistryConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Directory nginx includes fragments from
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Path to the nginx binary
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Plaintext listen port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// TLS listen port
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Local port of the 503 responder used as the upstream backup
    #[serde(default = "default_fallback_port")]
    pub fallback_port: u16,

    /// Delay before a queued reload runs, so bursts collapse into one
    #[serde(default = "default_reload_debounce_ms")]
    pub reload_debounce_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            binary: default_binary(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            fallback_port: default_fallback_port(),
            reload_debounce_ms: default_reload_debounce_ms(),
        }
    }
}

impl ProxyConfig {
    pub fn reload_debounce(&self) -> Duration {
        Duration::from_millis(self.reload_debounce_ms)
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.config_dir.join("certs")
    }
}

/// ACME (Let's Encrypt) configuration. When disabled, certificates are
/// self-signed locally.
#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    #[serde(default)]
    pub enabled: bool,

    /// ACME directory URL (defaults to Let's Encrypt staging)
    #[serde(default = "default_directory_url")]
    pub directory_url: String,

    /// Contact email for account registration
    #[serde(default = "default_email")]
    pub email: String,

    /// Validity of self-signed certificates in days
    #[serde(default = "default_self_signed_days")]
    pub self_signed_days: i64,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory_url: default_directory_url(),
            email: default_email(),
            self_signed_days: default_self_signed_days(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    #[serde(default = "default_admin_bind")]
    pub bind: String,

    #[serde(default = "default_admin_port")]
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind: default_admin_bind(),
            port: default_admin_port(),
        }
    }
}

impl AdminConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid admin bind address '{}': {}", self.bind, e))
    }
}

/// Half-open port range `[min, max)`
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    #[serde(default = "default_min_port")]
    pub min: u16,

    #[serde(default = "default_max_port")]
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: default_min_port(),
            max: default_max_port(),
        }
    }
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port < self.max
    }

    pub fn width(&self) -> usize {
        self.max.saturating_sub(self.min) as usize
    }

    /// Parse `"7000-8000"` (or `"7000,8000"`)
    pub fn parse(value: &str) -> Option<Self> {
        let (min, max) = value.split_once(['-', ','])?;
        Some(Self {
            min: min.trim().parse().ok()?,
            max: max.trim().parse().ok()?,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Lease TTL in seconds
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// Renewal interval in seconds, must stay below the TTL
    #[serde(default = "default_session_renew")]
    pub renew_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            renew_secs: default_session_renew(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IssuerConfig {
    /// Concurrent issuance limit
    #[serde(default = "default_issuer_workers")]
    pub workers: usize,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            workers: default_issuer_workers(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            proxy: ProxyConfig::default(),
            acme: AcmeConfig::default(),
            admin: AdminConfig::default(),
            ports: PortRange::default(),
            session: SessionConfig::default(),
            issuer: IssuerConfig::default(),
            data_dir: default_data_dir(),
            secret: None,
        }
    }
}

// Default value functions
fn default_registry_address() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_namespace() -> String {
    "catalog-proxy".to_string()
}

fn default_wait_secs() -> u64 {
    300 // Consul caps blocking queries at 10 minutes
}

fn default_error_backoff_secs() -> u64 {
    5
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/conf.d")
}

fn default_binary() -> PathBuf {
    PathBuf::from("/usr/sbin/nginx")
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_fallback_port() -> u16 {
    6666
}

fn default_reload_debounce_ms() -> u64 {
    500
}

fn default_directory_url() -> String {
    "https://acme-staging-v02.api.letsencrypt.org/directory".to_string()
}

fn default_email() -> String {
    "root@localhost".to_string()
}

fn default_self_signed_days() -> i64 {
    3650
}

fn default_admin_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    8888
}

fn default_min_port() -> u16 {
    7000
}

fn default_max_port() -> u16 {
    8000
}

fn default_session_ttl() -> u64 {
    10
}

fn default_session_renew() -> u64 {
    5 // tolerates one missed renewal within the TTL
}

fn default_issuer_workers() -> usize {
    4
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides
    /// and validate.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> anyhow::Result<Self> {
        let mut config: Config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                toml::from_str(&content)?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment-style variables
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("CONSUL_HOST") {
            let port = lookup("CONSUL_PORT").unwrap_or_else(|| "8500".to_string());
            self.registry.address = if host.contains("://") {
                host
            } else {
                format!("http://{}:{}", host, port)
            };
        }
        if let Some(ns) = lookup("REGISTRY_NAMESPACE") {
            self.registry.namespace = ns;
        }
        if let Some(dir) = lookup("DATA_PATH") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("NGINX_CONFIG_PATH") {
            self.proxy.config_dir = PathBuf::from(dir);
        }
        if let Some(binary) = lookup("NGINX_BINARY") {
            self.proxy.binary = PathBuf::from(binary);
        }
        if let Some(port) = lookup("NGINX_HTTP_PORT") {
            self.proxy.http_port = parse_env("NGINX_HTTP_PORT", &port)?;
        }
        if let Some(port) = lookup("NGINX_HTTP2_PORT") {
            self.proxy.https_port = parse_env("NGINX_HTTP2_PORT", &port)?;
        }
        if let Some(enabled) = lookup("ACME_ENABLED") {
            self.acme.enabled = matches!(enabled.as_str(), "1" | "true" | "yes");
        }
        if let Some(url) = lookup("ACME_DIRECTORY_URL") {
            self.acme.directory_url = url;
        }
        if let Some(email) = lookup("EMAIL") {
            self.acme.email = email;
        }
        if let Some(port) = lookup("ADMIN_PORT") {
            self.admin.port = parse_env("ADMIN_PORT", &port)?;
        }
        if let Some(secret) = lookup("SECRET") {
            self.secret = Some(secret);
        }
        if let Some(range) = lookup("PROXY_PORTS") {
            self.ports = PortRange::parse(&range).ok_or_else(|| {
                anyhow::anyhow!("PROXY_PORTS must look like 'min-max', got '{}'", range)
            })?;
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.secret.as_deref().map_or(true, |s| s.trim().is_empty()) {
            errors.push("No secret specified (set SECRET or 'secret')".to_string());
        }
        if self.ports.min >= self.ports.max {
            errors.push(format!(
                "Port range [{}, {}) is empty",
                self.ports.min, self.ports.max
            ));
        }
        if self.session.renew_secs == 0 || self.session.renew_secs >= self.session.ttl_secs {
            errors.push(format!(
                "Session renew interval ({}s) must be positive and shorter than the TTL ({}s)",
                self.session.renew_secs, self.session.ttl_secs
            ));
        }
        if self.issuer.workers == 0 {
            errors.push("Issuer pool needs at least one worker".to_string());
        }
        if self.registry.namespace.trim_matches('/').is_empty() {
            errors.push("Registry namespace must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// The shared secret, after validation guarantees it is present
    pub fn secret(&self) -> &str {
        self.secret.as_deref().unwrap_or_default()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {}: '{}'", key, value))
}
