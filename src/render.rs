//! nginx fragment rendering
//!
//! A service renders to at most five fragments, one per [`Bucket`]. HTTP
//! fragments are included from `<config_dir>/http/` inside nginx's `http {}`
//! block and TCP/UDP fragments from `<config_dir>/stream/` inside `stream {}`.
//! Rendering is pure: the same snapshot always yields byte-identical output,
//! which is what lets the deployer skip unchanged files.

use crate::service::Protocol;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Prefix proxied to the controller so any instance can answer HTTP-01
pub const CHALLENGE_PATH: &str = "/.well-known/acme-challenge/";

/// File name of the shared 503 responder fragment
pub const FALLBACK_FILE: &str = "_fallback.conf";

/// Directory of fragments included in nginx's `http {}` block
pub const HTTP_DIR: &str = "http";

/// Directory of fragments included in nginx's `stream {}` block
pub const STREAM_DIR: &str = "stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    Upstream,
    Http,
    Http2,
    Tcp,
    Udp,
}

impl Bucket {
    pub const ALL: [Bucket; 5] = [
        Bucket::Upstream,
        Bucket::Http,
        Bucket::Http2,
        Bucket::Tcp,
        Bucket::Udp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Upstream => "upstream",
            Bucket::Http => "http",
            Bucket::Http2 => "http2",
            Bucket::Tcp => "tcp",
            Bucket::Udp => "udp",
        }
    }

    /// Directory the fragment is included from
    pub fn dir(&self) -> &'static str {
        match self {
            Bucket::Upstream | Bucket::Http | Bucket::Http2 => HTTP_DIR,
            Bucket::Tcp | Bucket::Udp => STREAM_DIR,
        }
    }

    pub fn file_name(&self, service_id: &str) -> String {
        format!("{}.{}.conf", service_id, self.as_str())
    }

    /// Path of the fragment relative to the config directory
    pub fn relative_path(&self, service_id: &str) -> PathBuf {
        Path::new(self.dir()).join(self.file_name(service_id))
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rendering parameters shared by every service
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub http_port: u16,
    pub https_port: u16,
    pub fallback_port: u16,
    /// `host:port` of the admin server answering ACME challenges
    pub challenge_upstream: String,
}

impl Default for RenderContext {
    fn default() -> Self {
        Self {
            http_port: 80,
            https_port: 443,
            fallback_port: 6666,
            challenge_upstream: "127.0.0.1:8888".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct UpstreamNode {
    pub address: String,
    pub port: u16,
}

/// Key material paths for the TLS server block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// Snapshot of one service, everything rendering depends on
#[derive(Debug, Clone, Default)]
pub struct RenderInput {
    pub id: String,
    pub nodes: Vec<UpstreamNode>,
    pub bindings: BTreeMap<Protocol, BTreeSet<String>>,
    pub allow_crossdomain: bool,
    pub allocated_port: Option<u16>,
    /// Present once the certificate for the http2 domains is ready
    pub tls: Option<TlsFiles>,
}

impl RenderInput {
    fn domains(&self, protocol: Protocol) -> Option<&BTreeSet<String>> {
        self.bindings.get(&protocol)
    }

    /// Service ids are already valid nginx upstream names
    fn upstream_name(&self) -> &str {
        &self.id
    }
}

/// Rendered fragments of one service keyed by bucket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSet {
    fragments: BTreeMap<Bucket, String>,
}

impl ConfigSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, bucket: Bucket, content: String) {
        self.fragments.insert(bucket, content);
    }

    pub fn get(&self, bucket: Bucket) -> Option<&str> {
        self.fragments.get(&bucket).map(String::as_str)
    }

    pub fn contains(&self, bucket: Bucket) -> bool {
        self.fragments.contains_key(&bucket)
    }

    pub fn buckets(&self) -> impl Iterator<Item = Bucket> + '_ {
        self.fragments.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Bucket, &str)> {
        self.fragments.iter().map(|(b, c)| (*b, c.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

pub fn render(input: &RenderInput, ctx: &RenderContext) -> ConfigSet {
    let mut set = ConfigSet::new();

    let http = input.domains(Protocol::Http);
    let http2 = input.domains(Protocol::Http2);

    if http.is_some() || http2.is_some() {
        set.insert(Bucket::Upstream, render_upstream(input, ctx));
    }
    if let Some(domains) = http {
        set.insert(Bucket::Http, render_http(input, domains, ctx));
    }
    if let Some(domains) = http2 {
        let plain = http.cloned().unwrap_or_default();
        let content = match &input.tls {
            Some(tls) => render_http2(input, domains, &plain, tls, ctx),
            None => render_http2_stub(input, domains, &plain, ctx),
        };
        set.insert(Bucket::Http2, content);
    }

    if let Some(port) = input.allocated_port {
        if input.bindings.contains_key(&Protocol::Tcp) {
            set.insert(Bucket::Tcp, render_stream(input, Protocol::Tcp, port, ctx));
        }
        if input.bindings.contains_key(&Protocol::Udp) {
            set.insert(Bucket::Udp, render_stream(input, Protocol::Udp, port, ctx));
        }
    }

    set
}

/// Local 503 responder every upstream falls back to when it has no nodes
pub fn render_fallback(ctx: &RenderContext) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# catalog-proxy: fallback responder");
    let _ = writeln!(out, "server {{");
    let _ = writeln!(out, "    listen 127.0.0.1:{};", ctx.fallback_port);
    let _ = writeln!(out);
    let _ = writeln!(out, "    location / {{");
    let _ = writeln!(out, "        return 503;");
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");
    out
}

fn header(out: &mut String, input: &RenderInput, bucket: Bucket) {
    let _ = writeln!(out, "# catalog-proxy: {} ({})", input.id, bucket);
}

fn render_upstream(input: &RenderInput, ctx: &RenderContext) -> String {
    let mut out = String::new();
    header(&mut out, input, Bucket::Upstream);
    let _ = writeln!(out, "upstream {} {{", input.upstream_name());
    write_servers(&mut out, input, ctx);
    let _ = writeln!(out, "}}");
    out
}

fn write_servers(out: &mut String, input: &RenderInput, ctx: &RenderContext) {
    if input.nodes.is_empty() {
        let _ = writeln!(out, "    server 127.0.0.1:{};", ctx.fallback_port);
        return;
    }
    for node in &input.nodes {
        let _ = writeln!(out, "    server {}:{};", node.address, node.port);
    }
}

fn write_server_name(out: &mut String, domains: &BTreeSet<String>) {
    if domains.is_empty() {
        return;
    }
    let names: Vec<String> = domains
        .iter()
        .flat_map(|d| [d.clone(), format!("*.{}", d)])
        .collect();
    let _ = writeln!(out, "    server_name {};", names.join(" "));
}

fn write_challenge_location(out: &mut String, ctx: &RenderContext) {
    let _ = writeln!(out, "    location {} {{", CHALLENGE_PATH);
    let _ = writeln!(out, "        proxy_pass http://{};", ctx.challenge_upstream);
    let _ = writeln!(out, "        proxy_set_header Host $host;");
    let _ = writeln!(out, "    }}");
}

fn write_proxy_location(out: &mut String, input: &RenderInput) {
    let _ = writeln!(out, "    location / {{");
    let _ = writeln!(out, "        proxy_pass http://{};", input.upstream_name());
    let _ = writeln!(out, "        proxy_http_version 1.1;");
    let _ = writeln!(out, "        proxy_set_header Host $host;");
    let _ = writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;");
    let _ = writeln!(out, "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;");
    let _ = writeln!(out, "        proxy_set_header X-Forwarded-Proto $scheme;");
    let _ = writeln!(out, "        proxy_next_upstream error timeout http_502;");
    if input.allow_crossdomain {
        let _ = writeln!(out);
        let _ = writeln!(out, "        add_header Access-Control-Allow-Origin $http_origin always;");
        let _ = writeln!(out, "        add_header Access-Control-Allow-Credentials true always;");
        let _ = writeln!(
            out,
            "        add_header Access-Control-Allow-Methods \"GET, POST, PUT, PATCH, DELETE, OPTIONS\" always;"
        );
        let _ = writeln!(
            out,
            "        add_header Access-Control-Allow-Headers \"Authorization, Content-Type, Accept, Origin, X-Requested-With\" always;"
        );
        let _ = writeln!(out, "        if ($request_method = OPTIONS) {{");
        let _ = writeln!(out, "            return 204;");
        let _ = writeln!(out, "        }}");
    }
    let _ = writeln!(out, "    }}");
}

fn render_http(input: &RenderInput, domains: &BTreeSet<String>, ctx: &RenderContext) -> String {
    let mut out = String::new();
    header(&mut out, input, Bucket::Http);
    let _ = writeln!(out, "server {{");
    let _ = writeln!(out, "    listen {};", ctx.http_port);
    write_server_name(&mut out, domains);
    let _ = writeln!(out);
    write_challenge_location(&mut out, ctx);
    let _ = writeln!(out);
    write_proxy_location(&mut out, input);
    let _ = writeln!(out, "}}");
    out
}

/// Plaintext block for http2 domains not already served by the http bucket
fn write_plain_http2(
    out: &mut String,
    domains: &BTreeSet<String>,
    plain: &BTreeSet<String>,
    ctx: &RenderContext,
    fallthrough: &str,
) {
    let own: BTreeSet<String> = domains.difference(plain).cloned().collect();
    if own.is_empty() {
        return;
    }
    let _ = writeln!(out, "server {{");
    let _ = writeln!(out, "    listen {};", ctx.http_port);
    write_server_name(out, &own);
    let _ = writeln!(out);
    write_challenge_location(out, ctx);
    let _ = writeln!(out);
    let _ = writeln!(out, "    location / {{");
    let _ = writeln!(out, "        {}", fallthrough);
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");
}

/// Full TLS configuration, rendered once the certificate is ready
fn render_http2(
    input: &RenderInput,
    domains: &BTreeSet<String>,
    plain: &BTreeSet<String>,
    tls: &TlsFiles,
    ctx: &RenderContext,
) -> String {
    let mut out = String::new();
    header(&mut out, input, Bucket::Http2);
    write_plain_http2(
        &mut out,
        domains,
        plain,
        ctx,
        "return 301 https://$host$request_uri;",
    );
    let _ = writeln!(out, "server {{");
    let _ = writeln!(out, "    listen {} ssl http2;", ctx.https_port);
    write_server_name(&mut out, domains);
    let _ = writeln!(out);
    let _ = writeln!(out, "    ssl_certificate {};", tls.certificate.display());
    let _ = writeln!(out, "    ssl_certificate_key {};", tls.key.display());
    let _ = writeln!(out, "    ssl_protocols TLSv1.2 TLSv1.3;");
    let _ = writeln!(out);
    write_proxy_location(&mut out, input);
    let _ = writeln!(out, "}}");
    out
}

/// Plaintext-only stand-in that keeps HTTP-01 challenges reachable until
/// the certificate exists
fn render_http2_stub(
    input: &RenderInput,
    domains: &BTreeSet<String>,
    plain: &BTreeSet<String>,
    ctx: &RenderContext,
) -> String {
    let mut out = String::new();
    header(&mut out, input, Bucket::Http2);
    let _ = writeln!(out, "# certificate pending");
    write_plain_http2(&mut out, domains, plain, ctx, "return 503;");
    out
}

fn render_stream(input: &RenderInput, protocol: Protocol, port: u16, ctx: &RenderContext) -> String {
    let bucket = if protocol == Protocol::Udp {
        Bucket::Udp
    } else {
        Bucket::Tcp
    };
    let upstream = format!("{}_{}", input.upstream_name(), bucket.as_str());

    let mut out = String::new();
    header(&mut out, input, bucket);
    let _ = writeln!(out, "upstream {} {{", upstream);
    write_servers(&mut out, input, ctx);
    let _ = writeln!(out, "}}");
    let _ = writeln!(out);
    let _ = writeln!(out, "server {{");
    if protocol == Protocol::Udp {
        let _ = writeln!(out, "    listen {} udp;", port);
    } else {
        let _ = writeln!(out, "    listen {};", port);
    }
    let _ = writeln!(out, "    proxy_pass {};", upstream);
    let _ = writeln!(out, "}}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domains(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|d| d.to_string()).collect()
    }

    fn input(bindings: &[(Protocol, &[&str])]) -> RenderInput {
        RenderInput {
            id: "test-service".to_string(),
            bindings: bindings
                .iter()
                .map(|(p, d)| (*p, domains(d)))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_nodes_renders_fallback_server() {
        let set = render(&input(&[(Protocol::Http, &[])]), &RenderContext::default());
        let upstream = set.get(Bucket::Upstream).unwrap();
        assert!(upstream.contains("upstream test-service {"));
        assert!(upstream.contains("server 127.0.0.1:6666;"));
        assert!(!set.get(Bucket::Http).unwrap().contains("server_name"));
    }

    #[test]
    fn test_nodes_replace_fallback_server() {
        let mut input = input(&[(Protocol::Http, &["example.com"])]);
        input.nodes = vec![UpstreamNode {
            address: "127.0.0.1".into(),
            port: 10000,
        }];
        let set = render(&input, &RenderContext::default());

        let upstream = set.get(Bucket::Upstream).unwrap();
        assert!(upstream.contains("server 127.0.0.1:10000;"));
        assert!(!upstream.contains(":6666"));
        assert!(set
            .get(Bucket::Http)
            .unwrap()
            .contains("server_name example.com *.example.com;"));
    }

    #[test]
    fn test_challenge_location_is_proxied() {
        let set = render(&input(&[(Protocol::Http, &["a.com"])]), &RenderContext::default());
        let http = set.get(Bucket::Http).unwrap();
        assert!(http.contains("location /.well-known/acme-challenge/ {"));
        assert!(http.contains("proxy_pass http://127.0.0.1:8888;"));
    }

    #[test]
    fn test_crossdomain_adds_cors_headers() {
        let mut input = input(&[(Protocol::Http, &["a.com"])]);
        let plain = render(&input, &RenderContext::default());
        assert!(!plain.get(Bucket::Http).unwrap().contains("Access-Control"));

        input.allow_crossdomain = true;
        let cors = render(&input, &RenderContext::default());
        assert!(cors
            .get(Bucket::Http)
            .unwrap()
            .contains("Access-Control-Allow-Origin $http_origin"));
    }

    #[test]
    fn test_http2_stub_until_tls_is_ready() {
        let mut input = input(&[(Protocol::Http2, &["secure.com"])]);
        let stub = render(&input, &RenderContext::default());
        let content = stub.get(Bucket::Http2).unwrap();
        assert!(content.contains("certificate pending"));
        assert!(content.contains("location /.well-known/acme-challenge/"));
        assert!(!content.contains("ssl_certificate"));

        input.tls = Some(TlsFiles {
            certificate: PathBuf::from("/etc/nginx/certs/test-service.pem"),
            key: PathBuf::from("/etc/nginx/certs/test-service.key"),
        });
        let full = render(&input, &RenderContext::default());
        let content = full.get(Bucket::Http2).unwrap();
        assert!(content.contains("listen 443 ssl http2;"));
        assert!(content.contains("ssl_certificate /etc/nginx/certs/test-service.pem;"));
        assert!(content.contains("ssl_certificate_key /etc/nginx/certs/test-service.key;"));
        assert!(content.contains("return 301 https://$host$request_uri;"));
    }

    #[test]
    fn test_http2_skips_plain_block_for_http_domains() {
        let input = input(&[(Protocol::Http, &["a.com"]), (Protocol::Http2, &["a.com"])]);
        let set = render(&input, &RenderContext::default());
        let http2 = set.get(Bucket::Http2).unwrap();
        assert!(!http2.contains("listen 80;"));
        assert!(!http2.contains("server_name"));
    }

    #[test]
    fn test_stream_fragments_need_a_port() {
        let mut input = input(&[(Protocol::Tcp, &["5432"]), (Protocol::Udp, &["5432"])]);
        let without = render(&input, &RenderContext::default());
        assert!(without.is_empty());

        input.allocated_port = Some(7001);
        let with = render(&input, &RenderContext::default());
        assert!(with.get(Bucket::Tcp).unwrap().contains("listen 7001;"));
        assert!(with.get(Bucket::Udp).unwrap().contains("listen 7001 udp;"));
        assert!(!with.contains(Bucket::Upstream));
    }

    #[test]
    fn test_upstream_names_follow_the_id() {
        let mut hyphen = input(&[(Protocol::Http, &[]), (Protocol::Tcp, &[])]);
        hyphen.id = "my-svc".to_string();
        hyphen.allocated_port = Some(7000);
        let mut underscore = hyphen.clone();
        underscore.id = "my_svc".to_string();
        underscore.allocated_port = Some(7001);

        let ctx = RenderContext::default();
        let hyphen = render(&hyphen, &ctx);
        let underscore = render(&underscore, &ctx);

        assert!(hyphen.get(Bucket::Upstream).unwrap().contains("upstream my-svc {"));
        assert!(hyphen.get(Bucket::Http).unwrap().contains("proxy_pass http://my-svc;"));
        assert!(underscore.get(Bucket::Upstream).unwrap().contains("upstream my_svc {"));
        assert!(hyphen.get(Bucket::Tcp).unwrap().contains("upstream my-svc_tcp {"));
        assert!(underscore.get(Bucket::Tcp).unwrap().contains("upstream my_svc_tcp {"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let mut input = input(&[
            (Protocol::Http, &["b.com", "a.com"]),
            (Protocol::Http2, &["c.com"]),
        ]);
        input.nodes = vec![
            UpstreamNode {
                address: "10.0.0.1".into(),
                port: 80,
            },
            UpstreamNode {
                address: "10.0.0.2".into(),
                port: 80,
            },
        ];
        let ctx = RenderContext::default();
        assert_eq!(render(&input, &ctx), render(&input.clone(), &ctx));
    }

    #[test]
    fn test_bucket_paths() {
        assert_eq!(
            Bucket::Http2.relative_path("web"),
            PathBuf::from("http/web.http2.conf")
        );
        assert_eq!(Bucket::Udp.relative_path("dns"), PathBuf::from("stream/dns.udp.conf"));
    }

    #[test]
    fn test_fallback_listens_locally() {
        let content = render_fallback(&RenderContext::default());
        assert!(content.contains("listen 127.0.0.1:6666;"));
        assert!(content.contains("return 503;"));
    }
}
