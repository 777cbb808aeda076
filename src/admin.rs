use crate::issuer::IssuerPool;
use crate::ports::PortAllocator;
use crate::registry::{KeySpace, Registry};
use crate::reload::ReloadCoordinator;
use crate::render::CHALLENGE_PATH;
use crate::service::StatusBoard;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the controller
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Everything the admin handlers read from
pub struct AdminState {
    pub registry: Arc<dyn Registry>,
    pub keys: KeySpace,
    pub board: Arc<StatusBoard>,
    pub reloader: Arc<ReloadCoordinator>,
    pub issuers: Arc<IssuerPool>,
    pub ports: Arc<PortAllocator>,
    pub secret: String,
}

/// Admin API server. Answers ACME HTTP-01 challenges forwarded by the
/// proxy and exposes controller status behind the shared secret.
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<AdminState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, state: Arc<AdminState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, secret: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(secret)
        })
        .unwrap_or(false)
}

fn valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

async fn challenge_response(state: &AdminState, token: &str) -> Response<Full<Bytes>> {
    if !valid_token(token) {
        return response(StatusCode::NOT_FOUND, "not found");
    }
    match state.registry.kv_get(&state.keys.acme_challenge(token), false).await {
        Ok(pairs) => match pairs.into_iter().next() {
            Some(pair) => {
                debug!(token, "Serving ACME challenge");
                response(StatusCode::OK, pair.value)
            }
            None => response(StatusCode::NOT_FOUND, "not found"),
        },
        Err(e) => {
            error!(token, error = %e, "Failed to read ACME challenge");
            response(StatusCode::SERVICE_UNAVAILABLE, "registry unavailable")
        }
    }
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    let response = match (method, path) {
        // ACME HTTP-01 challenge forwarded by the proxy (no auth required)
        (&Method::GET, path) if path.starts_with(CHALLENGE_PATH) => {
            let token = path.strip_prefix(CHALLENGE_PATH).unwrap_or("");
            challenge_response(&state, token).await
        }

        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // Published services and their status: GET /services (auth required)
        (&Method::GET, "/services") => {
            if !check_auth(&req, &state.secret) {
                warn!(path, "Unauthorized admin API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let mut services: Vec<_> = state.board.iter().map(|e| e.value().clone()).collect();
                services.sort_by(|a, b| a.name.cmp(&b.name));
                let response_body = serde_json::json!({
                    "count": services.len(),
                    "services": services,
                });
                json_response(StatusCode::OK, response_body.to_string())
            }
        }

        // Reload, issuance and port counters: GET /stats (auth required)
        (&Method::GET, "/stats") => {
            if !check_auth(&req, &state.secret) {
                warn!(path, "Unauthorized admin API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let reloads = state.reloader.stats();
                let issues = state.issuers.stats();
                let response_body = serde_json::json!({
                    "reloads": {
                        "requested": reloads.get_requested(),
                        "executed": reloads.get_executed(),
                        "failed": reloads.get_failed(),
                        "pending": state.reloader.is_pending(),
                    },
                    "certificates": {
                        "issuer": state.issuers.issuer_name(),
                        "requested": issues.get_requested(),
                        "issued": issues.get_issued(),
                        "failed": issues.get_failed(),
                        "in_flight": state.issuers.in_flight(),
                    },
                    "ports": state.ports.allocated(),
                });
                json_response(StatusCode::OK, response_body.to_string())
            }
        }

        // Force a proxy reload: POST /reload (auth required)
        (&Method::POST, "/reload") => {
            if !check_auth(&req, &state.secret) {
                warn!(path, "Unauthorized admin API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                info!("Reload requested via admin API");
                state.reloader.queue_reload();
                response(StatusCode::ACCEPTED, "queued")
            }
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use crate::error::ProxyError;
    use crate::issuer::SelfSignedIssuer;
    use crate::memory::MemoryRegistry;
    use crate::proxy::ProxyControl;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;

    struct NoopProxy;

    #[async_trait]
    impl ProxyControl for NoopProxy {
        async fn check_config(&self, _main_config: &Path) -> Result<(), ProxyError> {
            Ok(())
        }

        async fn reload(&self) -> Result<(), ProxyError> {
            Ok(())
        }
    }

    async fn start(registry: Arc<MemoryRegistry>) -> (String, watch::Sender<bool>) {
        let registry: Arc<dyn Registry> = registry;
        let keys = KeySpace::new("test");
        let state = Arc::new(AdminState {
            registry: Arc::clone(&registry),
            keys: keys.clone(),
            board: Arc::new(StatusBoard::new()),
            reloader: ReloadCoordinator::new(Arc::new(NoopProxy), Duration::ZERO),
            issuers: Arc::new(IssuerPool::new(Arc::new(SelfSignedIssuer::default()), 1)),
            ports: Arc::new(PortAllocator::new(registry, keys, PortRange::new(7000, 7010))),
            secret: "s3cret".to_string(),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = watch::channel(false);
        tokio::spawn(AdminServer::new(listener.local_addr().unwrap(), state, rx).serve(listener));
        (base, tx)
    }

    #[tokio::test]
    async fn test_challenge_served_from_registry() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.kv_put("test/acme/challenge/tok-1", b"tok-1.thumb").await.unwrap();
        let (base, _tx) = start(Arc::clone(&registry)).await;

        let found = reqwest::get(format!("{}/.well-known/acme-challenge/tok-1", base)).await.unwrap();
        assert_eq!(found.status(), 200);
        assert_eq!(found.text().await.unwrap(), "tok-1.thumb");

        let missing = reqwest::get(format!("{}/.well-known/acme-challenge/other", base)).await.unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn test_status_requires_secret() {
        let (base, _tx) = start(Arc::new(MemoryRegistry::new())).await;
        let client = reqwest::Client::new();

        let denied = client.get(format!("{}/services", base)).send().await.unwrap();
        assert_eq!(denied.status(), 401);

        let wrong = client
            .get(format!("{}/stats", base))
            .bearer_auth("nope")
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), 401);

        let allowed = client
            .get(format!("{}/services", base))
            .bearer_auth("s3cret")
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status(), 200);
        let body: serde_json::Value = allowed.json().await.unwrap();
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn test_open_endpoints() {
        let (base, _tx) = start(Arc::new(MemoryRegistry::new())).await;

        let health = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(health.text().await.unwrap(), "ok");

        let version: serde_json::Value = reqwest::get(format!("{}/version", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(version["name"], PKG_NAME);
    }

    #[test]
    fn test_token_charset() {
        assert!(valid_token("abc-DEF_123"));
        assert!(!valid_token(""));
        assert!(!valid_token("../etc"));
    }
}
