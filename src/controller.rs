//! Application wiring
//!
//! [`Controller`] owns the shared components and runs the long-lived loops:
//! lock session, reload coordinator, admin server and catalog watcher. Every
//! loop listens on the same shutdown channel.

use crate::acme::AcmeIssuer;
use crate::admin::{AdminServer, AdminState};
use crate::certificate::CertificateContext;
use crate::config::{AdminConfig, Config};
use crate::deploy::ConfigDeployer;
use crate::issuer::{CertificateIssuer, IssuerPool, SelfSignedIssuer};
use crate::ports::PortAllocator;
use crate::proxy::ProxyControl;
use crate::registry::{KeySpace, Registry};
use crate::reload::ReloadCoordinator;
use crate::render::RenderContext;
use crate::service::{ServiceContext, StatusBoard};
use crate::session::LockSession;
use crate::watcher::ServiceWatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

pub struct Controller {
    config: Config,
    locks: Arc<LockSession>,
    reloader: Arc<ReloadCoordinator>,
    services: Arc<ServiceContext>,
    admin: Arc<AdminState>,
}

impl Controller {
    pub fn new(
        config: Config,
        registry: Arc<dyn Registry>,
        issuer: Arc<dyn CertificateIssuer>,
        proxy: Arc<dyn ProxyControl>,
    ) -> Self {
        let keys = KeySpace::new(&config.registry.namespace);
        let session_name = format!("{}-{}", keys.namespace(), uuid::Uuid::new_v4());
        let locks = LockSession::new(
            Arc::clone(&registry),
            &session_name,
            config.session.ttl(),
            config.session.renew_interval(),
        );

        let issuers = Arc::new(IssuerPool::new(issuer, config.issuer.workers));
        let ports = Arc::new(PortAllocator::new(
            Arc::clone(&registry),
            keys.clone(),
            config.ports,
        ));
        let reloader = ReloadCoordinator::new(Arc::clone(&proxy), config.proxy.reload_debounce());
        let deployer = Arc::new(
            ConfigDeployer::new(&config.proxy.config_dir, proxy).with_scratch_dir(&config.data_dir),
        );
        let certificates = Arc::new(CertificateContext {
            registry: Arc::clone(&registry),
            keys: keys.clone(),
            locks: Arc::clone(&locks),
            issuers: Arc::clone(&issuers),
            certs_dir: config.proxy.certs_dir(),
            wait: config.registry.wait(),
            error_backoff: config.registry.error_backoff(),
        });
        let render = RenderContext {
            http_port: config.proxy.http_port,
            https_port: config.proxy.https_port,
            fallback_port: config.proxy.fallback_port,
            challenge_upstream: challenge_upstream(&config.admin),
        };
        let board = Arc::new(StatusBoard::new());

        let services = Arc::new(ServiceContext {
            registry: Arc::clone(&registry),
            ports: Arc::clone(&ports),
            certificates,
            deployer,
            reloader: Arc::clone(&reloader),
            render,
            board: Arc::clone(&board),
            wait: config.registry.wait(),
            error_backoff: config.registry.error_backoff(),
        });
        let admin = Arc::new(AdminState {
            registry,
            keys,
            board,
            reloader: Arc::clone(&reloader),
            issuers,
            ports,
            secret: config.secret().to_string(),
        });

        Self {
            config,
            locks,
            reloader,
            services,
            admin,
        }
    }

    /// ACME when enabled, self-signed otherwise
    pub fn build_issuer(config: &Config, registry: &Arc<dyn Registry>) -> Arc<dyn CertificateIssuer> {
        if config.acme.enabled {
            info!(
                directory = %config.acme.directory_url,
                email = %config.acme.email,
                "ACME certificate issuance enabled"
            );
            Arc::new(AcmeIssuer::new(
                Arc::clone(registry),
                KeySpace::new(&config.registry.namespace),
                &config.acme.directory_url,
                &config.acme.email,
            ))
        } else {
            info!(validity_days = config.acme.self_signed_days, "Self-signed certificate issuance");
            Arc::new(SelfSignedIssuer::new(config.acme.self_signed_days))
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn service_context(&self) -> Arc<ServiceContext> {
        Arc::clone(&self.services)
    }

    pub fn locks(&self) -> &Arc<LockSession> {
        &self.locks
    }

    pub fn reloader(&self) -> &Arc<ReloadCoordinator> {
        &self.reloader
    }

    pub fn admin_state(&self) -> Arc<AdminState> {
        Arc::clone(&self.admin)
    }

    /// Run until `shutdown_rx` flips to true. Service tasks are stopped on
    /// the way out but their configuration stays deployed.
    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        if self.services.deployer.prepare(&self.services.render).await? {
            self.reloader.queue_reload();
        }
        let admin_addr = self.config.admin.socket_addr()?;

        let session_handle = tokio::spawn(Arc::clone(&self.locks).run(shutdown_rx.clone()));
        let reload_handle = tokio::spawn(Arc::clone(&self.reloader).run(shutdown_rx.clone()));

        let admin_server = AdminServer::new(admin_addr, Arc::clone(&self.admin), shutdown_rx.clone());
        let admin_handle = tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        });

        ServiceWatcher::new(Arc::clone(&self.services))
            .run(shutdown_rx)
            .await;

        // Wait for the remaining loops to stop (with timeout)
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            let _ = reload_handle.await;
            let _ = session_handle.await;
            let _ = admin_handle.await;
        })
        .await;

        info!("Controller stopped");
        Ok(())
    }
}

/// Address the proxy forwards ACME challenges to
fn challenge_upstream(admin: &AdminConfig) -> String {
    let host = match admin.bind.as_str() {
        "0.0.0.0" | "::" | "[::]" => "127.0.0.1",
        other => other,
    };
    format!("{}:{}", host, admin.port)
}
