use catalog_proxy::admin::{PKG_NAME, VERSION};
use catalog_proxy::config::Config;
use catalog_proxy::consul::ConsulRegistry;
use catalog_proxy::controller::Controller;
use catalog_proxy::memory::MemoryRegistry;
use catalog_proxy::proxy::{Nginx, ProxyControl};
use catalog_proxy::registry::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("catalog_proxy=debug".parse().expect("valid log directive")),
        )
        .init();

    let mut config_path: Option<PathBuf> = None;
    let mut dev = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--dev" => dev = true,
            "-h" | "--help" => {
                println!("Usage: {} [config.toml] [--dev]", PKG_NAME);
                return Ok(());
            }
            path => config_path = Some(PathBuf::from(path)),
        }
    }

    let config = Config::load(config_path.as_ref()).map_err(|e| {
        error!(path = ?config_path, error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = ?config_path, "Configuration loaded");

    print_startup_banner(&config, dev);

    let registry: Arc<dyn Registry> = if dev {
        warn!("Development mode: using the in-memory registry, nothing is shared");
        Arc::new(MemoryRegistry::new())
    } else {
        Arc::new(ConsulRegistry::new(&config.registry.address)?)
    };
    let issuer = Controller::build_issuer(&config, &registry);
    let proxy: Arc<dyn ProxyControl> = Arc::new(Nginx::new(&config.proxy.binary));

    let controller = Controller::new(config, registry, issuer, proxy);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut controller_handle = tokio::spawn(controller.run(shutdown_rx));

    tokio::select! {
        result = shutdown_signal() => {
            result?;
            let _ = shutdown_tx.send(true);

            match tokio::time::timeout(Duration::from_secs(10), &mut controller_handle).await {
                Ok(Ok(Err(e))) => error!(error = %e, "Controller error during shutdown"),
                Ok(Err(e)) => error!(error = %e, "Controller task failed"),
                Err(_) => warn!("Controller did not stop within 10s"),
                Ok(Ok(Ok(()))) => {}
            }
        }
        result = &mut controller_handle => {
            // The controller only returns on its own when startup failed
            result??;
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config, dev: bool) {
    info!(name = PKG_NAME, version = VERSION, dev, "Starting catalog proxy controller");
    info!(
        address = %config.registry.address,
        namespace = %config.registry.namespace,
        wait_secs = config.registry.wait_secs,
        "Registry settings"
    );
    info!(
        config_dir = %config.proxy.config_dir.display(),
        binary = %config.proxy.binary.display(),
        http_port = config.proxy.http_port,
        https_port = config.proxy.https_port,
        fallback_port = config.proxy.fallback_port,
        reload_debounce_ms = config.proxy.reload_debounce_ms,
        "Proxy settings"
    );
    info!(
        ports = %format!("{}-{}", config.ports.min, config.ports.max),
        session_ttl_secs = config.session.ttl_secs,
        issuer_workers = config.issuer.workers,
        acme = config.acme.enabled,
        "Controller settings"
    );
    info!(bind = %config.admin.bind, port = config.admin.port, "Admin API settings");
}
