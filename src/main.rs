use mirrorgate::config::Config;
use mirrorgate::docker::DockerRuntime;
use mirrorgate::proxy::{ProxyContext, ProxyServer};
use mirrorgate::resolver::{Resolver, ResolverSettings};
use std::fs::{File, OpenOptions};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("mirrorgate.toml"));

    let config = Config::load(&config_path)?;

    init_logging(&config)?;

    if config_path.exists() {
        info!(path = %config_path.display(), "Configuration loaded");
    } else {
        info!(path = %config_path.display(), "No configuration file, using defaults and environment");
    }

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let lookup = &config.primary.docker_lookup;
    let (resolver_cache, listener_handle) = if lookup.enabled {
        let runtime = DockerRuntime::connect(lookup.docker_host.as_deref()).await.map_err(|e| {
            error!(error = %e, "Docker lookup is enabled but the daemon is unavailable");
            e
        })?;

        let (resolver, handle) = Resolver::start(
            Arc::new(runtime),
            ResolverSettings::from(lookup),
            shutdown_rx.clone(),
        )
        .await;

        (Some(resolver.cache()), Some(handle))
    } else {
        (None, None)
    };

    let bind_addr: SocketAddr = config
        .server
        .listen_addr()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address '{}': {}", config.server.listen_addr(), e))?;

    let ctx = ProxyContext::from_config(&config, resolver_cache)?;
    let proxy_server = ProxyServer::new(bind_addr, ctx, shutdown_rx.clone());

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
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

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for the server and listener to stop (with timeout)
    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        if let Some(handle) = listener_handle {
            let _ = handle.await;
        }
    })
    .await;

    if stopped.is_err() {
        warn!("Timed out waiting for tasks to stop");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Log to stderr, or to `server.log_file` when set
fn init_logging(config: &Config) -> anyhow::Result<()> {
    let directive = format!("{}={}", PKG_NAME, config.server.log_level.to_lowercase());
    let filter = EnvFilter::from_default_env().add_directive(
        directive
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid log directive '{}': {}", directive, e))?,
    );

    match open_log_file(config.server.log_file.as_deref()) {
        Some(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    Ok(())
}

/// Open the configured log file for appending. `None` means log to stderr,
/// either because no file is configured or because it cannot be opened.
fn open_log_file(path: Option<&str>) -> Option<File> {
    let path = path?;
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("Failed to open log file '{}': {}. Logging to stderr instead.", path, e);
            None
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting mirroring proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        log_level = %config.server.log_level,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        primary = %config.primary.url,
        primary_headers = config.primary.headers.len(),
        mirror = config.mirror.url.as_deref().unwrap_or("disabled"),
        mirror_headers = config.mirror.headers.len(),
        do_mirror_body = config.primary.do_mirror_body,
        do_mirror_headers = config.primary.do_mirror_headers,
        "Traffic settings"
    );

    let lookup = &config.primary.docker_lookup;
    if lookup.enabled {
        info!(
            host_identifier = %lookup.host_identifier,
            settle_delay_ms = lookup.settle_delay_ms,
            debounce_ms = lookup.debounce_ms,
            stale_entries = ?lookup.stale_entries,
            "Docker host lookup enabled"
        );
    }
}
