use routegate::config::{self, Config};
use routegate::pool::{ConnectionPool, PoolConfig};
use routegate::process::Supervisor;
use routegate::proxy::ProxyServer;
use routegate::readiness;
use routegate::router::RouteTable;
use routegate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How long the readiness gate waits for all backends
const READINESS_TIMEOUT: Duration = Duration::from_secs(30);
/// Interval between readiness probe rounds
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Directory for materialized backend log-config files
const LOG_CONFIG_DIR: &str = "logs";

fn main() -> anyhow::Result<()> {
    // Configuration is loaded before the runtime exists so the worker
    // count can size the runtime itself
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));

    let config = Config::load(&config_path)?;

    // RUST_LOG wins; the config's log_level is the fallback
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "{}={}",
                    PKG_NAME, config.main.log_level
                ))
            }),
        )
        .init();

    info!(path = %config_path.display(), "Configuration loaded");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.main.workers)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(mut config: Config) -> anyhow::Result<()> {
    print_startup_banner(&config);

    if config.main.reload {
        warn!("Hot reload is configured but not supported; continuing without it");
    }

    // Ask each backend for the prefix it wants to own, then make sure the
    // resulting table is routable
    config::resolve_prefixes(&mut config.routers).await;
    config::validate_prefixes(&config.routers)?;

    let table = Arc::new(RouteTable::new(&config.routers));
    let supervisor = Supervisor::new(
        config.routers.clone(),
        LOG_CONFIG_DIR,
        &config.main.log_level,
    );

    if let Err(e) = supervisor.start_all().await {
        error!(error = %e, "Failed to launch backends");
        supervisor.stop_all().await;
        return Err(e);
    }

    let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));

    // No traffic is accepted until every backend answers its health check
    if let Err(e) = readiness::wait_until_healthy(
        &pool,
        &config.routers,
        READINESS_TIMEOUT,
        READINESS_POLL_INTERVAL,
    )
    .await
    {
        error!(error = %e, "Readiness gate failed, shutting down");
        supervisor.stop_all().await;
        return Err(e.into());
    }

    info!(
        backends = supervisor.running_count(),
        "All backends healthy, starting gateway"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bind_addr: SocketAddr = format!("{}:{}", config.main.host, config.main.port).parse()?;
    let config = Arc::new(config);
    let server = ProxyServer::new(bind_addr, Arc::clone(&config), table, pool, shutdown_rx);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

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
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Stop accepting traffic, then stop the backends
    let _ = shutdown_tx.send(true);

    info!("Stopping all backends...");
    supervisor.stop_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        host = %config.main.host,
        port = config.main.port,
        workers = config.main.workers,
        log_level = %config.main.log_level,
        "Gateway configuration"
    );
    for router in &config.routers {
        info!(
            name = %router.name,
            authority = %router.authority(),
            prefix = router.prefix.as_deref(),
            "Configured backend"
        );
    }
}
