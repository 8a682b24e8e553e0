use frontdoor::config::Config;
use frontdoor::monitor::HealthMonitor;
use frontdoor::proxy::{FrontDoor, ProxyServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("frontdoor=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("frontdoor.toml"));

    // Refuse to start on any configuration error, including an empty pool
    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    let front_door = Arc::new(FrontDoor::from_config(&config)?);

    print_startup_banner(&config, &front_door);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let monitor_handle = if config.monitor.enabled {
        let monitor = HealthMonitor::new(
            front_door.backends().clone(),
            front_door.lifecycle(),
            config.monitor.clone(),
            shutdown_rx.clone(),
        );
        Some(tokio::spawn(monitor.run()))
    } else {
        None
    };

    let server = ProxyServer::new(bind_addr, Arc::clone(&front_door), shutdown_rx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Front door server error");
        }
    });

    wait_for_signal().await;

    let _ = shutdown_tx.send(true);

    // Wait for the accept loop and monitor to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        if let Some(handle) = monitor_handle {
            let _ = handle.await;
        }
    })
    .await;

    let stats = front_door.stats();
    info!(
        liveness_hits = stats.liveness_hits(),
        forwarded = ?stats.forwarded(),
        failures = stats.failures(),
        backend_requests = front_door.client().stats().get_total_requests(),
        health_checks = front_door.client().stats().get_health_checks(),
        "Shutdown complete"
    );
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

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
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config, front_door: &FrontDoor) {
    info!(name = PKG_NAME, version = VERSION, "Starting front door");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        liveness_path = %front_door.liveness_path(),
        request_timeout_secs = ?config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        backend_count = front_door.backends().len(),
        backends = ?front_door.backends().iter().map(|b| b.authority().to_string()).collect::<Vec<_>>(),
        strategy = front_door.strategy_name(),
        "Backend pool"
    );
    info!(
        enabled = config.monitor.enabled,
        interval_ms = config.monitor.interval_ms,
        ping_path = %config.monitor.ping_path,
        failure_threshold = config.monitor.failure_threshold,
        "Health monitor settings"
    );
}
