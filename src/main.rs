use fleetgate::backend::BackendProbe;
use fleetgate::config::Config;
use fleetgate::healthcheck::FleetHealthLoop;
use fleetgate::inventory::{self, InventoryClient};
use fleetgate::loadbalancer::LoadBalancerSupervisor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration first: it decides the log level
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match &config_path {
        Some(path) => {
            let mut config = Config::load(path)?;
            config.apply_env(|key| std::env::var(key).ok());
            config
        }
        None => Config::from_env(),
    };

    // Initialize logging
    let directive = if config.debug {
        "fleetgate=debug"
    } else {
        "fleetgate=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive)),
        )
        .init();

    if let Some(path) = &config_path {
        info!(path = %path.display(), "Configuration loaded");
    }
    config.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    // Fetch the fleet
    let proxies_url = config.inventory.proxies_url.clone().unwrap_or_default();
    let client = InventoryClient::new(&proxies_url, config.inventory.request_timeout())?;
    let descriptors = client.fetch().await.map_err(|e| {
        error!(url = %proxies_url, error = %e, "Failed to fetch backend inventory");
        e
    })?;
    let records = inventory::into_records(
        descriptors,
        config.inventory.username.as_deref(),
        config.inventory.password.as_deref(),
    )?;
    if records.is_empty() {
        warn!(url = %proxies_url, "Inventory returned no backends");
    }

    let mut probes = Vec::with_capacity(records.len());
    for record in records.iter().cloned() {
        let probe = BackendProbe::new(record, &config.probe.test_url, config.probe.timeout())?
            .with_restart_grace(config.monitor.restart_grace());
        probes.push(probe);
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = Arc::new(LoadBalancerSupervisor::from_config(&config.balancer));
    let mut health_loop = FleetHealthLoop::new(Arc::clone(&supervisor), &config.monitor, shutdown_rx);
    health_loop.bootstrap(probes).await?;
    info!(
        port = config.balancer.port,
        config = %supervisor.config_path().display(),
        "Load balancer started"
    );

    let health_handle = tokio::spawn(health_loop.run());

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or soft reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading load balancer...");
                    if let Err(e) = supervisor.reload().await {
                        error!(error = %e, "Failed to reload load balancer");
                    }
                }
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

    // A restart in flight may still be sleeping out its grace period
    if tokio::time::timeout(Duration::from_secs(15), health_handle)
        .await
        .is_err()
    {
        warn!("Health loop did not stop in time");
    }

    if config.balancer.stop_on_exit {
        info!("Stopping load balancer...");
        supervisor.stop().await;
    } else {
        info!("Leaving load balancer running");
    }

    info!("Shutdown complete");
    Ok(())
}
