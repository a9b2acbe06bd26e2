//! relay-fleet controller daemon
//!
//! fleetd runs on the relay host and keeps a fleet of identical relay
//! worker containers converged to the desired replica count, fronted by
//! an nginx L4 load balancer.
//!
//! ## Architecture
//!
//! - **Scaling Coordinator**: Applies desired-count changes under one lock
//! - **Replica Manager**: Owns per-replica lifecycle and runtime status
//! - **Health Monitor**: Probes replicas and restarts within a ceiling
//! - **Watchdog**: Recovers a dead balancer with the last good config
//! - **HTTP API**: Operator endpoints under /v1/fleet

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_controller::api::{self, AppState};
use fleet_controller::balancer::NginxProcess;
use fleet_controller::docker::DockerRuntime;
use fleet_controller::health::HealthMonitor;
use fleet_controller::store::Store;
use fleet_controller::watchdog::Watchdog;
use fleet_controller::{Config, Controller};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting relay-fleet controller");

    let config = Config::from_env()?;
    info!(
        data_dir = %config.data_dir.display(),
        worker_image = %config.worker_image,
        port_base = config.port_base,
        max_replicas = config.max_replicas,
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let store = Arc::new(
        Store::open(config.data_dir.join("fleet.db")).context("opening fleet database")?,
    );

    let runtime = Arc::new(DockerRuntime::new(&config));
    let balancer_process = Arc::new(NginxProcess::new(config.op_timeout));

    let controller = Arc::new(Controller::new(config.clone(), runtime, balancer_process, store));
    controller.recover().await.context("recovering persisted fleet state")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = Arc::new(HealthMonitor::new(Arc::clone(&controller)));
    let monitor_handle = tokio::spawn({
        let monitor = Arc::clone(&monitor);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            monitor.run(shutdown_rx).await;
        }
    });

    let watchdog = Arc::new(Watchdog::new(Arc::clone(&controller)));
    let watchdog_handle = tokio::spawn({
        let watchdog = Arc::clone(&watchdog);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            watchdog.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(AppState {
        controller: Arc::clone(&controller),
        monitor,
        watchdog,
    });
    let listener = tokio::net::TcpListener::bind(config.api_listen_addr)
        .await
        .with_context(|| format!("binding API listener on {}", config.api_listen_addr))?;
    info!(addr = %config.api_listen_addr, "API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server error");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = server_handle => {
            error!("API server exited unexpectedly");
        }
    }

    let _ = shutdown_tx.send(true);
    info!("Waiting for workers to shut down...");
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        futures_util::future::join_all(vec![monitor_handle, watchdog_handle]),
    )
    .await;

    info!("Controller shutdown complete");
    Ok(())
}
