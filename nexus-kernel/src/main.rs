/**
 * NEXUS KERNEL - Entry point of the Proxmox monitoring kernel
 *
 * ROLE : Build every component once (hypervisor client, registry, exporter,
 * Prometheus/Grafana managers, coordinator) and inject them into the HTTP state.
 *
 * STARTUP : config + logging, management API bound, monitoring stack started
 * in the background. Ctrl-C stops the stack before exit.
 */

mod config;
mod coordinator;
mod exporter;
mod health;
mod http;
mod hypervisor;
mod lifecycle;
mod metrics;
mod models;
mod normalizer;
mod provision;
mod state;

use crate::config::load_config;
use crate::coordinator::MonitoringCoordinator;
use crate::exporter::PollingExporter;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::hypervisor::{Hypervisor, ProxmoxClient};
use crate::lifecycle::{HealthProbe, HttpProbe, ManagedService, ProcessManager, ServiceSpec};
use crate::metrics::MetricsRegistry;
use crate::provision::GrafanaProvisioner;
use crate::state::{new_state, TickStats};

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nexus_kernel=info")),
        )
        .init();

    let cfg = load_config().await;

    // hypervisor + metrics
    let hypervisor: Arc<dyn Hypervisor> =
        Arc::new(ProxmoxClient::from_config(&cfg.proxmox).context("building Proxmox client")?);
    let registry = Arc::new(MetricsRegistry::new());
    let stats = new_state(TickStats::default());

    let exporter = Arc::new(PollingExporter::new(
        hypervisor.clone(),
        registry.clone(),
        stats.clone(),
        Duration::from_secs(cfg.exporter.poll_interval_secs.max(1)),
        SocketAddr::from(([0, 0, 0, 0], cfg.exporter.listen_port)),
    ));

    // managed services
    let probe: Arc<dyn HealthProbe> = Arc::new(HttpProbe::default());
    let prometheus_spec = ServiceSpec::prometheus(&cfg.prometheus, cfg.exporter.listen_port);
    let provisioner = GrafanaProvisioner::from_config(&cfg.grafana, &prometheus_spec.base_url);
    let collector: Arc<dyn ManagedService> = Arc::new(ProcessManager::new(prometheus_spec, probe.clone()));
    let dashboard: Arc<dyn ManagedService> = Arc::new(
        ProcessManager::new(ServiceSpec::grafana(&cfg.grafana), probe).with_hook(Arc::new(provisioner)),
    );

    let coordinator = Arc::new(MonitoringCoordinator::new(exporter, collector, dashboard));

    let app_state = AppState {
        hypervisor,
        coordinator: coordinator.clone(),
        registry,
        stats,
        health_tracker: HealthTracker::new(),
    };
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.api.listen_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding management API on {addr}"))?;
    info!(%addr, "management API listening");

    // readiness waits can take a while; keep them off the API startup path
    let autostart = coordinator.clone();
    tokio::spawn(async move {
        let report = autostart.start_all().await;
        if !report.success {
            error!(?report, "monitoring stack did not fully start");
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for shutdown signal");
            }
            info!("shutdown requested");
        })
        .await
        .context("management API server")?;

    let report = coordinator.stop_all().await;
    info!(success = report.success, "monitoring stack stopped, bye");
    Ok(())
}
