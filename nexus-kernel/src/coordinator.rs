//! Ordered start/stop of the monitoring stack: collector, then dashboard,
//! plus the exporter loop. Status is always recomputed from live checks.

use crate::exporter::PollingExporter;
use crate::lifecycle::{ManagedService, ServiceKind, ServiceReport};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentResult {
    fn ok() -> Self {
        Self { ok: true, error: None }
    }

    fn failed(error: impl ToString) -> Self {
        Self { ok: false, error: Some(error.to_string()) }
    }
}

impl<E: std::fmt::Display> From<Result<(), E>> for ComponentResult {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::failed(e),
        }
    }
}

/// Per-component outcome of start/stop/restart.
#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    pub collector: ComponentResult,
    pub dashboard: ComponentResult,
    pub exporter: ComponentResult,
    pub success: bool,
}

impl ActionReport {
    fn new(collector: ComponentResult, dashboard: ComponentResult, exporter: ComponentResult) -> Self {
        let success = collector.ok && dashboard.ok && exporter.ok;
        Self { collector, dashboard, exporter, success }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub collector_up: bool,
    pub dashboard_up: bool,
    pub exporter_running: bool,
    pub overall_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringUrls {
    pub collector: String,
    pub dashboard: String,
}

pub struct MonitoringCoordinator {
    exporter: Arc<PollingExporter>,
    collector: Arc<dyn ManagedService>,
    dashboard: Arc<dyn ManagedService>,
    active: AtomicBool,
}

impl MonitoringCoordinator {
    pub fn new(
        exporter: Arc<PollingExporter>,
        collector: Arc<dyn ManagedService>,
        dashboard: Arc<dyn ManagedService>,
    ) -> Self {
        Self { exporter, collector, dashboard, active: AtomicBool::new(false) }
    }

    /// Outcome of the last start/stop, not a live check.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn exporter(&self) -> &Arc<PollingExporter> {
        &self.exporter
    }

    pub async fn start_all(&self) -> ActionReport {
        info!("starting monitoring stack");

        let collector = ComponentResult::from(self.collector.start().await);
        let dashboard = if collector.ok {
            ComponentResult::from(self.dashboard.start().await)
        } else {
            warn!(service = %self.dashboard.kind(), "skipped: collector did not start");
            ComponentResult::failed(format!("skipped: {} did not start", self.collector.kind()))
        };
        let exporter = ComponentResult::from(self.exporter.launch().await.map(|_| ()));

        let report = ActionReport::new(collector, dashboard, exporter);
        self.active.store(report.success, Ordering::SeqCst);
        if report.success {
            info!("monitoring stack active");
        } else {
            warn!(?report, "monitoring stack partially started");
        }
        report
    }

    /// Dashboard first, then collector, then the exporter loop. Stopping an
    /// idle component succeeds.
    pub async fn stop_all(&self) -> ActionReport {
        info!("stopping monitoring stack");

        let dashboard = ComponentResult::from(self.dashboard.stop().await);
        let collector = ComponentResult::from(self.collector.stop().await);
        self.exporter.cancel().await;

        self.active.store(false, Ordering::SeqCst);
        ActionReport::new(collector, dashboard, ComponentResult::ok())
    }

    pub async fn restart_all(&self) -> ActionReport {
        let stopped = self.stop_all().await;
        if !stopped.success {
            warn!(?stopped, "stop before restart incomplete");
        }
        self.start_all().await
    }

    /// Restart a single service; the rest of the stack is left alone.
    pub async fn restart_service(&self, kind: ServiceKind) -> ComponentResult {
        let service = match kind {
            ServiceKind::Collector => &self.collector,
            ServiceKind::Dashboard => &self.dashboard,
        };
        info!(service = %kind, "restarting service");
        let result = ComponentResult::from(service.restart().await);
        if !result.ok {
            self.active.store(false, Ordering::SeqCst);
        }
        result
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let collector_up = self.collector.check_status().await;
        let dashboard_up = self.dashboard.check_status().await;
        let exporter_running = self.exporter.is_running();
        CoordinatorStatus {
            collector_up,
            dashboard_up,
            exporter_running,
            overall_active: collector_up && dashboard_up && exporter_running,
        }
    }

    pub async fn reports(&self) -> Vec<ServiceReport> {
        vec![self.collector.report().await, self.dashboard.report().await]
    }

    pub fn urls(&self) -> MonitoringUrls {
        MonitoringUrls {
            collector: self.collector.base_url().to_string(),
            dashboard: self.dashboard.base_url().to_string(),
        }
    }
}
