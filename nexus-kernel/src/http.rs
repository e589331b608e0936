/**
 * MANAGEMENT API - HTTP surface of the kernel
 *
 * ROLE :
 * Axum router on `api.listen_port` for operators and scripts: kernel health,
 * monitoring stack control, and a passthrough to the hypervisor inventory.
 * The scrape router served by the exporter lives here too.
 *
 * ROUTES :
 * - /health, /system/health
 * - /monitoring/{status,urls} (GET), /monitoring/{start,stop,restart} (POST)
 * - /monitoring/{prometheus|grafana}/restart (POST)
 * - /api/nodes, /api/vms, /api/vms/{node}/{kind}/{vmid}/{status|start|stop}
 *
 * ERRORS :
 * Hypervisor failures -> 502, unknown guest kind -> 400, a start/stop/restart
 * that did not fully succeed -> 500 with the per-component map as body.
 */

use crate::coordinator::{
    ActionReport, ComponentResult, CoordinatorStatus, MonitoringCoordinator, MonitoringUrls,
};
use crate::health::{HealthTracker, KernelHealth};
use crate::hypervisor::{Hypervisor, HypervisorError};
use crate::lifecycle::{ServiceKind, ServiceReport};
use crate::metrics::MetricsRegistry;
use crate::models::{NodeSummary, VmKind, VmStatus, VmSummary};
use crate::state::{Shared, TickStats};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AppState {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub coordinator: Arc<MonitoringCoordinator>,
    pub registry: Arc<MetricsRegistry>,
    pub stats: Shared<TickStats>,
    pub health_tracker: HealthTracker,
}

#[derive(Debug)]
enum ApiError {
    Hypervisor(HypervisorError),
    BadRequest(String),
}

impl From<HypervisorError> for ApiError {
    fn from(e: HypervisorError) -> Self {
        ApiError::Hypervisor(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, msg) = match self {
            ApiError::Hypervisor(e) => {
                warn!(error = %e, "hypervisor call failed");
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (code, Json(serde_json::json!({ "ok": false, "error": msg }))).into_response()
    }
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let resp = next.run(req).await;
    debug!(%method, %path, status = resp.status().as_u16(), elapsed_ms = started.elapsed().as_millis() as u64, "request");
    resp
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/monitoring/status", get(get_monitoring_status))
        .route("/monitoring/urls", get(get_monitoring_urls))
        .route("/monitoring/start", post(start_monitoring))
        .route("/monitoring/stop", post(stop_monitoring))
        .route("/monitoring/restart", post(restart_monitoring))
        .route("/monitoring/{service}/restart", post(restart_service))
        .route("/api/nodes", get(list_nodes))
        .route("/api/vms", get(list_vms))
        .route("/api/vms/{node}/{kind}/{vmid}/status", get(get_vm_status))
        .route("/api/vms/{node}/{kind}/{vmid}/start", post(start_vm))
        .route("/api/vms/{node}/{kind}/{vmid}/stop", post(stop_vm))
        .with_state(app_state)
        .layer(middleware::from_fn(log_requests))
}

/// `GET /metrics` in the text exposition format.
pub fn scrape_router(registry: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(scrape_metrics))
        .with_state(registry)
}

async fn scrape_metrics(State(registry): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        registry.render(),
    )
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.coordinator, &app.stats, &app.registry))
}

#[derive(Serialize)]
struct MonitoringView {
    #[serde(flatten)]
    status: CoordinatorStatus,
    services: Vec<ServiceReport>,
}

// GET /monitoring/status (live, never cached)
async fn get_monitoring_status(State(app): State<AppState>) -> Json<MonitoringView> {
    let status = app.coordinator.status().await;
    let services = app.coordinator.reports().await;
    Json(MonitoringView { status, services })
}

async fn get_monitoring_urls(State(app): State<AppState>) -> Json<MonitoringUrls> {
    Json(app.coordinator.urls())
}

fn action_response(report: ActionReport) -> (StatusCode, Json<ActionReport>) {
    let code = if report.success { StatusCode::OK } else { StatusCode::INTERNAL_SERVER_ERROR };
    (code, Json(report))
}

// POST /monitoring/start (waits for readiness of both services)
async fn start_monitoring(State(app): State<AppState>) -> (StatusCode, Json<ActionReport>) {
    action_response(app.coordinator.start_all().await)
}

async fn stop_monitoring(State(app): State<AppState>) -> (StatusCode, Json<ActionReport>) {
    action_response(app.coordinator.stop_all().await)
}

async fn restart_monitoring(State(app): State<AppState>) -> (StatusCode, Json<ActionReport>) {
    action_response(app.coordinator.restart_all().await)
}

// POST /monitoring/{service}/restart
async fn restart_service(
    State(app): State<AppState>,
    Path(service): Path<String>,
) -> Result<(StatusCode, Json<ComponentResult>), ApiError> {
    let kind: ServiceKind = service.parse().map_err(ApiError::BadRequest)?;
    let result = app.coordinator.restart_service(kind).await;
    let code = if result.ok { StatusCode::OK } else { StatusCode::INTERNAL_SERVER_ERROR };
    Ok((code, Json(result)))
}

// GET /api/nodes
async fn list_nodes(State(app): State<AppState>) -> Result<Json<Vec<NodeSummary>>, ApiError> {
    Ok(Json(app.hypervisor.list_nodes().await?))
}

#[derive(Debug, Deserialize)]
struct VmsParams {
    node: Option<String>,
}

// GET /api/vms[?node=pve1]
async fn list_vms(
    State(app): State<AppState>,
    Query(params): Query<VmsParams>,
) -> Result<Json<Vec<VmSummary>>, ApiError> {
    Ok(Json(app.hypervisor.list_vms(params.node.as_deref()).await?))
}

fn parse_kind(kind: &str) -> Result<VmKind, ApiError> {
    kind.parse().map_err(ApiError::BadRequest)
}

// GET /api/vms/{node}/{kind}/{vmid}/status
async fn get_vm_status(
    State(app): State<AppState>,
    Path((node, kind, vmid)): Path<(String, String, u32)>,
) -> Result<Json<VmStatus>, ApiError> {
    let kind = parse_kind(&kind)?;
    Ok(Json(app.hypervisor.vm_status(&node, vmid, kind).await?))
}

#[derive(Serialize)]
struct TaskView {
    ok: bool,
    upid: String,
}

async fn start_vm(
    State(app): State<AppState>,
    Path((node, kind, vmid)): Path<(String, String, u32)>,
) -> Result<Json<TaskView>, ApiError> {
    let kind = parse_kind(&kind)?;
    let upid = app.hypervisor.start_vm(&node, vmid, kind).await?;
    Ok(Json(TaskView { ok: true, upid }))
}

async fn stop_vm(
    State(app): State<AppState>,
    Path((node, kind, vmid)): Path<(String, String, u32)>,
) -> Result<Json<TaskView>, ApiError> {
    let kind = parse_kind(&kind)?;
    let upid = app.hypervisor.stop_vm(&node, vmid, kind).await?;
    Ok(Json(TaskView { ok: true, upid }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GrafanaConf, PrometheusConf};
    use crate::exporter::PollingExporter;
    use crate::lifecycle::{HttpProbe, ProcessManager, ServiceSpec};
    use crate::models::{NodeStatus, RawStorage};
    use crate::state::new_state;
    use async_trait::async_trait;
    use nexus_devkit::{serve_router, StubServer};
    use std::net::SocketAddr;
    use std::time::Duration;

    struct OneNode;

    #[async_trait]
    impl Hypervisor for OneNode {
        async fn list_nodes(&self) -> Result<Vec<NodeSummary>, HypervisorError> {
            Ok(vec![NodeSummary { name: "pve1".into(), online: true }])
        }
        async fn node_status(&self, _node: &str) -> Result<NodeStatus, HypervisorError> {
            Ok(NodeStatus::default())
        }
        async fn list_storage(&self, _node: &str) -> Result<Vec<RawStorage>, HypervisorError> {
            Ok(Vec::new())
        }
        async fn list_vms(&self, node: Option<&str>) -> Result<Vec<VmSummary>, HypervisorError> {
            let guest = VmSummary { node: "pve1".into(), vmid: 101, name: None, kind: VmKind::Lxc, running: true };
            match node {
                None | Some("pve1") => Ok(vec![guest]),
                Some(_) => Ok(Vec::new()),
            }
        }
        async fn vm_status(&self, _node: &str, vmid: u32, _kind: VmKind) -> Result<VmStatus, HypervisorError> {
            if vmid == 999 {
                return Err(HypervisorError::Status { path: "/nodes/pve1/qemu/999/status/current".into(), status: 500, body: "no such VM".into() });
            }
            Ok(VmStatus { cpu: Some(0.1), ..Default::default() })
        }
        async fn start_vm(&self, node: &str, vmid: u32, kind: VmKind) -> Result<String, HypervisorError> {
            Ok(format!("UPID:{node}:{kind}start:{vmid}"))
        }
        async fn stop_vm(&self, node: &str, vmid: u32, kind: VmKind) -> Result<String, HypervisorError> {
            Ok(format!("UPID:{node}:{kind}stop:{vmid}"))
        }
    }

    async fn serve(dir: &tempfile::TempDir) -> StubServer {
        let hypervisor: Arc<dyn Hypervisor> = Arc::new(OneNode);
        let registry = Arc::new(MetricsRegistry::new());
        let stats = new_state(TickStats::default());
        let exporter = Arc::new(PollingExporter::new(
            hypervisor.clone(),
            registry.clone(),
            stats.clone(),
            Duration::from_secs(60),
            SocketAddr::from(([127, 0, 0, 1], 0)),
        ));

        let probe = Arc::new(HttpProbe::default());
        let prometheus = PrometheusConf {
            binary: "nexus-missing-prometheus".into(),
            base_dir: dir.path().join("prometheus"),
            ..Default::default()
        };
        let grafana = GrafanaConf { base_dir: dir.path().join("grafana"), ..Default::default() };
        let collector = Arc::new(ProcessManager::new(ServiceSpec::prometheus(&prometheus, 9091), probe.clone()));
        let dashboard = Arc::new(ProcessManager::new(ServiceSpec::grafana(&grafana), probe));

        let app_state = AppState {
            hypervisor,
            coordinator: Arc::new(MonitoringCoordinator::new(exporter, collector, dashboard)),
            registry,
            stats,
            health_tracker: HealthTracker::new(),
        };
        serve_router(build_router(app_state)).await.unwrap()
    }

    #[tokio::test]
    async fn test_inventory_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let server = serve(&dir).await;
        let client = reqwest::Client::new();

        let nodes: serde_json::Value = client.get(server.url("/api/nodes")).send().await.unwrap().json().await.unwrap();
        assert_eq!(nodes[0]["name"], "pve1");

        let vms: serde_json::Value = client.get(server.url("/api/vms?node=pve1")).send().await.unwrap().json().await.unwrap();
        assert_eq!(vms[0]["kind"], "lxc");

        let resp = client.post(server.url("/api/vms/pve1/lxc/101/start")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let task: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(task["upid"], "UPID:pve1:lxcstart:101");
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let server = serve(&dir).await;
        let client = reqwest::Client::new();

        let resp = client.get(server.url("/api/vms/pve1/vz/101/status")).send().await.unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client.get(server.url("/api/vms/pve1/qemu/999/status")).send().await.unwrap();
        assert_eq!(resp.status(), 502);

        let resp = client.get(server.url("/api/vms/pve1/qemu/101/status")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn test_monitoring_start_reports_missing_collector() {
        let dir = tempfile::tempdir().unwrap();
        let server = serve(&dir).await;
        let client = reqwest::Client::new();

        let resp = client.post(server.url("/monitoring/start")).send().await.unwrap();
        assert_eq!(resp.status(), 500);
        let report: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(report["collector"]["ok"], false);
        assert_eq!(report["dashboard"]["ok"], false);
        assert_eq!(report["exporter"]["ok"], true);
        assert_eq!(report["success"], false);

        let status: serde_json::Value =
            client.get(server.url("/monitoring/status")).send().await.unwrap().json().await.unwrap();
        assert_eq!(status["overall_active"], false);
        assert_eq!(status["exporter_running"], true);
        assert_eq!(status["services"][0]["service"], "prometheus");

        let resp = client.post(server.url("/monitoring/stop")).send().await.unwrap();
        assert_eq!(resp.status(), 200);

        let health: serde_json::Value =
            client.get(server.url("/system/health")).send().await.unwrap().json().await.unwrap();
        assert_eq!(health["monitoring_active"], false);
        assert_eq!(health["exporter_running"], false);
    }

    #[tokio::test]
    async fn test_single_service_restart() {
        let dir = tempfile::tempdir().unwrap();
        let server = serve(&dir).await;
        let client = reqwest::Client::new();

        let resp = client.post(server.url("/monitoring/prometheus/restart")).send().await.unwrap();
        assert_eq!(resp.status(), 500);
        let result: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(result["ok"], false);
        assert!(result["error"].as_str().unwrap().contains("nexus-missing-prometheus"));

        let resp = client.post(server.url("/monitoring/nginx/restart")).send().await.unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_urls_and_liveness() {
        let dir = tempfile::tempdir().unwrap();
        let server = serve(&dir).await;

        let body = reqwest::get(server.url("/health")).await.unwrap().text().await.unwrap();
        assert_eq!(body, "ok");

        let urls: serde_json::Value = reqwest::get(server.url("/monitoring/urls")).await.unwrap().json().await.unwrap();
        assert_eq!(urls["collector"], "http://localhost:9090");
        assert_eq!(urls["dashboard"], "http://localhost:3000");
    }

    #[tokio::test]
    async fn test_scrape_router_content_type() {
        let registry = Arc::new(MetricsRegistry::new());
        registry.add_collection_errors(4);
        let server = serve_router(scrape_router(registry)).await.unwrap();

        let resp = reqwest::get(server.url("/metrics")).await.unwrap();
        let content_type = resp.headers()[header::CONTENT_TYPE.as_str()].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/plain; version=0.0.4"));
        assert!(resp.text().await.unwrap().contains("pve_exporter_collection_errors_total 4"));
    }
}
