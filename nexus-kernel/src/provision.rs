//! Dashboard provisioning run after Grafana becomes ready: register the
//! Prometheus datasource once, then (re)import the default dashboards.

use crate::config::GrafanaConf;
use crate::lifecycle::PostStartHook;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("HTTP error during {step}: {source}")]
    Http {
        step: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{step} rejected with status {status}: {body}")]
    Rejected { step: String, status: u16, body: String },
}

pub struct GrafanaProvisioner {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    datasource_name: String,
    datasource_url: String,
}

impl GrafanaProvisioner {
    pub fn new(
        base_url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        datasource_name: impl Into<String>,
        datasource_url: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
            user: user.into(),
            password: password.into(),
            datasource_name: datasource_name.into(),
            datasource_url: datasource_url.into(),
        }
    }

    /// `collector_url` is the Prometheus base URL the datasource points at.
    pub fn from_config(conf: &GrafanaConf, collector_url: &str) -> Self {
        Self::new(
            format!("http://localhost:{}", conf.port),
            &conf.admin_user,
            &conf.admin_password,
            &conf.datasource_name,
            collector_url,
        )
    }

    /// Returns true when the datasource had to be created.
    pub async fn ensure_datasource(&self) -> Result<bool, ProvisionError> {
        let step = "datasource lookup";
        let resp = self
            .http
            .get(format!("{}/api/datasources/name/{}", self.base_url, self.datasource_name))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|source| ProvisionError::Http { step: step.into(), source })?;

        match resp.status() {
            StatusCode::OK => {
                info!(datasource = %self.datasource_name, "datasource already present");
                return Ok(false);
            }
            StatusCode::NOT_FOUND => {}
            status => return Err(rejected(step, status, resp).await),
        }

        let step = "datasource creation";
        let body = json!({
            "name": self.datasource_name,
            "type": "prometheus",
            "url": self.datasource_url,
            "access": "proxy",
            "isDefault": true,
        });
        let resp = self
            .http
            .post(format!("{}/api/datasources", self.base_url))
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|source| ProvisionError::Http { step: step.into(), source })?;

        if !resp.status().is_success() {
            return Err(rejected(step, resp.status(), resp).await);
        }
        info!(datasource = %self.datasource_name, url = %self.datasource_url, "datasource created");
        Ok(true)
    }

    pub async fn import_dashboard(&self, dashboard: &Value) -> Result<(), ProvisionError> {
        let step = "dashboard import";
        let payload = json!({ "dashboard": dashboard, "overwrite": true, "folderId": 0 });
        let resp = self
            .http
            .post(format!("{}/api/dashboards/db", self.base_url))
            .basic_auth(&self.user, Some(&self.password))
            .json(&payload)
            .send()
            .await
            .map_err(|source| ProvisionError::Http { step: step.into(), source })?;

        if !resp.status().is_success() {
            return Err(rejected(step, resp.status(), resp).await);
        }
        let url = resp
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| v.get("url").and_then(Value::as_str).map(str::to_owned))
            .unwrap_or_default();
        info!(title = %dashboard["title"], url = %url, "dashboard imported");
        Ok(())
    }
}

async fn rejected(step: &str, status: StatusCode, resp: reqwest::Response) -> ProvisionError {
    ProvisionError::Rejected {
        step: step.into(),
        status: status.as_u16(),
        body: resp.text().await.unwrap_or_default(),
    }
}

#[async_trait]
impl PostStartHook for GrafanaProvisioner {
    fn name(&self) -> &str {
        "grafana-provisioning"
    }

    /// Every step is attempted; the first failure is returned after all ran.
    async fn run(&self) -> Result<(), ProvisionError> {
        let mut first_error = None;

        if let Err(e) = self.ensure_datasource().await {
            warn!(error = %e, "datasource provisioning failed");
            first_error = Some(e);
        }
        for dashboard in default_dashboards(&self.datasource_name) {
            if let Err(e) = self.import_dashboard(&dashboard).await {
                warn!(title = %dashboard["title"], error = %e, "dashboard import failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn panel(id: u32, title: &str, kind: &str, datasource: &str, expr: &str, legend: &str, grid: [u32; 4]) -> Value {
    let [h, w, x, y] = grid;
    json!({
        "id": id,
        "title": title,
        "type": kind,
        "datasource": datasource,
        "targets": [{ "expr": expr, "legendFormat": legend, "refId": "A" }],
        "gridPos": { "h": h, "w": w, "x": x, "y": y },
    })
}

fn template_var(name: &str, datasource: &str, query: &str) -> Value {
    json!({
        "name": name,
        "type": "query",
        "datasource": datasource,
        "query": query,
        "multi": true,
        "includeAll": true,
    })
}

/// The cluster overview and per-guest dashboards, querying the exporter's series.
pub fn default_dashboards(datasource: &str) -> Vec<Value> {
    let overview = json!({
        "id": null,
        "uid": "nexus-pve-overview",
        "title": "Proxmox overview",
        "tags": ["proxmox", "nexus"],
        "timezone": "browser",
        "panels": [
            panel(1, "Node CPU usage", "timeseries", datasource,
                r#"pve_node_cpu_ratio{node=~"$node"}"#, "{{node}}", [8, 12, 0, 0]),
            panel(2, "Node memory usage", "timeseries", datasource,
                r#"pve_node_memory_used_bytes{node=~"$node"} / pve_node_memory_total_bytes{node=~"$node"}"#,
                "{{node}}", [8, 12, 12, 0]),
            panel(3, "Node state", "stat", datasource,
                r#"pve_node_up{node=~"$node"}"#, "{{node}}", [4, 6, 0, 8]),
            panel(4, "Running guests per node", "bargauge", datasource,
                r#"sum(pve_vm_up{node=~"$node"}) by (node)"#, "{{node}}", [4, 6, 6, 8]),
            panel(5, "Storage usage", "bargauge", datasource,
                r#"pve_storage_used_bytes{node=~"$node"} / pve_storage_total_bytes{node=~"$node"}"#,
                "{{node}}/{{storage}}", [4, 12, 12, 8]),
        ],
        "templating": { "list": [template_var("node", datasource, "label_values(pve_node_up, node)")] },
        "time": { "from": "now-6h", "to": "now" },
        "refresh": "1m",
        "schemaVersion": 16,
        "version": 1,
    });

    let guests = json!({
        "id": null,
        "uid": "nexus-pve-guests",
        "title": "Virtual machine details",
        "tags": ["proxmox", "nexus", "vms"],
        "timezone": "browser",
        "panels": [
            panel(1, "Guest CPU usage", "timeseries", datasource,
                r#"pve_vm_cpu_ratio{name=~"$vm"}"#, "{{name}}", [8, 12, 0, 0]),
            panel(2, "Guest memory usage", "timeseries", datasource,
                r#"pve_vm_memory_used_bytes{name=~"$vm"} / pve_vm_memory_total_bytes{name=~"$vm"}"#,
                "{{name}}", [8, 12, 12, 0]),
            panel(3, "Network in", "timeseries", datasource,
                r#"rate(pve_vm_network_in_bytes{name=~"$vm"}[5m])"#, "{{name}}", [8, 12, 0, 8]),
            panel(4, "Network out", "timeseries", datasource,
                r#"rate(pve_vm_network_out_bytes{name=~"$vm"}[5m])"#, "{{name}}", [8, 12, 12, 8]),
            panel(5, "Disk read", "timeseries", datasource,
                r#"rate(pve_vm_disk_read_bytes{name=~"$vm"}[5m])"#, "{{name}}", [8, 12, 0, 16]),
            panel(6, "Disk write", "timeseries", datasource,
                r#"rate(pve_vm_disk_write_bytes{name=~"$vm"}[5m])"#, "{{name}}", [8, 12, 12, 16]),
        ],
        "templating": { "list": [template_var("vm", datasource, "label_values(pve_vm_up, name)")] },
        "time": { "from": "now-6h", "to": "now" },
        "refresh": "1m",
        "schemaVersion": 16,
        "version": 1,
    });

    vec![overview, guests]
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_devkit::GrafanaStub;

    fn provisioner(base_url: String, password: &str) -> GrafanaProvisioner {
        GrafanaProvisioner::new(base_url, "admin", password, "Prometheus", "http://localhost:9090")
    }

    #[tokio::test]
    async fn test_creates_missing_datasource_and_imports_dashboards() {
        let stub = GrafanaStub::new().require_basic_auth("admin", "admin");
        let server = stub.serve().await.unwrap();

        provisioner(server.url(""), "admin").run().await.unwrap();

        let created = stub.datasource_posts();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0]["type"], "prometheus");
        assert_eq!(created[0]["access"], "proxy");
        assert_eq!(created[0]["url"], "http://localhost:9090");
        assert_eq!(created[0]["isDefault"], true);

        let dashboards = stub.dashboard_posts();
        assert_eq!(dashboards.len(), 2);
        assert!(dashboards.iter().all(|d| d["overwrite"] == true));
        assert_eq!(dashboards[0]["dashboard"]["title"], "Proxmox overview");
        assert_eq!(dashboards[1]["dashboard"]["title"], "Virtual machine details");
    }

    #[tokio::test]
    async fn test_existing_datasource_is_not_recreated() {
        let stub = GrafanaStub::new().with_datasource("Prometheus");
        let server = stub.serve().await.unwrap();

        let created = provisioner(server.url(""), "admin").ensure_datasource().await.unwrap();

        assert!(!created);
        assert!(stub.datasource_posts().is_empty());
    }

    #[tokio::test]
    async fn test_bad_credentials_fail_every_step() {
        let stub = GrafanaStub::new().require_basic_auth("admin", "admin");
        let server = stub.serve().await.unwrap();

        let err = provisioner(server.url(""), "wrong").run().await.unwrap_err();

        assert!(matches!(err, ProvisionError::Rejected { status: 401, .. }));
        assert!(stub.dashboard_posts().is_empty());
    }

    #[test]
    fn test_dashboards_only_query_exported_series() {
        for dashboard in default_dashboards("Prometheus") {
            let text = dashboard.to_string();
            assert!(text.contains("pve_"));
            assert!(text.contains(r#""datasource":"Prometheus""#));
        }
    }
}
