//! Launch descriptions for the two managed services and their config templates.

use super::{LifecycleError, ServiceKind};
use crate::config::{GrafanaConf, PrometheusConf};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tracing::info;

/// Everything a `ProcessManager` needs to launch and supervise one binary.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub kind: ServiceKind,
    /// Resolved on `PATH` unless it contains a separator
    pub binary: String,
    pub args: Vec<String>,
    pub config_path: PathBuf,
    /// Written to `config_path` only when the file is missing
    pub config_template: String,
    pub work_dirs: Vec<PathBuf>,
    pub readiness_url: String,
    pub base_url: String,
    pub readiness_attempts: u32,
    pub readiness_interval: Duration,
    pub stop_timeout: Duration,
}

impl ServiceSpec {
    pub fn prometheus(conf: &PrometheusConf, exporter_port: u16) -> Self {
        let config_path = conf.base_dir.join("prometheus.yml");
        let data_dir = conf.base_dir.join("data");
        let base_url = format!("http://localhost:{}", conf.port);

        Self {
            kind: ServiceKind::Collector,
            binary: conf.binary.clone(),
            args: vec![
                format!("--config.file={}", config_path.display()),
                format!("--storage.tsdb.path={}", data_dir.display()),
                format!("--web.listen-address=:{}", conf.port),
            ],
            config_template: prometheus_template(&conf.scrape_interval, exporter_port, conf.port),
            config_path,
            work_dirs: vec![conf.base_dir.clone(), data_dir],
            readiness_url: format!("{base_url}/-/ready"),
            base_url,
            readiness_attempts: conf.readiness_attempts,
            readiness_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(conf.stop_timeout_secs),
        }
    }

    pub fn grafana(conf: &GrafanaConf) -> Self {
        let conf_dir = conf.base_dir.join("conf");
        let config_path = conf_dir.join("grafana.ini");
        let data_dir = conf.base_dir.join("data");
        let logs_dir = conf.base_dir.join("logs");
        let base_url = format!("http://localhost:{}", conf.port);

        Self {
            kind: ServiceKind::Dashboard,
            binary: conf.binary.clone(),
            args: vec![
                "--config".into(),
                config_path.display().to_string(),
                "--homepath".into(),
                conf.base_dir.display().to_string(),
            ],
            config_template: grafana_template(conf, &data_dir, &logs_dir),
            config_path,
            work_dirs: vec![conf_dir, data_dir, logs_dir],
            readiness_url: format!("{base_url}/api/health"),
            base_url,
            readiness_attempts: conf.readiness_attempts,
            readiness_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(conf.stop_timeout_secs),
        }
    }

    /// Create working directories and write the config template if no config exists.
    /// Returns true when a file was written.
    pub async fn materialize_config(&self) -> Result<bool, LifecycleError> {
        for dir in &self.work_dirs {
            fs::create_dir_all(dir).await?;
        }
        if fs::try_exists(&self.config_path).await? {
            return Ok(false);
        }
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.config_path, &self.config_template).await?;
        info!(service = %self.kind, path = %self.config_path.display(), "wrote default config");
        Ok(true)
    }
}

fn prometheus_template(scrape_interval: &str, exporter_port: u16, self_port: u16) -> String {
    format!(
        r#"global:
  scrape_interval: {scrape_interval}
  evaluation_interval: {scrape_interval}

scrape_configs:
  - job_name: 'proxmox'
    static_configs:
      - targets: ['localhost:{exporter_port}']

  - job_name: 'prometheus'
    static_configs:
      - targets: ['localhost:{self_port}']
"#
    )
}

fn grafana_template(conf: &GrafanaConf, data_dir: &std::path::Path, logs_dir: &std::path::Path) -> String {
    format!(
        r#"[server]
http_port = {port}
domain = localhost

[paths]
data = {data}
logs = {logs}

[auth.anonymous]
enabled = true
org_name = Main Org.
org_role = Viewer

[security]
admin_user = {user}
admin_password = {password}
"#,
        port = conf.port,
        data = data_dir.display(),
        logs = logs_dir.display(),
        user = conf.admin_user,
        password = conf.admin_password,
    )
}
