use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct NexusConfig {
    pub proxmox: ProxmoxConf,
    pub exporter: ExporterConf,
    pub prometheus: PrometheusConf,
    pub grafana: GrafanaConf,
    pub api: ApiConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProxmoxConf {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub token_id: Option<String>, // ex: "root@pam!nexus"
    pub token_secret: Option<String>,
    pub verify_tls: bool,
    pub request_timeout_secs: u64,
}

impl Default for ProxmoxConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8006,
            user: "root@pam".into(),
            password: None,
            token_id: None,
            token_secret: None,
            verify_tls: false,
            request_timeout_secs: 10,
        }
    }
}

impl ProxmoxConf {
    pub fn api_url(&self) -> String {
        format!("https://{}:{}/api2/json", self.host, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExporterConf {
    pub listen_port: u16,
    pub poll_interval_secs: u64,
}

impl Default for ExporterConf {
    fn default() -> Self {
        Self { listen_port: 9091, poll_interval_secs: 30 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PrometheusConf {
    pub binary: String,
    pub port: u16,
    pub base_dir: PathBuf,
    pub scrape_interval: String,
    pub readiness_attempts: u32,
    pub stop_timeout_secs: u64,
}

impl Default for PrometheusConf {
    fn default() -> Self {
        Self {
            binary: "prometheus".into(),
            port: 9090,
            base_dir: PathBuf::from("./data/prometheus"),
            scrape_interval: "15s".into(),
            readiness_attempts: 30,
            stop_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GrafanaConf {
    pub binary: String,
    pub port: u16,
    pub base_dir: PathBuf,
    pub admin_user: String,
    pub admin_password: String,
    pub datasource_name: String,
    pub readiness_attempts: u32,
    pub stop_timeout_secs: u64,
}

impl Default for GrafanaConf {
    fn default() -> Self {
        Self {
            binary: "grafana-server".into(),
            port: 3000,
            base_dir: PathBuf::from("./data/grafana"),
            admin_user: "admin".into(),
            admin_password: "admin".into(),
            datasource_name: "Prometheus".into(),
            readiness_attempts: 30,
            stop_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConf {
    pub listen_port: u16,
}

impl Default for ApiConf {
    fn default() -> Self {
        Self { listen_port: 8080 }
    }
}

pub async fn load_config() -> NexusConfig {
    let path = std::env::var("NEXUS_KERNEL_CONFIG").unwrap_or_else(|_| "nexus.yaml".into());
    let mut cfg = read_config_file(Path::new(&path)).await;
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    cfg
}

async fn read_config_file(path: &Path) -> NexusConfig {
    if !path.exists() {
        info!(path = %path.display(), "no config file, using defaults");
        return NexusConfig::default();
    }

    let txt = match fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config unreadable, using defaults");
            return NexusConfig::default();
        }
    };
    if txt.trim().is_empty() {
        return NexusConfig::default();
    }

    serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "invalid config, using defaults");
        NexusConfig::default()
    })
}

/// Environment wins over the file. Unparseable numeric values are ignored.
pub fn apply_env_overrides<F>(cfg: &mut NexusConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("NEXUS_PVE_HOST") {
        cfg.proxmox.host = v;
    }
    if let Some(v) = parsed(&lookup, "NEXUS_PVE_PORT") {
        cfg.proxmox.port = v;
    }
    if let Some(v) = lookup("NEXUS_PVE_USER") {
        cfg.proxmox.user = v;
    }
    if let Some(v) = lookup("NEXUS_PVE_PASSWORD") {
        cfg.proxmox.password = Some(v);
    }
    if let Some(v) = lookup("NEXUS_PVE_TOKEN_ID") {
        cfg.proxmox.token_id = Some(v);
    }
    if let Some(v) = lookup("NEXUS_PVE_TOKEN_SECRET") {
        cfg.proxmox.token_secret = Some(v);
    }
    if let Some(v) = parsed(&lookup, "NEXUS_PVE_VERIFY_TLS") {
        cfg.proxmox.verify_tls = v;
    }
    if let Some(v) = parsed(&lookup, "NEXUS_POLL_INTERVAL_SECS") {
        cfg.exporter.poll_interval_secs = v;
    }
    if let Some(v) = parsed(&lookup, "NEXUS_EXPORTER_PORT") {
        cfg.exporter.listen_port = v;
    }
    if let Some(v) = parsed(&lookup, "NEXUS_API_PORT") {
        cfg.api.listen_port = v;
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg: NexusConfig = serde_yaml::from_str(
            "proxmox:\n  host: pve.lan\n  token_id: root@pam!nexus\nexporter:\n  poll_interval_secs: 5\n",
        )
        .unwrap();

        assert_eq!(cfg.proxmox.host, "pve.lan");
        assert_eq!(cfg.proxmox.port, 8006);
        assert_eq!(cfg.proxmox.api_url(), "https://pve.lan:8006/api2/json");
        assert_eq!(cfg.exporter.poll_interval_secs, 5);
        assert_eq!(cfg.exporter.listen_port, 9091);
        assert_eq!(cfg.grafana.datasource_name, "Prometheus");
        assert_eq!(cfg.api.listen_port, 8080);
    }

    #[test]
    fn test_env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("NEXUS_PVE_HOST", "10.0.0.5"),
            ("NEXUS_PVE_PORT", "8443"),
            ("NEXUS_PVE_VERIFY_TLS", "true"),
            ("NEXUS_EXPORTER_PORT", "not-a-port"),
            ("NEXUS_API_PORT", "18080"),
        ]
        .into_iter()
        .collect();

        let mut cfg = NexusConfig::default();
        apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.proxmox.host, "10.0.0.5");
        assert_eq!(cfg.proxmox.port, 8443);
        assert!(cfg.proxmox.verify_tls);
        assert_eq!(cfg.exporter.listen_port, 9091);
        assert_eq!(cfg.api.listen_port, 18080);
    }

    #[tokio::test]
    async fn test_missing_empty_and_invalid_files_yield_defaults() {
        let dir = tempfile::tempdir().unwrap();

        let missing = read_config_file(&dir.path().join("absent.yaml")).await;
        assert_eq!(missing.exporter.listen_port, 9091);

        let empty = dir.path().join("empty.yaml");
        std::fs::write(&empty, "  \n").unwrap();
        assert_eq!(read_config_file(&empty).await.api.listen_port, 8080);

        let invalid = dir.path().join("invalid.yaml");
        std::fs::write(&invalid, "proxmox: [not, a, map]").unwrap();
        assert_eq!(read_config_file(&invalid).await.proxmox.host, "localhost");
    }
}
