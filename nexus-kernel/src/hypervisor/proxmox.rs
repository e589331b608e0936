//! Proxmox VE REST client.
//!
//! Every response is wrapped in `{"data": ...}`. Authentication is either an
//! API token (stateless header) or a user/password ticket obtained from
//! `/access/ticket`, cached until the API answers 401.

use super::{Hypervisor, HypervisorError};
use crate::config::ProxmoxConf;
use crate::models::{NodeStatus, NodeSummary, RawStorage, VmKind, VmStatus, VmSummary};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, COOKIE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum ProxmoxAuth {
    /// `id` is `user@realm!tokenname`
    Token { id: String, secret: String },
    Password { user: String, password: String },
}

#[derive(Debug, Clone)]
struct Ticket {
    ticket: String,
    csrf: String,
}

pub struct ProxmoxClient {
    http: reqwest::Client,
    base_url: String,
    auth: ProxmoxAuth,
    ticket: Mutex<Option<Ticket>>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf: String,
}

#[derive(Deserialize)]
struct NodeItem {
    node: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct StorageItem {
    storage: String,
    #[serde(rename = "type", default)]
    backend: Option<String>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    used: Option<u64>,
    #[serde(default)]
    avail: Option<u64>,
}

#[derive(Deserialize)]
struct GuestItem {
    #[serde(deserialize_with = "vmid_from_any")]
    vmid: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Container listings report `vmid` as a string, VM listings as an integer.
fn vmid_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Int(u32),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Int(id) => Ok(id),
        RawId::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

impl ProxmoxClient {
    /// `base_url` points at the API root, e.g. `https://pve:8006/api2/json`.
    pub fn new(
        base_url: impl Into<String>,
        auth: ProxmoxAuth,
        verify_tls: bool,
        timeout: Duration,
    ) -> Result<Self, HypervisorError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .timeout(timeout)
            .build()
            .map_err(|source| HypervisorError::Http { path: "<client>".into(), source })?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            ticket: Mutex::new(None),
        })
    }

    pub fn from_config(cfg: &ProxmoxConf) -> Result<Self, HypervisorError> {
        let auth = match (&cfg.token_id, &cfg.token_secret) {
            (Some(id), Some(secret)) => ProxmoxAuth::Token { id: id.clone(), secret: secret.clone() },
            _ => ProxmoxAuth::Password {
                user: cfg.user.clone(),
                password: cfg.password.clone().unwrap_or_default(),
            },
        };
        info!(host = %cfg.host, port = cfg.port, verify_tls = cfg.verify_tls, "Proxmox client configured");
        Self::new(
            cfg.api_url(),
            auth,
            cfg.verify_tls,
            Duration::from_secs(cfg.request_timeout_secs),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn authorize(&self, req: RequestBuilder, write: bool) -> Result<RequestBuilder, HypervisorError> {
        match &self.auth {
            ProxmoxAuth::Token { id, secret } => {
                Ok(req.header(AUTHORIZATION, format!("PVEAPIToken={id}={secret}")))
            }
            ProxmoxAuth::Password { .. } => {
                let ticket = self.ticket().await?;
                let req = req.header(COOKIE, format!("PVEAuthCookie={}", ticket.ticket));
                Ok(if write { req.header("CSRFPreventionToken", ticket.csrf) } else { req })
            }
        }
    }

    async fn ticket(&self) -> Result<Ticket, HypervisorError> {
        let mut cached = self.ticket.lock().await;
        if let Some(ticket) = cached.as_ref() {
            return Ok(ticket.clone());
        }
        let ticket = self.login().await?;
        *cached = Some(ticket.clone());
        Ok(ticket)
    }

    async fn login(&self) -> Result<Ticket, HypervisorError> {
        let ProxmoxAuth::Password { user, password } = &self.auth else {
            return Err(HypervisorError::Auth("ticket login requires password credentials".into()));
        };

        let path = "/access/ticket";
        let resp = self
            .http
            .post(self.url(path))
            .form(&[("username", user.as_str()), ("password", password.as_str())])
            .send()
            .await
            .map_err(|source| HypervisorError::Http { path: path.into(), source })?;

        if !resp.status().is_success() {
            return Err(HypervisorError::Auth(format!(
                "login as {user} rejected with status {}",
                resp.status()
            )));
        }

        let data: TicketData = decode(path, resp).await?;
        debug!(user = %user, "obtained Proxmox ticket");
        Ok(Ticket { ticket: data.ticket, csrf: data.csrf })
    }

    async fn request<T: DeserializeOwned>(&self, method: Method, path: &str) -> Result<T, HypervisorError> {
        let write = method != Method::GET;
        let req = self.authorize(self.http.request(method, self.url(path)), write).await?;
        let resp = req
            .send()
            .await
            .map_err(|source| HypervisorError::Http { path: path.into(), source })?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            // force a fresh login on the next call
            self.ticket.lock().await.take();
            return Err(HypervisorError::Auth(format!("{path} rejected the credentials")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(HypervisorError::Status {
                path: path.into(),
                status: status.as_u16(),
                body,
            });
        }

        decode(path, resp).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, HypervisorError> {
        self.request(Method::GET, path).await
    }

    async fn list_guests(&self, node: &str, kind: VmKind) -> Result<Vec<VmSummary>, HypervisorError> {
        let items: Vec<GuestItem> = self.get(&format!("/nodes/{node}/{kind}")).await?;
        Ok(items
            .into_iter()
            .map(|item| VmSummary {
                node: node.to_string(),
                vmid: item.vmid,
                name: item.name,
                kind,
                running: item.status.as_deref() == Some("running"),
            })
            .collect())
    }

    async fn node_guests(&self, node: &str) -> Result<Vec<VmSummary>, HypervisorError> {
        let mut guests = Vec::new();
        for kind in VmKind::ALL {
            guests.extend(self.list_guests(node, kind).await?);
        }
        Ok(guests)
    }
}

async fn decode<T: DeserializeOwned>(path: &str, resp: Response) -> Result<T, HypervisorError> {
    let body = resp
        .text()
        .await
        .map_err(|source| HypervisorError::Http { path: path.into(), source })?;
    let envelope: Envelope<T> = serde_json::from_str(&body)
        .map_err(|source| HypervisorError::Decode { path: path.into(), source })?;
    Ok(envelope.data)
}

#[async_trait]
impl Hypervisor for ProxmoxClient {
    async fn list_nodes(&self) -> Result<Vec<NodeSummary>, HypervisorError> {
        let items: Vec<NodeItem> = self.get("/nodes").await?;
        Ok(items
            .into_iter()
            .map(|item| NodeSummary {
                online: item.status.as_deref() == Some("online"),
                name: item.node,
            })
            .collect())
    }

    async fn node_status(&self, node: &str) -> Result<NodeStatus, HypervisorError> {
        self.get(&format!("/nodes/{node}/status")).await
    }

    async fn list_storage(&self, node: &str) -> Result<Vec<RawStorage>, HypervisorError> {
        let items: Vec<StorageItem> = self.get(&format!("/nodes/{node}/storage")).await?;
        Ok(items
            .into_iter()
            .map(|item| RawStorage {
                name: item.storage,
                backend: item.backend.unwrap_or_default(),
                total: item.total,
                used: item.used,
                avail: item.avail,
            })
            .collect())
    }

    /// With a node: any failed listing is an error. Across the cluster: a
    /// node whose listing fails is skipped, and only a cluster where every
    /// node failed is an error.
    async fn list_vms(&self, node: Option<&str>) -> Result<Vec<VmSummary>, HypervisorError> {
        if let Some(node) = node {
            return self.node_guests(node).await;
        }

        let nodes = self.list_nodes().await?;
        let mut guests = Vec::new();
        let mut failed = 0usize;
        for node in &nodes {
            match self.node_guests(&node.name).await {
                Ok(found) => guests.extend(found),
                Err(e) => {
                    failed += 1;
                    warn!(node = %node.name, online = node.online, error = %e, "guest listing failed, node skipped");
                }
            }
        }

        if failed > 0 && failed == nodes.len() {
            return Err(HypervisorError::Unavailable(format!(
                "guest listing failed on all {failed} nodes"
            )));
        }
        Ok(guests)
    }

    async fn vm_status(&self, node: &str, vmid: u32, kind: VmKind) -> Result<VmStatus, HypervisorError> {
        self.get(&format!("/nodes/{node}/{kind}/{vmid}/status/current")).await
    }

    async fn start_vm(&self, node: &str, vmid: u32, kind: VmKind) -> Result<String, HypervisorError> {
        info!(node, vmid, %kind, "requesting guest start");
        self.request(Method::POST, &format!("/nodes/{node}/{kind}/{vmid}/status/start")).await
    }

    async fn stop_vm(&self, node: &str, vmid: u32, kind: VmKind) -> Result<String, HypervisorError> {
        info!(node, vmid, %kind, "requesting guest stop");
        self.request(Method::POST, &format!("/nodes/{node}/{kind}/{vmid}/status/stop")).await
    }
}
