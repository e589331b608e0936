/**
 * HYPERVISOR ADAPTER - Capability set consumed from the cluster management API
 *
 * ROLE :
 * The exporter and the REST API only see the `Hypervisor` trait. The VM kind
 * is resolved to `VmKind` here and traffic counters are decoded to
 * `NetCounter`, so nothing downstream matches on raw strings.
 *
 * IMPLEMENTATIONS :
 * - `ProxmoxClient` : Proxmox VE REST API over reqwest (token or ticket auth)
 * - in-module fakes in the exporter / http tests
 */

pub mod proxmox;

use crate::models::{NodeStatus, NodeSummary, RawStorage, VmKind, VmStatus, VmSummary};
use async_trait::async_trait;

pub use proxmox::ProxmoxClient;

/// Failure of a single hypervisor call. Transient from the exporter's point of view.
#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    #[error("HTTP error on {path}: {source}")]
    Http {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{path} returned status {status}: {body}")]
    Status { path: String, status: u16, body: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid payload from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("hypervisor unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeSummary>, HypervisorError>;

    async fn node_status(&self, node: &str) -> Result<NodeStatus, HypervisorError>;

    async fn list_storage(&self, node: &str) -> Result<Vec<RawStorage>, HypervisorError>;

    /// Guests of both kinds, on one node or (`None`) on every node.
    async fn list_vms(&self, node: Option<&str>) -> Result<Vec<VmSummary>, HypervisorError>;

    async fn vm_status(&self, node: &str, vmid: u32, kind: VmKind) -> Result<VmStatus, HypervisorError>;

    /// Returns the task identifier (UPID) of the queued start.
    async fn start_vm(&self, node: &str, vmid: u32, kind: VmKind) -> Result<String, HypervisorError>;

    /// Returns the task identifier (UPID) of the queued stop.
    async fn stop_vm(&self, node: &str, vmid: u32, kind: VmKind) -> Result<String, HypervisorError>;
}
