use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of managed workload. Decided once at the hypervisor boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmKind {
    /// Full virtual machine (KVM/QEMU)
    Qemu,
    /// OS-level container (LXC)
    Lxc,
}

impl VmKind {
    pub const ALL: [VmKind; 2] = [VmKind::Qemu, VmKind::Lxc];

    pub fn as_str(&self) -> &'static str {
        match self {
            VmKind::Qemu => "qemu",
            VmKind::Lxc => "lxc",
        }
    }
}

impl fmt::Display for VmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qemu" => Ok(VmKind::Qemu),
            "lxc" => Ok(VmKind::Lxc),
            other => Err(format!("unknown vm kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
    pub name: String,
    pub online: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub used: Option<u64>,
    #[serde(default)]
    pub free: Option<u64>,
}

/// Detailed node status, every field may be omitted by the hypervisor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub memory: Option<MemoryUsage>,
    #[serde(default)]
    pub uptime: Option<u64>,
}

/// Storage entry as reported, before unit correction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawStorage {
    pub name: String,
    pub backend: String,
    pub total: Option<u64>,
    pub used: Option<u64>,
    pub avail: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmSummary {
    pub node: String,
    pub vmid: u32,
    pub name: Option<String>,
    pub kind: VmKind,
    pub running: bool,
}

/// Per-direction traffic counter. QEMU guests report one scalar, some
/// container setups report one counter per interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetCounter {
    Aggregate(f64),
    PerInterface(BTreeMap<String, f64>),
    Unrecognized(serde_json::Value),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmStatus {
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub mem: Option<u64>,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub uptime: Option<u64>,
    #[serde(default)]
    pub diskread: Option<u64>,
    #[serde(default)]
    pub diskwrite: Option<u64>,
    #[serde(default)]
    pub netin: Option<NetCounter>,
    #[serde(default)]
    pub netout: Option<NetCounter>,
}

/// Everything collected about one node during a tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSnapshot {
    pub node_name: String,
    pub online: bool,
    pub cpu_ratio: Option<f64>,
    pub memory_total: Option<u64>,
    pub memory_used: Option<u64>,
    pub memory_free: Option<u64>,
    pub uptime_seconds: Option<u64>,
    pub storage_volumes: Vec<RawStorage>,
}

impl NodeSnapshot {
    pub fn new(summary: &NodeSummary) -> Self {
        Self {
            node_name: summary.name.clone(),
            online: summary.online,
            ..Default::default()
        }
    }

    pub fn apply_status(&mut self, status: NodeStatus) {
        self.cpu_ratio = status.cpu;
        self.uptime_seconds = status.uptime;
        if let Some(memory) = status.memory {
            self.memory_total = memory.total;
            self.memory_used = memory.used;
            self.memory_free = memory.free;
        }
    }
}

/// Byte-normalized storage volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageSnapshot<'a> {
    pub storage_name: &'a str,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VmSnapshot {
    pub node_name: String,
    pub vmid: u32,
    pub name: String,
    pub kind: VmKind,
    pub running: bool,
    pub cpu_ratio: Option<f64>,
    pub mem_total: Option<u64>,
    pub mem_used: Option<u64>,
    pub uptime_seconds: Option<u64>,
    pub disk_read_bytes: Option<u64>,
    pub disk_write_bytes: Option<u64>,
    pub net_in: Option<NetCounter>,
    pub net_out: Option<NetCounter>,
}

impl VmSnapshot {
    /// Detailed fields are only kept for running guests.
    pub fn new(summary: VmSummary, status: Option<VmStatus>) -> Self {
        let name = summary
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("vm-{}", summary.vmid));
        let status = if summary.running { status.unwrap_or_default() } else { VmStatus::default() };

        Self {
            node_name: summary.node,
            vmid: summary.vmid,
            name,
            kind: summary.kind,
            running: summary.running,
            cpu_ratio: status.cpu,
            mem_total: status.maxmem,
            mem_used: status.mem,
            uptime_seconds: status.uptime,
            disk_read_bytes: status.diskread,
            disk_write_bytes: status.diskwrite,
            net_in: status.netin,
            net_out: status.netout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(name: Option<&str>, running: bool) -> VmSummary {
        VmSummary {
            node: "pve1".into(),
            vmid: 101,
            name: name.map(Into::into),
            kind: VmKind::Qemu,
            running,
        }
    }

    #[test]
    fn test_vm_name_defaults_to_vmid() {
        assert_eq!(VmSnapshot::new(summary(None, true), None).name, "vm-101");
        assert_eq!(VmSnapshot::new(summary(Some(""), true), None).name, "vm-101");
        assert_eq!(VmSnapshot::new(summary(Some("web"), true), None).name, "web");
    }

    #[test]
    fn test_stopped_vm_drops_detailed_status() {
        let status = VmStatus { cpu: Some(0.5), mem: Some(10), ..Default::default() };
        let snap = VmSnapshot::new(summary(Some("web"), false), Some(status));
        assert_eq!(snap.cpu_ratio, None);
        assert_eq!(snap.mem_used, None);
    }

    #[test]
    fn test_net_counter_shapes() {
        let scalar: NetCounter = serde_json::from_str("75").unwrap();
        assert_eq!(scalar, NetCounter::Aggregate(75.0));

        let map: NetCounter = serde_json::from_str(r#"{"eth0": 100, "eth1": 50}"#).unwrap();
        assert!(matches!(map, NetCounter::PerInterface(ref m) if m.len() == 2));

        let odd: NetCounter = serde_json::from_str(r#""lots""#).unwrap();
        assert!(matches!(odd, NetCounter::Unrecognized(_)));
    }

    #[test]
    fn test_vm_kind_round_trips_through_str() {
        for kind in VmKind::ALL {
            assert_eq!(kind.as_str().parse::<VmKind>().unwrap(), kind);
        }
        assert!("vz".parse::<VmKind>().is_err());
    }
}
