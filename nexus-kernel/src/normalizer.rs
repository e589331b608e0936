//! Raw hypervisor payloads → `MetricPoint`s.
//!
//! Pure functions only: no I/O and no retries. Absent optional fields emit
//! nothing (zero is a real value and never stands in for "unknown"). Each
//! rejected field yields exactly one `NormalizationError`; the caller counts
//! them.

use crate::metrics::{self, Labels, MetricPoint};
use crate::models::{NetCounter, NodeSnapshot, RawStorage, StorageSnapshot, VmSnapshot};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizationError {
    #[error("{entity}: {field} used {used} exceeds total {total}")]
    ImpossibleRatio {
        entity: String,
        field: &'static str,
        used: u64,
        total: u64,
    },
    #[error("{entity}: {field} has an unrecognized shape: {raw}")]
    UnrecognizedShape {
        entity: String,
        field: &'static str,
        raw: String,
    },
    #[error("{entity}: {field} is not a finite number")]
    NotFinite { entity: String, field: &'static str },
}

/// Points emitted for one entity plus the fields that had to be skipped.
#[derive(Debug, Default)]
pub struct Normalized {
    pub points: Vec<MetricPoint>,
    pub errors: Vec<NormalizationError>,
}

impl Normalized {
    fn push(&mut self, name: &'static str, labels: &Labels, value: f64) {
        self.points.push(MetricPoint::new(name, labels.clone(), value));
    }

    fn push_opt(&mut self, name: &'static str, labels: &Labels, value: Option<u64>) {
        if let Some(v) = value {
            self.push(name, labels, v as f64);
        }
    }

    fn push_ratio(&mut self, name: &'static str, labels: &Labels, entity: &str, value: Option<f64>) {
        match value {
            Some(v) if v.is_finite() => self.push(name, labels, v),
            Some(_) => self.errors.push(NormalizationError::NotFinite {
                entity: entity.to_string(),
                field: name,
            }),
            None => {}
        }
    }

    fn merge(&mut self, other: Normalized) {
        self.points.extend(other.points);
        self.errors.extend(other.errors);
    }
}

/// Unit a storage backend reports its capacity in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageUnit {
    Bytes,
    Kibibytes,
}

/// Per-backend unit table. Looked up for every storage volume.
#[derive(Debug, Clone)]
pub struct StoragePolicy {
    table: HashMap<String, StorageUnit>,
    fallback: StorageUnit,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        let mut table = HashMap::new();
        table.insert("zfspool".to_string(), StorageUnit::Bytes);
        for backend in [
            "dir", "lvm", "lvmthin", "nfs", "cifs", "glusterfs", "cephfs", "rbd", "iscsi",
            "iscsidirect", "zfs", "btrfs", "pbs",
        ] {
            table.insert(backend.to_string(), StorageUnit::Kibibytes);
        }
        Self { table, fallback: StorageUnit::Kibibytes }
    }
}

impl StoragePolicy {
    #[cfg(test)]
    pub fn with_unit(mut self, backend: &str, unit: StorageUnit) -> Self {
        self.table.insert(backend.to_string(), unit);
        self
    }

    pub fn unit_for(&self, backend: &str) -> StorageUnit {
        match self.table.get(backend) {
            Some(unit) => *unit,
            None => {
                debug!(backend, "unknown storage backend, applying fallback unit");
                self.fallback
            }
        }
    }

    pub fn needs_scaling(&self, backend: &str) -> bool {
        self.unit_for(backend) == StorageUnit::Kibibytes
    }
}

fn node_labels(node: &str) -> Labels {
    vec![("node", node.to_string())]
}

fn vm_labels(vm: &VmSnapshot) -> Labels {
    vec![
        ("node", vm.node_name.clone()),
        ("vmid", vm.vmid.to_string()),
        ("name", vm.name.clone()),
        ("kind", vm.kind.as_str().to_string()),
    ]
}

/// Node gauges followed by the gauges of each of its storage volumes.
pub fn normalize_node(node: &NodeSnapshot, policy: &StoragePolicy) -> Normalized {
    let mut out = Normalized::default();
    let labels = node_labels(&node.node_name);
    let entity = format!("node {}", node.node_name);

    out.push(metrics::NODE_UP, &labels, if node.online { 1.0 } else { 0.0 });
    out.push_ratio(metrics::NODE_CPU_RATIO, &labels, &entity, node.cpu_ratio);

    let memory_overflow = match (node.memory_total, node.memory_used, node.memory_free) {
        (Some(total), Some(used), _) if used > total => Some(("memory used", used, total)),
        (Some(total), _, Some(free)) if free > total => Some(("memory free", free, total)),
        _ => None,
    };
    match memory_overflow {
        Some((field, used, total)) => {
            out.errors.push(NormalizationError::ImpossibleRatio { entity, field, used, total });
        }
        None => {
            out.push_opt(metrics::NODE_MEMORY_TOTAL, &labels, node.memory_total);
            out.push_opt(metrics::NODE_MEMORY_USED, &labels, node.memory_used);
            out.push_opt(metrics::NODE_MEMORY_FREE, &labels, node.memory_free);
        }
    }

    out.push_opt(metrics::NODE_UPTIME, &labels, node.uptime_seconds);

    for volume in &node.storage_volumes {
        out.merge(normalize_storage(&node.node_name, volume, policy));
    }

    out
}

/// Unit-corrected view of a storage entry, `None` when a capacity field is missing.
pub fn storage_snapshot<'a>(raw: &'a RawStorage, policy: &StoragePolicy) -> Option<StorageSnapshot<'a>> {
    let (total, used, avail) = (raw.total?, raw.used?, raw.avail?);
    let factor = if policy.needs_scaling(&raw.backend) { 1024 } else { 1 };

    Some(StorageSnapshot {
        storage_name: &raw.name,
        total_bytes: total.saturating_mul(factor),
        used_bytes: used.saturating_mul(factor),
        available_bytes: avail.saturating_mul(factor),
    })
}

pub fn normalize_storage(node: &str, raw: &RawStorage, policy: &StoragePolicy) -> Normalized {
    let mut out = Normalized::default();
    let Some(snapshot) = storage_snapshot(raw, policy) else {
        return out;
    };

    let entity = format!("storage {} on {}", raw.name, node);
    if snapshot.used_bytes > snapshot.total_bytes {
        out.errors.push(NormalizationError::ImpossibleRatio {
            entity,
            field: "storage used",
            used: snapshot.used_bytes,
            total: snapshot.total_bytes,
        });
        return out;
    }
    if snapshot.available_bytes > snapshot.total_bytes {
        out.errors.push(NormalizationError::ImpossibleRatio {
            entity,
            field: "storage available",
            used: snapshot.available_bytes,
            total: snapshot.total_bytes,
        });
        return out;
    }

    let labels = vec![
        ("node", node.to_string()),
        ("storage", snapshot.storage_name.to_string()),
    ];
    out.push(metrics::STORAGE_TOTAL, &labels, snapshot.total_bytes as f64);
    out.push(metrics::STORAGE_USED, &labels, snapshot.used_bytes as f64);
    out.push(metrics::STORAGE_AVAILABLE, &labels, snapshot.available_bytes as f64);
    out
}

/// Sum of a traffic counter, whatever shape the hypervisor used.
pub fn aggregate_net(counter: &NetCounter) -> Option<f64> {
    match counter {
        NetCounter::Aggregate(v) => Some(*v),
        NetCounter::PerInterface(map) => Some(map.values().sum()),
        NetCounter::Unrecognized(_) => None,
    }
}

/// Liveness gauge for every guest; detailed gauges only while running.
pub fn normalize_vm(vm: &VmSnapshot) -> Normalized {
    let mut out = Normalized::default();
    let labels = vm_labels(vm);

    out.push(metrics::VM_UP, &labels, if vm.running { 1.0 } else { 0.0 });
    if !vm.running {
        return out;
    }

    let entity = format!("{} {} on {}", vm.kind, vm.vmid, vm.node_name);
    out.push_ratio(metrics::VM_CPU_RATIO, &labels, &entity, vm.cpu_ratio);

    match (vm.mem_total, vm.mem_used) {
        (Some(total), Some(used)) if used > total => {
            out.errors.push(NormalizationError::ImpossibleRatio {
                entity: entity.clone(),
                field: "memory",
                used,
                total,
            });
        }
        _ => {
            out.push_opt(metrics::VM_MEMORY_TOTAL, &labels, vm.mem_total);
            out.push_opt(metrics::VM_MEMORY_USED, &labels, vm.mem_used);
        }
    }

    out.push_opt(metrics::VM_UPTIME, &labels, vm.uptime_seconds);
    out.push_opt(metrics::VM_DISK_READ, &labels, vm.disk_read_bytes);
    out.push_opt(metrics::VM_DISK_WRITE, &labels, vm.disk_write_bytes);

    for (name, field, counter) in [
        (metrics::VM_NET_IN, "netin", &vm.net_in),
        (metrics::VM_NET_OUT, "netout", &vm.net_out),
    ] {
        let Some(counter) = counter else { continue };
        match aggregate_net(counter) {
            Some(total) => out.push_ratio(name, &labels, &entity, Some(total)),
            None => out.errors.push(NormalizationError::UnrecognizedShape {
                entity: entity.clone(),
                field,
                raw: format!("{counter:?}"),
            }),
        }
    }

    out
}
