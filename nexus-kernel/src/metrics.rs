//! Flat metric model and the shared registry read by the scrape endpoint.
//!
//! The exporter builds a complete `MetricSet` per tick and swaps it in; the
//! collection error counter lives beside the set and only ever grows.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

pub const NODE_UP: &str = "pve_node_up";
pub const NODE_CPU_RATIO: &str = "pve_node_cpu_ratio";
pub const NODE_MEMORY_TOTAL: &str = "pve_node_memory_total_bytes";
pub const NODE_MEMORY_USED: &str = "pve_node_memory_used_bytes";
pub const NODE_MEMORY_FREE: &str = "pve_node_memory_free_bytes";
pub const NODE_UPTIME: &str = "pve_node_uptime_seconds";

pub const VM_UP: &str = "pve_vm_up";
pub const VM_CPU_RATIO: &str = "pve_vm_cpu_ratio";
pub const VM_MEMORY_TOTAL: &str = "pve_vm_memory_total_bytes";
pub const VM_MEMORY_USED: &str = "pve_vm_memory_used_bytes";
pub const VM_UPTIME: &str = "pve_vm_uptime_seconds";
pub const VM_DISK_READ: &str = "pve_vm_disk_read_bytes";
pub const VM_DISK_WRITE: &str = "pve_vm_disk_write_bytes";
pub const VM_NET_IN: &str = "pve_vm_network_in_bytes";
pub const VM_NET_OUT: &str = "pve_vm_network_out_bytes";

pub const STORAGE_TOTAL: &str = "pve_storage_total_bytes";
pub const STORAGE_USED: &str = "pve_storage_used_bytes";
pub const STORAGE_AVAILABLE: &str = "pve_storage_available_bytes";

pub const COLLECTION_ERRORS: &str = "pve_exporter_collection_errors_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Gauge,
    Counter,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
        }
    }
}

/// Name, help text and type of every series family, in exposition order.
pub struct MetricDesc {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricType,
}

pub const DESCRIPTORS: &[MetricDesc] = &[
    MetricDesc { name: NODE_UP, help: "Node state (1 = online, 0 = offline)", kind: MetricType::Gauge },
    MetricDesc { name: NODE_CPU_RATIO, help: "Node CPU usage ratio", kind: MetricType::Gauge },
    MetricDesc { name: NODE_MEMORY_TOTAL, help: "Node total memory in bytes", kind: MetricType::Gauge },
    MetricDesc { name: NODE_MEMORY_USED, help: "Node used memory in bytes", kind: MetricType::Gauge },
    MetricDesc { name: NODE_MEMORY_FREE, help: "Node free memory in bytes", kind: MetricType::Gauge },
    MetricDesc { name: NODE_UPTIME, help: "Node uptime in seconds", kind: MetricType::Gauge },
    MetricDesc { name: VM_UP, help: "Guest state (1 = running, 0 = stopped)", kind: MetricType::Gauge },
    MetricDesc { name: VM_CPU_RATIO, help: "Guest CPU usage ratio", kind: MetricType::Gauge },
    MetricDesc { name: VM_MEMORY_TOTAL, help: "Guest configured memory in bytes", kind: MetricType::Gauge },
    MetricDesc { name: VM_MEMORY_USED, help: "Guest used memory in bytes", kind: MetricType::Gauge },
    MetricDesc { name: VM_UPTIME, help: "Guest uptime in seconds", kind: MetricType::Gauge },
    MetricDesc { name: VM_DISK_READ, help: "Guest disk bytes read", kind: MetricType::Gauge },
    MetricDesc { name: VM_DISK_WRITE, help: "Guest disk bytes written", kind: MetricType::Gauge },
    MetricDesc { name: VM_NET_IN, help: "Guest inbound network traffic in bytes", kind: MetricType::Gauge },
    MetricDesc { name: VM_NET_OUT, help: "Guest outbound network traffic in bytes", kind: MetricType::Gauge },
    MetricDesc { name: STORAGE_TOTAL, help: "Storage total capacity in bytes", kind: MetricType::Gauge },
    MetricDesc { name: STORAGE_USED, help: "Storage used capacity in bytes", kind: MetricType::Gauge },
    MetricDesc { name: STORAGE_AVAILABLE, help: "Storage available capacity in bytes", kind: MetricType::Gauge },
    MetricDesc { name: COLLECTION_ERRORS, help: "Total number of collection errors", kind: MetricType::Counter },
];

pub type Labels = Vec<(&'static str, String)>;

/// A single observation; timestamp is implicit at publish.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub name: &'static str,
    pub labels: Labels,
    pub value: f64,
}

impl MetricPoint {
    pub fn new(name: &'static str, labels: Labels, value: f64) -> Self {
        Self { name, labels, value }
    }
}

/// One value per (name, label set); later inserts overwrite earlier ones.
#[derive(Debug, Clone, Default)]
pub struct MetricSet {
    series: BTreeMap<(&'static str, Labels), f64>,
}

impl MetricSet {
    pub fn insert(&mut self, point: MetricPoint) {
        self.series.insert((point.name, point.labels), point.value);
    }

    pub fn extend<I: IntoIterator<Item = MetricPoint>>(&mut self, points: I) {
        for point in points {
            self.insert(point);
        }
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    #[cfg(test)]
    pub fn get(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.series
            .iter()
            .find(|((n, l), _)| *n == name && labels_match(l, labels))
            .map(|(_, v)| *v)
    }

    #[cfg(test)]
    pub fn count_named(&self, name: &str) -> usize {
        self.series.keys().filter(|(n, _)| *n == name).count()
    }

    fn family<'a>(&'a self, name: &'a str) -> impl Iterator<Item = (&'a Labels, f64)> + 'a {
        self.series
            .iter()
            .filter(move |((n, _), _)| *n == name)
            .map(|((_, labels), value)| (labels, *value))
    }
}

#[cfg(test)]
fn labels_match(have: &Labels, want: &[(&str, &str)]) -> bool {
    have.len() == want.len()
        && want
            .iter()
            .all(|(k, v)| have.iter().any(|(hk, hv)| hk == k && hv == v))
}

/// Registry shared between the exporter loop (writer) and scrape handler (reader).
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    current: RwLock<MetricSet>,
    collection_errors: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published gauges with the set built during a tick.
    pub fn publish(&self, set: MetricSet) {
        *self.current.write() = set;
    }

    pub fn add_collection_errors(&self, count: u64) {
        if count > 0 {
            self.collection_errors.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn collection_errors(&self) -> u64 {
        self.collection_errors.load(Ordering::Relaxed)
    }

    pub fn series_count(&self) -> usize {
        self.current.read().len()
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> MetricSet {
        self.current.read().clone()
    }

    /// Render the text exposition format served on `/metrics`.
    pub fn render(&self) -> String {
        let current = self.current.read();
        let mut out = String::with_capacity(16 * 1024);

        for desc in DESCRIPTORS {
            if desc.name == COLLECTION_ERRORS {
                write_metric_header(&mut out, desc);
                append_line(&mut out, desc.name, &[], self.collection_errors() as f64);
                continue;
            }

            let mut family = current.family(desc.name).peekable();
            if family.peek().is_none() {
                continue;
            }
            write_metric_header(&mut out, desc);
            for (labels, value) in family {
                append_line(&mut out, desc.name, labels, value);
            }
        }

        out
    }
}

fn write_metric_header(out: &mut String, desc: &MetricDesc) {
    let _ = writeln!(out, "# HELP {} {}", desc.name, desc.help);
    let _ = writeln!(out, "# TYPE {} {}", desc.name, desc.kind.as_str());
}

fn append_line(out: &mut String, name: &str, labels: &[(&'static str, String)], value: f64) {
    if !value.is_finite() {
        return;
    }

    if labels.is_empty() {
        let _ = writeln!(out, "{name} {value}");
        return;
    }

    let rendered = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect::<Vec<_>>()
        .join(",");
    let _ = writeln!(out, "{name}{{{rendered}}} {value}");
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_label(node: &str) -> Labels {
        vec![("node", node.to_string())]
    }

    #[test]
    fn test_last_observation_wins() {
        let mut set = MetricSet::default();
        set.insert(MetricPoint::new(NODE_UP, node_label("pve1"), 0.0));
        set.insert(MetricPoint::new(NODE_UP, node_label("pve1"), 1.0));
        set.insert(MetricPoint::new(NODE_UP, node_label("pve2"), 1.0));

        assert_eq!(set.len(), 2);
        assert_eq!(set.get(NODE_UP, &[("node", "pve1")]), Some(1.0));
    }

    #[test]
    fn test_publish_swaps_but_counter_persists() {
        let registry = MetricsRegistry::new();
        let mut set = MetricSet::default();
        set.insert(MetricPoint::new(NODE_UP, node_label("pve1"), 1.0));
        registry.publish(set);
        registry.add_collection_errors(2);

        registry.publish(MetricSet::default());
        registry.add_collection_errors(1);

        assert_eq!(registry.series_count(), 0);
        assert_eq!(registry.collection_errors(), 3);
    }

    #[test]
    fn test_render_exposition_format() {
        let registry = MetricsRegistry::new();
        let mut set = MetricSet::default();
        set.insert(MetricPoint::new(
            VM_UP,
            vec![
                ("node", "pve1".into()),
                ("vmid", "101".into()),
                ("name", "web".into()),
                ("kind", "qemu".into()),
            ],
            1.0,
        ));
        set.insert(MetricPoint::new(NODE_MEMORY_USED, node_label("pve1"), 1536.5));
        registry.publish(set);

        let text = registry.render();
        assert!(text.contains("# TYPE pve_vm_up gauge"));
        assert!(text.contains(r#"pve_vm_up{node="pve1",vmid="101",name="web",kind="qemu"} 1"#));
        assert!(text.contains(r#"pve_node_memory_used_bytes{node="pve1"} 1536.5"#));
        assert!(text.contains("# TYPE pve_exporter_collection_errors_total counter"));
        assert!(text.contains("pve_exporter_collection_errors_total 0"));
        assert!(!text.contains("pve_storage_total_bytes"));
    }

    #[test]
    fn test_escapes_label_values() {
        assert_eq!(escape_label_value("a\"b\\c\n"), "a\\\"b\\\\c\\n");
    }

    #[test]
    fn test_non_finite_values_are_not_rendered() {
        let mut out = String::new();
        append_line(&mut out, NODE_CPU_RATIO, &node_label("pve1"), f64::NAN);
        assert!(out.is_empty());
    }
}
