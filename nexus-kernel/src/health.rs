use crate::coordinator::MonitoringCoordinator;
use crate::metrics::MetricsRegistry;
use crate::state::{Shared, TickStats};
use serde::Serialize;
use std::time::Instant;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub monitoring_active: bool,
    pub exporter_running: bool,
    pub ticks_completed: u64,
    pub last_tick_at: Option<String>,
    pub last_tick_duration_ms: Option<u64>,
    pub series_published: usize,
    pub collection_errors: u64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn get_health(
        &self,
        coordinator: &MonitoringCoordinator,
        stats: &Shared<TickStats>,
        registry: &MetricsRegistry,
    ) -> KernelHealth {
        let stats = stats.lock().clone();

        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            monitoring_active: coordinator.is_active(),
            exporter_running: coordinator.exporter().is_running(),
            ticks_completed: stats.ticks_completed,
            last_tick_at: stats.last_tick_at.and_then(|t| t.format(&Rfc3339).ok()),
            last_tick_duration_ms: stats.last_tick_duration_ms,
            series_published: registry.series_count(),
            collection_errors: registry.collection_errors(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Resident set size from procfs; 0 where unavailable.
fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }

    0.0
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_reads_resident_memory() {
        assert!(get_memory_usage_mb() > 0.0);
    }
}
