/**
 * POLLING EXPORTER - Periodic hypervisor scrape republished as Prometheus text
 *
 * ROLE :
 * Every `interval`, walk nodes -> status/storage, then each node's guest list
 * -> status of running guests, normalize everything into a fresh `MetricSet`
 * and swap it into the shared `MetricsRegistry`.
 *
 * OPERATION :
 * - each failed hypervisor call or rejected field counts one collection error
 *   and never aborts the tick
 * - series not observed during a tick disappear at the swap
 * - `launch()` binds the scrape listener first, then spawns the scrape server
 *   and the loop under one `CancellationToken` per launch; `cancel()` stops both
 */

use crate::hypervisor::Hypervisor;
use crate::metrics::{MetricSet, MetricsRegistry};
use crate::models::{NodeSnapshot, VmSnapshot};
use crate::normalizer::{normalize_node, normalize_vm, Normalized, StoragePolicy};
use crate::state::{Shared, TickStats};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ExporterError {
    #[error("cannot bind scrape endpoint on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub series: usize,
    pub errors: u64,
}

struct RunHandle {
    cancel: CancellationToken,
    addr: SocketAddr,
    loop_task: JoinHandle<()>,
    server_task: JoinHandle<()>,
}

pub struct PollingExporter {
    hypervisor: Arc<dyn Hypervisor>,
    registry: Arc<MetricsRegistry>,
    stats: Shared<TickStats>,
    policy: StoragePolicy,
    interval: Duration,
    listen_addr: SocketAddr,
    running: AtomicBool,
    run: Mutex<Option<RunHandle>>,
}

impl PollingExporter {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        registry: Arc<MetricsRegistry>,
        stats: Shared<TickStats>,
        interval: Duration,
        listen_addr: SocketAddr,
    ) -> Self {
        Self {
            hypervisor,
            registry,
            stats,
            policy: StoragePolicy::default(),
            interval,
            listen_addr,
            running: AtomicBool::new(false),
            run: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One full collection pass. Publishes the result and returns what it did.
    pub async fn collect_once(&self) -> TickReport {
        let started = Instant::now();
        let mut set = MetricSet::default();
        let mut errors = 0u64;

        let node_names = match self.hypervisor.list_nodes().await {
            Ok(nodes) => {
                let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
                for summary in nodes {
                    let mut snapshot = NodeSnapshot::new(&summary);

                    match self.hypervisor.node_status(&summary.name).await {
                        Ok(status) => snapshot.apply_status(status),
                        Err(e) => {
                            errors += 1;
                            warn!(node = %summary.name, error = %e, "node status fetch failed");
                        }
                    }
                    match self.hypervisor.list_storage(&summary.name).await {
                        Ok(volumes) => snapshot.storage_volumes = volumes,
                        Err(e) => {
                            errors += 1;
                            warn!(node = %summary.name, error = %e, "storage fetch failed");
                        }
                    }

                    errors += absorb(&mut set, normalize_node(&snapshot, &self.policy));
                }
                Some(names)
            }
            Err(e) => {
                errors += 1;
                warn!(error = %e, "node list fetch failed");
                None
            }
        };

        // one guest listing per node so an unreachable member costs one error, not the inventory
        let mut guests = Vec::new();
        match node_names {
            Some(names) => {
                for name in names {
                    match self.hypervisor.list_vms(Some(&name)).await {
                        Ok(found) => guests.extend(found),
                        Err(e) => {
                            errors += 1;
                            warn!(node = %name, error = %e, "guest list fetch failed");
                        }
                    }
                }
            }
            None => match self.hypervisor.list_vms(None).await {
                Ok(found) => guests = found,
                Err(e) => {
                    errors += 1;
                    warn!(error = %e, "guest list fetch failed");
                }
            },
        }

        for guest in guests {
            let status = if guest.running {
                match self.hypervisor.vm_status(&guest.node, guest.vmid, guest.kind).await {
                    Ok(status) => Some(status),
                    Err(e) => {
                        errors += 1;
                        warn!(node = %guest.node, vmid = guest.vmid, kind = %guest.kind, error = %e, "guest status fetch failed");
                        None
                    }
                }
            } else {
                None
            };
            errors += absorb(&mut set, normalize_vm(&VmSnapshot::new(guest, status)));
        }

        if set.is_empty() {
            warn!(errors, "collection tick produced no series");
        }
        let series = set.len();
        self.registry.publish(set);
        self.registry.add_collection_errors(errors);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        {
            let mut stats = self.stats.lock();
            stats.ticks_completed += 1;
            stats.last_tick_at = Some(OffsetDateTime::now_utc());
            stats.last_tick_duration_ms = Some(elapsed_ms);
        }
        info!(series, errors, elapsed_ms, "collection tick done");

        TickReport { series, errors }
    }

    /// Bind the scrape endpoint and start the loop. Already running -> returns the bound address.
    pub async fn launch(self: &Arc<Self>) -> Result<SocketAddr, ExporterError> {
        let mut run = self.run.lock().await;
        if let Some(handle) = run.as_ref() {
            if !handle.loop_task.is_finished() {
                debug!(addr = %handle.addr, "exporter already running");
                return Ok(handle.addr);
            }
        }
        if let Some(stale) = run.take() {
            stale.cancel.cancel();
        }

        let bind_err = |source: std::io::Error| ExporterError::Bind { addr: self.listen_addr, source };
        let listener = TcpListener::bind(self.listen_addr).await.map_err(bind_err)?;
        let addr = listener.local_addr().map_err(bind_err)?;

        let cancel = CancellationToken::new();
        let app = crate::http::scrape_router(self.registry.clone());
        let server_cancel = cancel.clone();
        let server_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(server_cancel.cancelled_owned())
                .await
            {
                error!(error = %e, "scrape server failed");
            }
        });

        self.running.store(true, Ordering::SeqCst);
        let loop_task = tokio::spawn(Arc::clone(self).run_loop(cancel.clone()));
        *run = Some(RunHandle { cancel, addr, loop_task, server_task });

        info!(%addr, interval_secs = self.interval.as_secs(), "exporter launched");
        Ok(addr)
    }

    /// Stop the loop and the scrape server. No-op when not launched.
    pub async fn cancel(&self) {
        let Some(handle) = self.run.lock().await.take() else {
            return;
        };

        handle.cancel.cancel();
        if let Err(e) = handle.loop_task.await {
            warn!(error = %e, "exporter loop ended abnormally");
        }
        if !drain_or_abort(handle.server_task, SERVER_DRAIN_TIMEOUT).await {
            warn!(addr = %handle.addr, "scrape server did not drain in time, aborted");
        }
        self.running.store(false, Ordering::SeqCst);
        info!(addr = %handle.addr, "exporter stopped");
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.collect_once() => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        debug!("exporter loop exited");
    }
}

/// Wait for a task up to `limit`, then abort it. Returns once the task is
/// gone either way, so whatever it owned (the listener) is released.
async fn drain_or_abort(mut task: JoinHandle<()>, limit: Duration) -> bool {
    if tokio::time::timeout(limit, &mut task).await.is_ok() {
        return true;
    }
    task.abort();
    let _ = task.await;
    false
}

fn absorb(set: &mut MetricSet, normalized: Normalized) -> u64 {
    for e in &normalized.errors {
        warn!(error = %e, "metric skipped");
    }
    set.extend(normalized.points);
    normalized.errors.len() as u64
}
