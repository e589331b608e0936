/**
 * PROCESS LIFECYCLE - Supervision of the external collector and dashboard binaries
 *
 * ROLE :
 * Each `ProcessManager` owns at most one child process of one service kind and
 * drives it through Stopped -> Starting -> Ready -> Stopping -> Stopped/Killed.
 *
 * OPERATION :
 * - start : resolve binary on PATH, materialize config, spawn with piped
 *   output, poll the readiness URL, run post-start hooks once
 * - stop : SIGTERM, bounded wait, SIGKILL; idempotent when nothing runs
 * - check_status : reap exited children, then probe readiness live
 *
 * A readiness timeout leaves the child running and tracked (state Failed) so
 * a later stop() or check_status() still controls it.
 *
 * All operations on one manager go through a single tokio Mutex.
 */

pub mod probe;
pub mod service;

pub use probe::{HealthProbe, HttpProbe};
pub use service::ServiceSpec;

use crate::provision::ProvisionError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Time-series collector (Prometheus)
    Collector,
    /// Dashboard service (Grafana)
    Dashboard,
}

impl ServiceKind {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceKind::Collector => "prometheus",
            ServiceKind::Dashboard => "grafana",
        }
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prometheus" => Ok(ServiceKind::Collector),
            "grafana" => Ok(ServiceKind::Dashboard),
            other => Err(format!("unknown service: {other}")),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ProcessState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    /// Stopped by SIGKILL after the graceful timeout
    Killed,
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("binary not found on PATH: {binary}")]
    BinaryNotFound { binary: String },
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{service} not ready after {attempts} attempts on {url}")]
    ReadinessTimeout {
        service: ServiceKind,
        attempts: u32,
        url: String,
    },
    #[error("{service} exited during startup: {status}")]
    ExitedEarly { service: ServiceKind, status: String },
    #[error("failed to stop {service} (pid {pid}): {source}")]
    StopFailure {
        service: ServiceKind,
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Live child process. Exclusively owned by its manager.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    instance_id: String,
    started_at: OffsetDateTime,
}

/// Best-effort action run once each time a service becomes ready.
#[async_trait]
pub trait PostStartHook: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<(), ProvisionError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub service: &'static str,
    pub kind: ServiceKind,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub instance_id: Option<String>,
    pub uptime_seconds: Option<u64>,
    pub config_path: PathBuf,
    pub readiness_url: String,
}

/// What the coordinator drives; implemented by `ProcessManager` and by test fakes.
#[async_trait]
pub trait ManagedService: Send + Sync {
    fn kind(&self) -> ServiceKind;

    fn base_url(&self) -> &str;

    async fn start(&self) -> Result<(), LifecycleError>;

    async fn stop(&self) -> Result<(), LifecycleError>;

    async fn restart(&self) -> Result<(), LifecycleError>;

    /// Live check, never cached.
    async fn check_status(&self) -> bool;

    async fn report(&self) -> ServiceReport;
}

struct Inner {
    handle: Option<ProcessHandle>,
    state: ProcessState,
}

pub struct ProcessManager {
    spec: ServiceSpec,
    probe: Arc<dyn HealthProbe>,
    hooks: Vec<Arc<dyn PostStartHook>>,
    inner: Mutex<Inner>,
}

impl ProcessManager {
    pub fn new(spec: ServiceSpec, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            spec,
            probe,
            hooks: Vec::new(),
            inner: Mutex::new(Inner { handle: None, state: ProcessState::Stopped }),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn PostStartHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Resolve, then materialize the config, then spawn. Nothing is written
    /// to disk for a binary that is not on `PATH`.
    async fn launch_child(&self) -> Result<ProcessHandle, LifecycleError> {
        let binary = which::which(&self.spec.binary).map_err(|_| LifecycleError::BinaryNotFound {
            binary: self.spec.binary.clone(),
        })?;
        self.spec.materialize_config().await?;
        self.spawn_child(&binary)
    }

    fn spawn_child(&self, binary: &Path) -> Result<ProcessHandle, LifecycleError> {
        let kind = self.spec.kind;
        let mut cmd = Command::new(binary);
        cmd.args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| LifecycleError::Spawn {
            binary: binary.display().to_string(),
            source,
        })?;
        // signalling pid 0 would hit our own process group
        let Some(pid) = child.id() else {
            return Err(LifecycleError::Spawn {
                binary: binary.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "child exited before reporting a pid"),
            });
        };
        forward_output(kind, "stdout", child.stdout.take());
        forward_output(kind, "stderr", child.stderr.take());

        let handle = ProcessHandle {
            child,
            pid,
            instance_id: Uuid::new_v4().to_string(),
            started_at: OffsetDateTime::now_utc(),
        };
        info!(service = %kind, pid, instance = %handle.instance_id, binary = %binary.display(), "process spawned");
        Ok(handle)
    }

    async fn await_ready(&self, inner: &mut Inner) -> Result<(), LifecycleError> {
        let kind = self.spec.kind;
        let attempts = self.spec.readiness_attempts.max(1);

        for attempt in 1..=attempts {
            if let Some(handle) = inner.handle.as_mut() {
                if let Ok(Some(status)) = handle.child.try_wait() {
                    inner.handle = None;
                    inner.state = ProcessState::Failed(format!("exited during startup: {status}"));
                    return Err(LifecycleError::ExitedEarly { service: kind, status: status.to_string() });
                }
            }

            if self.probe.is_ready(&self.spec.readiness_url).await {
                inner.state = ProcessState::Ready;
                info!(service = %kind, attempt, "service ready");
                self.run_hooks().await;
                return Ok(());
            }

            debug!(service = %kind, attempt, attempts, "not ready yet");
            if attempt < attempts {
                tokio::time::sleep(self.spec.readiness_interval).await;
            }
        }

        inner.state = ProcessState::Failed("readiness timeout".into());
        warn!(service = %kind, attempts, url = %self.spec.readiness_url, "readiness timeout, process left running");
        Err(LifecycleError::ReadinessTimeout {
            service: kind,
            attempts,
            url: self.spec.readiness_url.clone(),
        })
    }

    async fn run_hooks(&self) {
        for hook in &self.hooks {
            match hook.run().await {
                Ok(()) => debug!(service = %self.spec.kind, hook = hook.name(), "post-start hook done"),
                Err(e) => warn!(service = %self.spec.kind, hook = hook.name(), error = %e, "post-start hook failed"),
            }
        }
    }

    /// Returns true when SIGKILL was needed.
    async fn terminate(&self, handle: &mut ProcessHandle) -> Result<bool, LifecycleError> {
        let kind = self.spec.kind;
        if let Ok(Some(status)) = handle.child.try_wait() {
            info!(service = %kind, pid = handle.pid, %status, "process already exited");
            return Ok(false);
        }

        #[cfg(unix)]
        {
            match send_sigterm(handle.pid) {
                Ok(()) => {
                    match tokio::time::timeout(self.spec.stop_timeout, handle.child.wait()).await {
                        Ok(Ok(status)) => {
                            info!(service = %kind, pid = handle.pid, %status, "process stopped");
                            return Ok(false);
                        }
                        Ok(Err(e)) => warn!(service = %kind, pid = handle.pid, error = %e, "wait failed, forcing kill"),
                        Err(_) => warn!(
                            service = %kind,
                            pid = handle.pid,
                            timeout_secs = self.spec.stop_timeout.as_secs(),
                            "graceful stop timed out, forcing kill"
                        ),
                    }
                }
                Err(e) => warn!(service = %kind, pid = handle.pid, error = %e, "SIGTERM failed, forcing kill"),
            }
        }

        handle.child.kill().await.map_err(|source| LifecycleError::StopFailure {
            service: kind,
            pid: handle.pid,
            source,
        })?;
        warn!(service = %kind, pid = handle.pid, "process killed");
        Ok(true)
    }
}

#[async_trait]
impl ManagedService for ProcessManager {
    fn kind(&self) -> ServiceKind {
        self.spec.kind
    }

    fn base_url(&self) -> &str {
        &self.spec.base_url
    }

    async fn start(&self) -> Result<(), LifecycleError> {
        let kind = self.spec.kind;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if let Some(handle) = inner.handle.as_mut() {
            match handle.child.try_wait() {
                Ok(None) if inner.state == ProcessState::Ready => {
                    debug!(service = %kind, pid = handle.pid, "already running");
                    return Ok(());
                }
                Ok(None) => {
                    info!(service = %kind, pid = handle.pid, "process alive but not ready, waiting again");
                    inner.state = ProcessState::Starting;
                    return self.await_ready(inner).await;
                }
                Ok(Some(status)) => {
                    warn!(service = %kind, pid = handle.pid, %status, "previous process had exited");
                    inner.handle = None;
                }
                Err(e) => {
                    warn!(service = %kind, error = %e, "could not query previous process");
                    inner.handle = None;
                }
            }
        }

        inner.state = ProcessState::Starting;
        match self.launch_child().await {
            Ok(handle) => inner.handle = Some(handle),
            Err(e) => {
                error!(service = %kind, error = %e, "start failed");
                inner.state = ProcessState::Failed(e.to_string());
                return Err(e);
            }
        }

        self.await_ready(inner).await
    }

    /// The handle stays tracked until termination completes, so a stop
    /// abandoned mid-wait can be retried.
    async fn stop(&self) -> Result<(), LifecycleError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let Some(handle) = inner.handle.as_mut() else {
            inner.state = ProcessState::Stopped;
            return Ok(());
        };

        inner.state = ProcessState::Stopping;
        match self.terminate(handle).await {
            Ok(forced) => {
                inner.handle = None;
                inner.state = if forced { ProcessState::Killed } else { ProcessState::Stopped };
                Ok(())
            }
            Err(e) => {
                error!(service = %self.spec.kind, error = %e, "stop failed");
                inner.state = ProcessState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn restart(&self) -> Result<(), LifecycleError> {
        if let Err(e) = self.stop().await {
            warn!(service = %self.spec.kind, error = %e, "stop before restart failed");
        }
        self.start().await
    }

    async fn check_status(&self) -> bool {
        let kind = self.spec.kind;
        let mut inner = self.inner.lock().await;
        let Some(handle) = inner.handle.as_mut() else {
            return false;
        };

        let exit = match handle.child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => Some(status.to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = exit {
            warn!(service = %kind, pid = handle.pid, reason = %reason, "unexpected stop");
            inner.handle = None;
            inner.state = ProcessState::Failed(format!("unexpected stop: {reason}"));
            return false;
        }

        self.probe.is_ready(&self.spec.readiness_url).await
    }

    async fn report(&self) -> ServiceReport {
        let inner = self.inner.lock().await;
        let handle = inner.handle.as_ref();
        ServiceReport {
            service: self.spec.kind.name(),
            kind: self.spec.kind,
            state: inner.state.clone(),
            pid: handle.map(|h| h.pid),
            instance_id: handle.map(|h| h.instance_id.clone()),
            uptime_seconds: handle
                .map(|h| (OffsetDateTime::now_utc() - h.started_at).whole_seconds().max(0) as u64),
            config_path: self.spec.config_path.clone(),
            readiness_url: self.spec.readiness_url.clone(),
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> nix::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
}

fn forward_output<R>(service: ServiceKind, stream: &'static str, pipe: Option<R>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(pipe) = pipe else { return };
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(service = %service, stream, "{line}");
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Answers not-ready `failures` times, then ready.
    struct ScriptedProbe {
        failures: u32,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self { failures, calls: AtomicU32::new(0) })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn is_ready(&self, _url: &str) -> bool {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            n >= self.failures
        }
    }

    struct CountingHook {
        runs: AtomicU32,
    }

    #[async_trait]
    impl PostStartHook for CountingHook {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self) -> Result<(), ProvisionError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Err(ProvisionError::Rejected { step: "test".into(), status: 500, body: String::new() })
        }
    }

    fn sleep_spec(dir: &tempfile::TempDir, seconds: &str, attempts: u32) -> ServiceSpec {
        ServiceSpec {
            kind: ServiceKind::Collector,
            binary: "sleep".into(),
            args: vec![seconds.into()],
            config_path: dir.path().join("conf/collector.yml"),
            config_template: "global: {}\n".into(),
            work_dirs: vec![dir.path().join("data")],
            readiness_url: "http://127.0.0.1:1/-/ready".into(),
            base_url: "http://127.0.0.1:1".into(),
            readiness_attempts: attempts,
            readiness_interval: Duration::from_millis(5),
            stop_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProcessManager::new(sleep_spec(&dir, "30", 3), ScriptedProbe::new(0));

        assert!(manager.stop().await.is_ok());
        assert!(manager.stop().await.is_ok());
        assert_eq!(manager.report().await.state, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_ready_on_last_allowed_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let probe = ScriptedProbe::new(29);
        let hook = Arc::new(CountingHook { runs: AtomicU32::new(0) });
        let manager = ProcessManager::new(sleep_spec(&dir, "30", 30), probe.clone()).with_hook(hook.clone());

        manager.start().await.unwrap();
        assert_eq!(probe.calls(), 30);
        assert_eq!(manager.report().await.state, ProcessState::Ready);
        assert_eq!(hook.runs.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("conf/collector.yml").exists());

        // live and ready: no second spawn, no second hook run
        let pid = manager.report().await.pid;
        assert!(pid.is_some_and(|p| p > 0));
        manager.start().await.unwrap();
        assert_eq!(manager.report().await.pid, pid);
        assert_eq!(hook.runs.load(Ordering::SeqCst), 1);

        manager.stop().await.unwrap();
        assert_eq!(manager.report().await.state, ProcessState::Stopped);
        assert!(manager.report().await.pid.is_none());
    }

    #[tokio::test]
    async fn test_readiness_timeout_leaves_process_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let probe = ScriptedProbe::new(u32::MAX);
        let manager = ProcessManager::new(sleep_spec(&dir, "30", 30), probe.clone());

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::ReadinessTimeout { attempts: 30, .. }));
        assert_eq!(probe.calls(), 30);

        let report = manager.report().await;
        assert!(matches!(report.state, ProcessState::Failed(_)));
        assert!(report.pid.is_some());

        manager.stop().await.unwrap();
        assert!(manager.report().await.pid.is_none());
    }

    #[tokio::test]
    async fn test_restart_replaces_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProcessManager::new(sleep_spec(&dir, "30", 3), ScriptedProbe::new(0));

        manager.start().await.unwrap();
        let first = manager.report().await.instance_id;
        manager.restart().await.unwrap();
        let second = manager.report().await;

        assert_eq!(second.state, ProcessState::Ready);
        assert!(second.instance_id.is_some());
        assert_ne!(second.instance_id, first);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = sleep_spec(&dir, "30", 3);
        spec.binary = "nexus-no-such-binary-on-path".into();
        let manager = ProcessManager::new(spec, ScriptedProbe::new(0));

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::BinaryNotFound { .. }));
        assert!(matches!(manager.report().await.state, ProcessState::Failed(_)));
        assert!(!manager.check_status().await);
        assert!(!dir.path().join("conf/collector.yml").exists());
        assert!(!dir.path().join("data").exists());
    }

    #[tokio::test]
    async fn test_abandoned_stop_keeps_process_tracked() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let dir = tempfile::tempdir().unwrap();
        let mut spec = sleep_spec(&dir, "30", 3);
        spec.binary = "sh".into();
        spec.args = vec!["-c".into(), "trap '' TERM; exec sleep 30".into()];
        spec.stop_timeout = Duration::from_millis(500);
        let manager = ProcessManager::new(spec, ScriptedProbe::new(0));

        manager.start().await.unwrap();
        let pid = manager.report().await.pid.unwrap();
        // let the shell install its trap before signalling
        tokio::time::sleep(Duration::from_millis(200)).await;

        let abandoned = tokio::time::timeout(Duration::from_millis(100), manager.stop()).await;
        assert!(abandoned.is_err());

        let report = manager.report().await;
        assert_eq!(report.pid, Some(pid));
        assert_eq!(report.state, ProcessState::Stopping);
        assert!(kill(Pid::from_raw(pid as i32), None).is_ok());

        manager.stop().await.unwrap();
        let report = manager.report().await;
        assert_eq!(report.state, ProcessState::Killed);
        assert!(report.pid.is_none());
        assert!(kill(Pid::from_raw(pid as i32), None).is_err());
    }

    #[tokio::test]
    async fn test_check_status_reaps_exited_process() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProcessManager::new(sleep_spec(&dir, "0.3", 3), ScriptedProbe::new(0));

        manager.start().await.unwrap();
        assert!(manager.check_status().await);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!manager.check_status().await);
        let report = manager.report().await;
        assert!(report.pid.is_none());
        assert!(matches!(report.state, ProcessState::Failed(ref r) if r.starts_with("unexpected stop")));
    }
}
