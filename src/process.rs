use crate::config::RouteDescriptor;
use crate::logconf;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL during shutdown
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A supervised backend process. Presence in the registry means the
/// process was launched and not yet stopped; the exit path is recorded
/// in [`StopResult`] rather than on the handle.
struct BackendProcess {
    child: Child,
    started_at: Instant,
}

/// How one backend's stop attempt ended
#[derive(Debug)]
pub enum StopResult {
    /// Exited within the grace period
    Exited,
    /// Did not exit in time and was SIGKILLed
    ForceKilled,
    /// Stop failed outright (logged, never fatal)
    Error(String),
}

/// Per-backend outcome collected by [`Supervisor::stop_all`]
#[derive(Debug)]
pub struct StopOutcome {
    pub name: String,
    pub result: StopResult,
}

/// Owns every backend process. No other component holds process handles;
/// the registry is the only shared-mutable state in the gateway.
///
/// `Supervisor` is designed to be used behind an `Arc`; the constructor
/// returns `Arc<Self>` to enforce this.
pub struct Supervisor {
    /// Live processes keyed by backend name
    handles: DashMap<String, Mutex<BackendProcess>>,
    /// Descriptor for each backend
    descriptors: HashMap<String, RouteDescriptor>,
    /// Directory for materialized log-config files
    log_dir: PathBuf,
    /// Log level passed to backends via --log-level
    log_level: String,
}

impl Supervisor {
    pub fn new(
        routers: Vec<RouteDescriptor>,
        log_dir: impl Into<PathBuf>,
        log_level: impl Into<String>,
    ) -> Arc<Self> {
        let descriptors = routers.into_iter().map(|r| (r.name.clone(), r)).collect();
        Arc::new(Self {
            handles: DashMap::new(),
            descriptors,
            log_dir: log_dir.into(),
            log_level: log_level.into(),
        })
    }

    /// Whether a live process exists for this backend
    pub fn is_running(&self, name: &str) -> bool {
        self.handles
            .get(name)
            .map(|p| matches!(p.lock().child.try_wait(), Ok(None)))
            .unwrap_or(false)
    }

    /// The OS pid of a running backend
    pub fn pid(&self, name: &str) -> Option<u32> {
        self.handles.get(name).and_then(|p| p.lock().child.id())
    }

    /// Launch a backend process. Idempotent: a live handle for the same
    /// name makes this a no-op.
    pub async fn start(&self, name: &str) -> anyhow::Result<()> {
        let descriptor = self
            .descriptors
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown backend: {}", name))?;

        if self.is_running(name) {
            debug!(backend = name, "Backend already running");
            return Ok(());
        }

        let log_file = descriptor.log_file();
        let log_config =
            logconf::materialize(&self.log_dir, name, &log_file, &self.log_level)?;

        let argv = shell_words::split(&descriptor.command)
            .map_err(|e| anyhow::anyhow!("backend '{}': invalid launch command: {}", name, e))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("backend '{}': empty launch command", name))?;

        info!(
            backend = name,
            command = %descriptor.command,
            host = %descriptor.host,
            port = descriptor.port,
            "Starting backend"
        );

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--host")
            .arg(&descriptor.host)
            .arg("--port")
            .arg(descriptor.port.to_string())
            .arg("--log-level")
            .arg(&self.log_level)
            .arg("--log-config")
            .arg(&log_config)
            .args(&descriptor.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!("backend '{}': failed to spawn '{}': {}", name, program, e)
        })?;
        let pid = child.id().unwrap_or(0);

        forward_output(name, &mut child);

        info!(backend = name, pid, "Backend process spawned");

        self.handles.insert(
            name.to_string(),
            Mutex::new(BackendProcess {
                child,
                started_at: Instant::now(),
            }),
        );

        Ok(())
    }

    /// Launch every configured backend
    pub async fn start_all(&self) -> anyhow::Result<()> {
        let names: Vec<String> = self.descriptors.keys().cloned().collect();
        for name in names {
            self.start(&name).await?;
        }
        Ok(())
    }

    /// Gracefully stop every backend: SIGTERM, wait up to the grace
    /// period, SIGKILL stragglers. The registry is cleared even when
    /// individual stops fail.
    pub async fn stop_all(&self) -> Vec<StopOutcome> {
        let names: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        let mut outcomes = Vec::with_capacity(names.len());

        for name in names {
            let Some((_, process)) = self.handles.remove(&name) else {
                continue;
            };
            let mut process = process.into_inner();
            debug!(
                backend = %name,
                uptime_secs = process.started_at.elapsed().as_secs(),
                "Stopping backend"
            );

            let result = stop_process(&name, &mut process.child).await;
            outcomes.push(StopOutcome { name, result });
        }

        // Registry is cleared no matter how the individual stops went
        self.handles.clear();

        for outcome in &outcomes {
            match &outcome.result {
                StopResult::Exited => debug!(backend = %outcome.name, "Backend stopped"),
                StopResult::ForceKilled => {
                    warn!(backend = %outcome.name, "Backend required SIGKILL")
                }
                StopResult::Error(e) => {
                    warn!(backend = %outcome.name, error = %e, "Backend stop failed")
                }
            }
        }

        outcomes
    }

    /// Number of live handles in the registry
    pub fn running_count(&self) -> usize {
        self.handles.len()
    }
}

/// Forward a child's stdout/stderr lines into the gateway log, tagged
/// with the backend name.
fn forward_output(name: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let backend = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(backend = %backend, stream = "stdout", "{}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let backend = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(backend = %backend, stream = "stderr", "{}", line);
            }
        });
    }
}

async fn stop_process(name: &str, child: &mut Child) -> StopResult {
    if let Some(pid) = child.id() {
        info!(backend = name, pid, "Sending SIGTERM to backend");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await {
        Ok(Ok(status)) => {
            info!(backend = name, ?status, "Backend exited gracefully");
            StopResult::Exited
        }
        Ok(Err(e)) => {
            warn!(backend = name, error = %e, "Error waiting for backend to exit");
            StopResult::Error(e.to_string())
        }
        Err(_) => {
            warn!(
                backend = name,
                grace_period_secs = STOP_GRACE_PERIOD.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            match child.kill().await {
                Ok(()) => StopResult::ForceKilled,
                Err(e) => StopResult::Error(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper(name: &str, port: u16, log_dir: &std::path::Path) -> RouteDescriptor {
        RouteDescriptor {
            name: name.to_string(),
            // sh swallows the --host/--port args the supervisor appends
            command: "sh -c 'sleep 60'".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            prefix: Some(format!("/{}", name)),
            log_target: Some(
                log_dir
                    .join(format!("{}.log", name))
                    .to_string_lossy()
                    .into_owned(),
            ),
            extra_args: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_start_unknown_backend() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(Vec::new(), dir.path(), "info");
        let err = supervisor.start("ghost").await.unwrap_err();
        assert!(err.to_string().contains("unknown backend"));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(
            vec![sleeper("a", 19801, dir.path())],
            dir.path(),
            "info",
        );

        supervisor.start("a").await.unwrap();
        assert!(supervisor.is_running("a"));
        let pid = supervisor.pid("a").unwrap();

        // Second start is a no-op: same process, one registry entry
        supervisor.start("a").await.unwrap();
        assert_eq!(supervisor.pid("a"), Some(pid));
        assert_eq!(supervisor.running_count(), 1);

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_start_writes_log_config() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(
            vec![sleeper("a", 19802, dir.path())],
            dir.path(),
            "info",
        );

        supervisor.start("a").await.unwrap();
        assert!(dir.path().join("a.log-config.json").exists());

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_all_clears_registry() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(
            vec![
                sleeper("a", 19803, dir.path()),
                sleeper("b", 19804, dir.path()),
            ],
            dir.path(),
            "info",
        );

        supervisor.start_all().await.unwrap();
        assert_eq!(supervisor.running_count(), 2);

        let outcomes = supervisor.stop_all().await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(supervisor.running_count(), 0);
        assert!(!supervisor.is_running("a"));
        assert!(!supervisor.is_running("b"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_all_force_kills_backend_ignoring_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let mut descriptor = sleeper("stubborn", 19806, dir.path());
        // trap "" TERM makes the shell ignore the graceful stop signal;
        // the loop keeps the shell itself alive rather than exec'ing
        descriptor.command = r#"sh -c 'trap "" TERM; while true; do sleep 1; done'"#.to_string();
        let supervisor = Supervisor::new(vec![descriptor], dir.path(), "info");

        supervisor.start("stubborn").await.unwrap();
        assert!(supervisor.is_running("stubborn"));

        let outcomes = supervisor.stop_all().await;
        assert_eq!(outcomes.len(), 1);
        assert!(
            matches!(outcomes[0].result, StopResult::ForceKilled),
            "expected a forced kill, got {:?}",
            outcomes[0].result
        );
        // The registry is empty even though the stop needed SIGKILL
        assert_eq!(supervisor.running_count(), 0);
        assert!(!supervisor.is_running("stubborn"));
    }

    #[tokio::test]
    async fn test_stop_all_on_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(Vec::new(), dir.path(), "info");
        let outcomes = supervisor.stop_all().await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut descriptor = sleeper("a", 19805, dir.path());
        descriptor.command = "/nonexistent/binary".to_string();
        let supervisor = Supervisor::new(vec![descriptor], dir.path(), "info");

        let err = supervisor.start("a").await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
        assert!(!supervisor.is_running("a"));
    }
}
