// ABOUTME: Starts and stops tool processes, capturing a bounded window of their output.
// ABOUTME: Owns child handles from spawn; stop is SIGTERM, bounded wait, then kill.

use crate::table::ProcessTable;
use crate::translate::ProcessSpec;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("empty command line for {0}")]
    EmptyCommand(String),

    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// A tool process owned by the supervisor.
#[derive(Debug)]
pub struct RunningProcess {
    pub name: String,
    pub tool_id: String,
    pub port: u16,
    pub command: String,
    pub pid: Option<u32>,
    pub log_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    child: Option<Child>,
}

impl RunningProcess {
    /// A table entry with no OS process behind it.
    pub fn detached(spec: &ProcessSpec, log_path: Option<PathBuf>) -> Self {
        Self {
            name: spec.name.clone(),
            tool_id: spec.tool_id.clone(),
            port: spec.port,
            command: spec.command.clone(),
            pid: None,
            log_path,
            started_at: Utc::now(),
            child: None,
        }
    }

    pub fn has_child(&self) -> bool {
        self.child.is_some()
    }

    /// Exit status text if the child has exited. Detached entries never exit.
    pub fn try_exited(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({e})")),
        }
    }

    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn start(&self, spec: &ProcessSpec) -> Result<RunningProcess, LaunchError>;

    /// Best effort; never fails and never waits longer than the stop timeout
    /// plus a kill.
    async fn stop(&self, process: RunningProcess);
}

pub type SharedLauncher = Arc<dyn Launcher>;

/// Filesystem-safe log file name for a tool.
pub fn log_file_name(name: &str) -> String {
    let safe: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.log", safe)
}

pub fn log_path(logs_dir: &Path, name: &str) -> PathBuf {
    logs_dir.join(log_file_name(name))
}

pub struct ProcessLauncher {
    logs_dir: PathBuf,
    log_capture: Duration,
    stop_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(logs_dir: PathBuf, log_capture: Duration, stop_timeout: Duration) -> Self {
        Self {
            logs_dir,
            log_capture,
            stop_timeout,
        }
    }

    async fn open_log(&self, name: &str) -> Option<(PathBuf, File)> {
        let path = log_path(&self.logs_dir, name);
        if let Err(e) = tokio::fs::create_dir_all(&self.logs_dir).await {
            warn!(tool = %name, error = %e, "Cannot create logs dir, discarding output");
            return None;
        }
        match File::create(&path).await {
            Ok(file) => Some((path, file)),
            Err(e) => {
                warn!(tool = %name, path = %path.display(), error = %e, "Cannot open log file, discarding output");
                None
            }
        }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn start(&self, spec: &ProcessSpec) -> Result<RunningProcess, LaunchError> {
        let program = spec
            .program()
            .ok_or_else(|| LaunchError::EmptyCommand(spec.name.clone()))?;

        let log = self.open_log(&spec.name).await;

        let mut cmd = Command::new(program);
        cmd.args(spec.args()).stdin(Stdio::null()).kill_on_drop(true);
        if log.is_some() {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            name: spec.name.clone(),
            source,
        })?;
        let pid = child.id();

        let log_path = match log {
            Some((path, file)) => {
                let sink = Arc::new(Mutex::new(file));
                let deadline = Instant::now() + self.log_capture;
                if let Some(stdout) = child.stdout.take() {
                    tokio::spawn(pump(stdout, Some(sink.clone()), deadline));
                }
                if let Some(stderr) = child.stderr.take() {
                    tokio::spawn(pump(stderr, Some(sink), deadline));
                }
                Some(path)
            }
            None => None,
        };

        info!(tool = %spec.name, port = spec.port, pid = ?pid, "Started tool process");

        Ok(RunningProcess {
            name: spec.name.clone(),
            tool_id: spec.tool_id.clone(),
            port: spec.port,
            command: spec.command.clone(),
            pid,
            log_path,
            started_at: Utc::now(),
            child: Some(child),
        })
    }

    async fn stop(&self, mut process: RunningProcess) {
        let Some(mut child) = process.take_child() else {
            debug!(tool = %process.name, "No owned child to stop");
            return;
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!(tool = %process.name, pid, error = %e, "SIGTERM failed");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(tool = %process.name, ?status, "Tool process exited");
            }
            Ok(Err(e)) => {
                warn!(tool = %process.name, error = %e, "Error waiting for tool process");
            }
            Err(_) => {
                warn!(
                    tool = %process.name,
                    timeout_secs = self.stop_timeout.as_secs(),
                    "Tool process did not exit in time, killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(tool = %process.name, error = %e, "Failed to kill tool process");
                }
            }
        }
    }
}

/// Copy output into the log until `deadline`, then keep draining into nothing
/// so the child never blocks on a full pipe.
async fn pump<R>(mut reader: R, mut sink: Option<Arc<Mutex<File>>>, deadline: Instant)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        if sink.is_some() && Instant::now() >= deadline {
            debug!("Log capture window closed");
            sink = None;
        }

        let Some(file) = sink.as_ref() else {
            continue;
        };
        let mut file = file.lock().await;
        let written = match file.write_all(&buf[..n]).await {
            Ok(()) => file.flush().await.is_ok(),
            Err(_) => false,
        };
        drop(file);
        if !written {
            sink = None;
        }
    }
}

/// Per-tool outcome of a batch start.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub started: Vec<String>,
    /// (name, error text)
    pub failed: Vec<(String, String)>,
}

/// Start every spec concurrently, one task per tool, and wait for all of them.
///
/// Any entry already tracked under a spec's name is stopped before that spec
/// is spawned. Each success is inserted into `table`; a failure only affects
/// its own tool.
pub async fn start_batch(
    launcher: &SharedLauncher,
    table: &ProcessTable,
    specs: Vec<ProcessSpec>,
) -> BatchOutcome {
    let mut set = JoinSet::new();
    for spec in specs {
        let launcher = launcher.clone();
        let table = table.clone();
        set.spawn(async move {
            let name = spec.name.clone();
            // The old instance must release the port before the new one binds it.
            if let Some(previous) = table.remove(&name).await {
                info!(tool = %name, pid = ?previous.pid, "Stopping previous instance before start");
                launcher.stop(previous).await;
            }
            match launcher.start(&spec).await {
                Ok(process) => {
                    if let Some(previous) = table.insert(process).await {
                        // Only a concurrent start of the same name lands here.
                        warn!(tool = %name, "Replaced a running entry started concurrently");
                        launcher.stop(previous).await;
                    }
                    Ok(name)
                }
                Err(e) => {
                    warn!(tool = %name, error = %e, "Failed to start tool");
                    Err((name, e.to_string()))
                }
            }
        });
    }

    let mut outcome = BatchOutcome::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(name)) => outcome.started.push(name),
            Ok(Err(failure)) => outcome.failed.push(failure),
            Err(e) => warn!(error = %e, "Start task panicked"),
        }
    }
    outcome.started.sort();
    outcome.failed.sort();
    outcome
}

/// Remove each named tool from the table and stop it, concurrently.
///
/// Entries are removed up front, so a slow or failed stop never leaves a
/// stale entry behind.
pub async fn stop_batch(launcher: &SharedLauncher, table: &ProcessTable, names: &[String]) -> Vec<String> {
    let mut set = JoinSet::new();
    for name in names {
        let Some(process) = table.remove(name).await else {
            debug!(tool = %name, "Nothing running to stop");
            continue;
        };
        let launcher = launcher.clone();
        set.spawn(async move {
            let name = process.name.clone();
            launcher.stop(process).await;
            name
        });
    }

    let mut stopped = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(name) => stopped.push(name),
            Err(e) => warn!(error = %e, "Stop task panicked"),
        }
    }
    stopped.sort();
    stopped
}
