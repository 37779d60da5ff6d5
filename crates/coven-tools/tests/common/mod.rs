// ABOUTME: Shared fakes for coven-tools integration tests.
// ABOUTME: In-memory store, recording launcher, scripted port/listener probes, wiring harness.

#![allow(dead_code)]

use async_trait::async_trait;
use coven_tools::cache::ToolSpecCache;
use coven_tools::clock::ManualClock;
use coven_tools::health::{ConnectProbe, HealthChecker};
use coven_tools::launcher::{log_path, LaunchError, Launcher, RunningProcess, SharedLauncher};
use coven_tools::listeners::{Listener, ListenerInspector};
use coven_tools::ports::{PortAllocator, PortProbe};
use coven_tools::reconcile::Reconciler;
use coven_tools::restart::RestartPolicy;
use coven_tools::state::StateFile;
use coven_tools::status::StatusChecker;
use coven_tools::supervisor::Supervisor;
use coven_tools::table::ProcessTable;
use coven_tools::translate::ProcessSpec;
use coven_tools_core::{
    Error, PortsConfig, Released, Result, StatusUpdate, ToolSpec, ToolVersion,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const PROXY: &str = "mcp-proxy";
pub const READY: &str = "Uvicorn running on";

pub fn tool(id: &str, name: &str, port: &str, args: &str) -> ToolSpec {
    tool_with_env(id, name, port, args, &[])
}

pub fn tool_with_env(id: &str, name: &str, port: &str, args: &str, env: &[(&str, &str)]) -> ToolSpec {
    ToolSpec {
        tool_id: id.into(),
        name: name.into(),
        company_id: None,
        versions: vec![ToolVersion {
            version: "1".into(),
            released: Some(Released {
                args: args.into(),
                port: port.into(),
                env: env
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }],
        on_status: "Online".into(),
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    tools: Mutex<Vec<ToolSpec>>,
    pub version_writes: Mutex<Vec<(String, Vec<ToolVersion>)>>,
    pub status_writes: Mutex<Vec<StatusUpdate>>,
    pub down: AtomicBool,
}

impl MemoryStore {
    pub fn new(tools: Vec<ToolSpec>) -> Arc<Self> {
        let store = Self::default();
        *store.tools.lock().unwrap() = tools;
        Arc::new(store)
    }

    pub fn set_tools(&self, tools: Vec<ToolSpec>) {
        *self.tools.lock().unwrap() = tools;
    }

    pub fn tools(&self) -> Vec<ToolSpec> {
        self.tools.lock().unwrap().clone()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn version_write_ids(&self) -> Vec<String> {
        self.version_writes
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Latest written status text per tool id.
    pub fn last_statuses(&self) -> HashMap<String, StatusUpdate> {
        self.status_writes
            .lock()
            .unwrap()
            .iter()
            .map(|u| (u.tool_id.clone(), u.clone()))
            .collect()
    }

    fn check_up(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(Error::StoreUnavailable("store is down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl coven_tools::store::ToolStore for MemoryStore {
    async fn fetch_tools(&self) -> Result<Vec<ToolSpec>> {
        self.check_up()?;
        Ok(self.tools())
    }

    async fn update_versions(&self, tool_id: &str, versions: &[ToolVersion]) -> Result<()> {
        self.check_up()?;
        self.version_writes
            .lock()
            .unwrap()
            .push((tool_id.to_string(), versions.to_vec()));
        if let Some(t) = self
            .tools
            .lock()
            .unwrap()
            .iter_mut()
            .find(|t| t.tool_id == tool_id)
        {
            t.versions = versions.to_vec();
        }
        Ok(())
    }

    async fn update_statuses(&self, updates: &[StatusUpdate]) -> Result<()> {
        self.check_up()?;
        self.status_writes
            .lock()
            .unwrap()
            .extend(updates.iter().cloned());
        let mut tools = self.tools.lock().unwrap();
        for update in updates {
            if let Some(t) = tools.iter_mut().find(|t| t.tool_id == update.tool_id) {
                t.on_status = update.on_status.clone();
                if let Some(v) = &update.versions {
                    t.versions = v.clone();
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Launcher
// ============================================================================

/// Records every start and stop in order; never spawns anything.
///
/// With a log directory set, each start also writes a log containing the
/// readiness marker, as a healthy proxy would.
#[derive(Default)]
pub struct RecordingLauncher {
    pub events: Mutex<Vec<String>>,
    failing: Mutex<BTreeSet<String>>,
    logs_dir: Mutex<Option<PathBuf>>,
}

impl RecordingLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn write_ready_logs(&self, dir: PathBuf) {
        *self.logs_dir.lock().unwrap() = Some(dir);
    }

    pub fn fail(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn heal(&self, name: &str) {
        self.failing.lock().unwrap().remove(name);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn starts(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("start:").map(str::to_string))
            .collect()
    }

    pub fn stops(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("stop:").map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl Launcher for RecordingLauncher {
    async fn start(&self, spec: &ProcessSpec) -> std::result::Result<RunningProcess, LaunchError> {
        if self.failing.lock().unwrap().contains(&spec.name) {
            return Err(LaunchError::Spawn {
                name: spec.name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such binary"),
            });
        }
        self.events
            .lock()
            .unwrap()
            .push(format!("start:{}", spec.name));
        let dir = self.logs_dir.lock().unwrap().clone();
        let log = dir.map(|dir| {
            let path = log_path(&dir, &spec.name);
            std::fs::write(&path, format!("INFO: {} http://127.0.0.1:{}\n", READY, spec.port))
                .unwrap();
            path
        });
        Ok(RunningProcess::detached(spec, log))
    }

    async fn stop(&self, process: RunningProcess) {
        self.events
            .lock()
            .unwrap()
            .push(format!("stop:{}", process.name));
    }
}

// ============================================================================
// Probes
// ============================================================================

/// Every port is bindable except the listed ones.
#[derive(Default)]
pub struct ScriptedPorts {
    pub busy: Mutex<BTreeSet<u16>>,
}

impl PortProbe for ScriptedPorts {
    fn is_free(&self, _host: &str, port: u16) -> bool {
        !self.busy.lock().unwrap().contains(&port)
    }
}

#[async_trait]
impl ConnectProbe for ScriptedPorts {
    async fn can_connect(&self, port: u16, _timeout: Duration) -> bool {
        self.busy.lock().unwrap().contains(&port)
    }
}

#[derive(Default)]
pub struct ScriptedListeners {
    pub listeners: Mutex<HashMap<u16, Listener>>,
}

impl ScriptedListeners {
    pub fn listen(&self, port: u16, cmdline: Option<&str>) {
        self.listeners.lock().unwrap().insert(
            port,
            Listener {
                port,
                pid: Some(4242),
                cmdline: cmdline.map(str::to_string),
            },
        );
    }

    pub fn close(&self, port: u16) {
        self.listeners.lock().unwrap().remove(&port);
    }
}

#[async_trait]
impl ListenerInspector for ScriptedListeners {
    async fn inspect(&self, ports: &[u16]) -> HashMap<u16, Listener> {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .filter(|(port, _)| ports.contains(port))
            .map(|(port, l)| (*port, l.clone()))
            .collect()
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub launcher: Arc<RecordingLauncher>,
    pub clock: Arc<ManualClock>,
    pub ports: Arc<ScriptedPorts>,
    pub listeners: Arc<ScriptedListeners>,
    pub table: ProcessTable,
    pub cache: Arc<ToolSpecCache>,
    pub allocator: Arc<PortAllocator>,
    pub state: Arc<StateFile>,
    pub reconciler: Arc<Reconciler>,
    pub status: Arc<StatusChecker>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(tools: Vec<ToolSpec>) -> Self {
        Self::with_range(tools, 10_000, 11_999)
    }

    pub fn with_range(tools: Vec<ToolSpec>, start: u16, end: u16) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(tools);
        let launcher = RecordingLauncher::new();
        let clock = Arc::new(ManualClock::default());
        let ports = Arc::new(ScriptedPorts::default());
        let listeners = Arc::new(ScriptedListeners::default());
        let table = ProcessTable::default();

        let cache = Arc::new(ToolSpecCache::new(
            store.clone(),
            clock.clone(),
            Duration::from_secs(60),
        ));
        let config = PortsConfig {
            start,
            end,
            ..PortsConfig::default()
        };
        let allocator = Arc::new(PortAllocator::new(
            &config,
            store.clone(),
            clock.clone(),
            ports.clone(),
        ));
        let state = Arc::new(StateFile::new(dir.path().join("manager_state.json")));
        let shared_launcher: SharedLauncher = launcher.clone();

        let reconciler = Arc::new(Reconciler::new(
            cache.clone(),
            allocator.clone(),
            shared_launcher.clone(),
            table.clone(),
            state.clone(),
            PROXY,
        ));
        let policy = Arc::new(RestartPolicy::new(
            Duration::from_secs(15 * 60),
            clock.clone(),
        ));
        let status = Arc::new(StatusChecker::new(
            cache.clone(),
            listeners.clone(),
            shared_launcher,
            table.clone(),
            allocator.clone(),
            policy,
            PROXY,
            Some("predefined-co".to_string()),
        ));

        Self {
            store,
            launcher,
            clock,
            ports,
            listeners,
            table,
            cache,
            allocator,
            state,
            reconciler,
            status,
            dir,
        }
    }

    /// Running table as name -> port.
    pub async fn running(&self) -> BTreeMap<String, u16> {
        self.table
            .snapshot()
            .await
            .into_iter()
            .map(|p| (p.name, p.port))
            .collect()
    }

    /// A supervisor over this harness's components, probing ports via
    /// `ports` and reading readiness from launcher logs.
    pub fn supervisor(&self, reconcile_every: Duration, status_every: Duration) -> Supervisor {
        let health = Arc::new(HealthChecker::new(
            self.table.clone(),
            self.ports.clone(),
            READY,
            Duration::from_millis(50),
        ));
        Supervisor::new(
            self.reconciler.clone(),
            self.status.clone(),
            health,
            self.state.clone(),
            reconcile_every,
            status_every,
        )
    }

    /// Move past every TTL so the next read hits the store.
    pub fn expire_caches(&self) {
        self.clock.advance(chrono::Duration::seconds(61));
    }
}
