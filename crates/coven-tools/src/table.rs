// ABOUTME: The running-process table: one entry per tool name, shared behind a mutex.
// ABOUTME: Start/stop units, the health pass and the control socket all go through it.

use crate::launcher::RunningProcess;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// A serializable view of one table entry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessInfo {
    pub name: String,
    pub tool_id: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub command: String,
    pub log_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
}

impl From<&RunningProcess> for ProcessInfo {
    fn from(p: &RunningProcess) -> Self {
        Self {
            name: p.name.clone(),
            tool_id: p.tool_id.clone(),
            port: p.port,
            pid: p.pid,
            command: p.command.clone(),
            log_path: p.log_path.clone(),
            started_at: p.started_at,
        }
    }
}

#[derive(Clone, Default)]
pub struct ProcessTable {
    inner: Arc<Mutex<HashMap<String, RunningProcess>>>,
}

impl ProcessTable {
    /// Insert under the process name, returning any entry it displaced.
    pub async fn insert(&self, process: RunningProcess) -> Option<RunningProcess> {
        self.inner
            .lock()
            .await
            .insert(process.name.clone(), process)
    }

    pub async fn remove(&self, name: &str) -> Option<RunningProcess> {
        self.inner.lock().await.remove(name)
    }

    pub async fn get(&self, name: &str) -> Option<ProcessInfo> {
        self.inner.lock().await.get(name).map(ProcessInfo::from)
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.lock().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Entries sorted by name.
    pub async fn snapshot(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self
            .inner
            .lock()
            .await
            .values()
            .map(ProcessInfo::from)
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Drop entries whose child has exited, returning what was removed.
    pub async fn reap_exited(&self) -> Vec<ProcessInfo> {
        let mut table = self.inner.lock().await;
        let mut exited = Vec::new();
        for (name, process) in table.iter_mut() {
            if let Some(status) = process.try_exited() {
                info!(tool = %name, port = process.port, status = %status, "Tool process exited");
                exited.push(name.clone());
            }
        }

        let mut reaped: Vec<ProcessInfo> = exited
            .iter()
            .filter_map(|name| table.remove(name))
            .map(|p| ProcessInfo::from(&p))
            .collect();
        reaped.sort_by(|a, b| a.name.cmp(&b.name));
        reaped
    }

    /// Take every entry out of the table.
    pub async fn drain(&self) -> Vec<RunningProcess> {
        self.inner.lock().await.drain().map(|(_, p)| p).collect()
    }
}
